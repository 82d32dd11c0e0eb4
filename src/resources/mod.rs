pub mod clusterresourcequotas;
pub mod idlers;
pub mod nstemplatesets;
pub mod tiertemplates;
