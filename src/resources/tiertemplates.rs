use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::template::Template;

/// A revision of one template of a tier, stored on the host cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq)]
#[kube(
    kind = "TierTemplate",
    group = "toolchain.dev.openshift.com",
    version = "v1alpha1",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct TierTemplateSpec {
    pub tier_name: String,
    /// The namespace type (eg. `dev`), or `clusterresources`
    pub r#type: String,
    pub revision: String,
    pub template: Template,
}
