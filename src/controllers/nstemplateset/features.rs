use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::resources::nstemplatesets::{NSTemplateSet, FEATURE_TOGGLE_NAME_ANNOTATION_KEY};

pub fn split_comma_separated_list(s: &str) -> Vec<String> {
    if s.is_empty() {
        return vec![];
    }
    s.split(',').map(String::from).collect()
}

/// Whether a template object is enabled for the NSTemplateSet.
///
/// Objects without a feature annotation are always enabled. Feature objects are enabled
/// only when their feature is listed in the feature toggles of the NSTemplateSet.
pub fn should_create(obj: &DynamicObject, tmpl: &NSTemplateSet) -> bool {
    let Some(feature) = obj.annotations().get(FEATURE_TOGGLE_NAME_ANNOTATION_KEY) else {
        return true;
    };
    match tmpl.feature_toggles() {
        None => false,
        Some(winners) => split_comma_separated_list(winners)
            .iter()
            .any(|w| w == feature),
    }
}
