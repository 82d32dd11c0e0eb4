//! Reconciliation of NSTemplateSets into namespaces, cluster resources and space roles.
//!
//! Every `ensure` performs at most one mutation and reports whether it did; the
//! [`reconciler::Reconciler`] returns after the first phase that changed something
//! and relies on being invoked again until everything converged.

use std::collections::BTreeMap;

use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use tracing::*;

use crate::client::ApiClient;
use crate::template::gvk_of;
use crate::Result;

pub mod cluster_resources;
pub mod controller;
pub mod features;
pub mod namespaces;
pub mod reconciler;
pub mod space_roles;
pub mod status;
pub mod tier_templates;

pub use controller::run;

pub const SPACE_NAME_PARAM: &str = "SPACE_NAME";
pub const USERNAME_PARAM: &str = "USERNAME";
pub const NAMESPACE_PARAM: &str = "NAMESPACE";
pub const MEMBER_OPERATOR_NAMESPACE_PARAM: &str = "MEMBER_OPERATOR_NAMESPACE";

/// Template parameters, always including the member operator namespace
pub(crate) fn template_params(api: &ApiClient, params: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut values: BTreeMap<String, String> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    values.insert(
        MEMBER_OPERATOR_NAMESPACE_PARAM.into(),
        api.operator_namespace.clone(),
    );
    values
}

/// Parameters of the cluster resources and namespace templates of a space
pub(crate) fn space_params(api: &ApiClient, space: &str) -> BTreeMap<String, String> {
    template_params(api, &[(SPACE_NAME_PARAM, space), (USERNAME_PARAM, space)])
}

fn same_gvk_and_name(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.name_any() == b.name_any()
        && matches!((gvk_of(a), gvk_of(b)), (Ok(ga), Ok(gb)) if ga == gb)
}

/// Delete the objects of `current` which have no counterpart of the same kind and name in `desired`.
///
/// Objects already gone are skipped. Returns whether anything was deleted.
pub(crate) async fn delete_redundant_objects(
    api: &ApiClient,
    current: &[DynamicObject],
    desired: &[DynamicObject],
) -> Result<bool> {
    let mut deleted = false;
    for obj in current {
        if desired.iter().any(|d| same_gvk_and_name(obj, d)) {
            continue;
        }
        let gvk = gvk_of(obj)?;
        let name = obj.name_any();
        info!(kind = %gvk.kind, name = %name, "deleting redundant object");
        let existed = api
            .client
            .delete(
                &ApiResource::from_gvk(&gvk),
                obj.metadata.namespace.as_deref(),
                &name,
            )
            .await
            .map_err(|e| {
                e.context(format!(
                    "failed to delete the redundant object {} '{}'",
                    gvk.kind, name
                ))
            })?;
        deleted |= existed;
    }
    Ok(deleted)
}
