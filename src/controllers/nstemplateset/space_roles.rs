use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::*;

use super::namespaces::{is_active, is_terminating};
use super::status::{Failure, StatusManager};
use super::{
    delete_redundant_objects, template_params, NAMESPACE_PARAM, SPACE_NAME_PARAM, USERNAME_PARAM,
};
use crate::client::ApiClient;
use crate::resources::nstemplatesets::{
    NSTemplateSet, NSTemplateSetSpaceRole, LAST_APPLIED_SPACE_ROLES_ANNOTATION_KEY,
    OWNER_LABEL_KEY, PROVIDER_LABEL_KEY, PROVIDER_LABEL_VALUE, SPACE_LABEL_KEY,
};
use crate::{Error, Result};

/// Grants the space roles in every namespace of the space.
///
/// The roles last applied to a namespace are kept in an annotation on it, so that the
/// objects of roles or users removed from the spec can be deleted.
pub struct SpaceRolesManager {
    api: ApiClient,
    status: Arc<StatusManager>,
}

/// The space roles recorded on the namespace, none if it was never annotated
fn last_applied_space_roles(ns: &Namespace) -> Result<Vec<NSTemplateSetSpaceRole>> {
    match ns.annotations().get(LAST_APPLIED_SPACE_ROLES_ANNOTATION_KEY) {
        Some(roles) if !roles.is_empty() => serde_json::from_str(roles)
            .map_err(|e| Error::from(e).context("unable to decode current space roles in annotation")),
        _ => Ok(vec![]),
    }
}

impl SpaceRolesManager {
    pub fn new(api: ApiClient, status: Arc<StatusManager>) -> Self {
        Self { api, status }
    }

    /// Bring the space roles of one namespace in line with the spec per call
    #[instrument(skip(self, tmpl), fields(space = %tmpl.name_any()))]
    pub async fn ensure(&self, tmpl: &mut NSTemplateSet) -> Result<bool> {
        let space = tmpl.name_any();
        let mut namespaces = match self.api.client.list_namespaces(&tmpl.owner_labels()).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::Provision,
                        e,
                        format!("failed to list namespaces for workspace '{space}'"),
                    )
                    .await)
            }
        };
        namespaces.sort_by_key(|ns| ns.name_any());
        debug!(
            namespaces = namespaces.len(),
            roles = tmpl.spec.space_roles.len(),
            "ensuring space roles"
        );

        for ns in namespaces.iter().filter(|ns| is_active(ns) && !is_terminating(ns)) {
            let name = ns.name_any();
            let last_applied = last_applied_space_roles(ns)?;
            if last_applied == tmpl.spec.space_roles {
                continue;
            }
            self.status
                .set_status_updating_if_not_provisioning(tmpl)
                .await?;

            let last_applied_objs = match self.space_role_objects(&name, &last_applied).await {
                Ok(objs) => objs,
                Err(e) => {
                    return Err(self
                        .status
                        .wrap_error(
                            tmpl,
                            Failure::SpaceRoles,
                            e,
                            "failed to retrieve last applied space roles",
                        )
                        .await)
                }
            };
            let new_objs = match self.space_role_objects(&name, &tmpl.spec.space_roles).await {
                Ok(objs) => objs,
                Err(e) => {
                    return Err(self
                        .status
                        .wrap_error(
                            tmpl,
                            Failure::SpaceRoles,
                            e,
                            "failed to retrieve space roles to apply",
                        )
                        .await)
                }
            };

            info!(namespace = %name, objects = new_objs.len(), "applying space roles");
            if let Err(e) = delete_redundant_objects(&self.api, &last_applied_objs, &new_objs).await {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::SpaceRoles,
                        e,
                        format!("failed to delete redundant objects in namespace '{name}'"),
                    )
                    .await);
            }

            let labels = BTreeMap::from([
                (
                    PROVIDER_LABEL_KEY.to_string(),
                    PROVIDER_LABEL_VALUE.to_string(),
                ),
                (OWNER_LABEL_KEY.to_string(), space.clone()),
                (SPACE_LABEL_KEY.to_string(), space.clone()),
            ]);
            if let Err(e) = self.api.apply_toolchain_objects(new_objs, &labels).await {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::SpaceRoles,
                        e,
                        format!("failed to provision namespace '{name}' with space roles"),
                    )
                    .await);
            }

            let applied = serde_json::to_string(&tmpl.spec.space_roles)?;
            let annotations =
                BTreeMap::from([(LAST_APPLIED_SPACE_ROLES_ANNOTATION_KEY.to_string(), applied)]);
            if let Err(e) = self
                .api
                .client
                .patch_namespace_metadata(&name, &BTreeMap::new(), &annotations)
                .await
            {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::SpaceRoles,
                        e,
                        format!("failed to update namespace with '{LAST_APPLIED_SPACE_ROLES_ANNOTATION_KEY}' annotation"),
                    )
                    .await);
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// The objects of every role, rendered once per user of the role
    async fn space_role_objects(
        &self,
        namespace: &str,
        roles: &[NSTemplateSetSpaceRole],
    ) -> Result<Vec<DynamicObject>> {
        let mut objs = vec![];
        for role in roles {
            let template = self
                .api
                .tier_templates
                .get_tier_template(self.api.host.as_ref(), &role.template_ref)
                .await?;
            for username in &role.usernames {
                let params = template_params(
                    &self.api,
                    &[
                        (NAMESPACE_PARAM, namespace),
                        (USERNAME_PARAM, username),
                        (SPACE_NAME_PARAM, username),
                    ],
                );
                let rendered = template.process(&params, &[]).map_err(|e| {
                    e.context(format!(
                        "failed to process space roles template '{}' for the user '{}' in namespace '{}'",
                        role.template_ref, username, namespace
                    ))
                })?;
                objs.extend(rendered.into_iter().map(|mut obj| {
                    obj.metadata
                        .namespace
                        .get_or_insert_with(|| namespace.to_string());
                    obj
                }));
            }
        }
        Ok(objs)
    }
}
