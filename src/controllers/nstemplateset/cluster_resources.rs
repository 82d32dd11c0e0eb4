use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Resource, ResourceExt};
use tracing::*;

use super::features::should_create;
use super::space_params;
use super::status::{Failure, StatusManager};
use super::tier_templates::ResolvedTierTemplate;
use crate::client::{api_group_is_present, ApiClient};
use crate::resources::clusterresourcequotas::ClusterResourceQuota;
use crate::resources::idlers::Idler;
use crate::resources::nstemplatesets::{
    NSTemplateSet, CLUSTER_RESOURCES_TEMPLATE_TYPE, PROVIDER_LABEL_KEY, PROVIDER_LABEL_VALUE,
    SPACE_LABEL_KEY, TEMPLATE_REF_LABEL_KEY, TIER_LABEL_KEY, TYPE_LABEL_KEY,
};
use crate::template::Filter;
use crate::Result;

/// The cluster-scoped kinds a tier may provision, in the order they are reconciled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterResourceKind {
    Quota,
    ClusterRoleBinding,
    Idler,
}

fn erase<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

impl ClusterResourceKind {
    pub const ALL: [ClusterResourceKind; 3] = [
        ClusterResourceKind::Quota,
        ClusterResourceKind::ClusterRoleBinding,
        ClusterResourceKind::Idler,
    ];

    pub fn api_resource(&self) -> ApiResource {
        match self {
            ClusterResourceKind::Quota => erase::<ClusterResourceQuota>(),
            ClusterResourceKind::ClusterRoleBinding => erase::<ClusterRoleBinding>(),
            ClusterResourceKind::Idler => erase::<Idler>(),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let ar = self.api_resource();
        GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind)
    }

    /// The objects of this kind owned by the space, or none if the cluster does not serve the kind
    pub async fn list_if_available(
        &self,
        api: &ApiClient,
        tmpl: &NSTemplateSet,
    ) -> Result<Vec<DynamicObject>> {
        if !api_group_is_present(&api.available_api_groups, &self.gvk()) {
            return Ok(vec![]);
        }
        api.client
            .list(&self.api_resource(), None, &tmpl.space_labels())
            .await
    }
}

pub struct ClusterResourcesManager {
    api: ApiClient,
    status: Arc<StatusManager>,
}

impl ClusterResourcesManager {
    pub fn new(api: ApiClient, status: Arc<StatusManager>) -> Self {
        Self { api, status }
    }

    /// Converge the cluster resources of the space, one object per call.
    ///
    /// Kinds are processed in [`ClusterResourceKind::ALL`] order, and within a kind redundant
    /// or outdated objects are handled before missing ones are created.
    #[instrument(skip(self, tmpl), fields(space = %tmpl.name_any(), tier = %tmpl.spec.tier_name))]
    pub async fn ensure(&self, tmpl: &mut NSTemplateSet) -> Result<bool> {
        debug!("ensuring cluster resources");
        let space = tmpl.name_any();

        let template_ref = tmpl
            .spec
            .cluster_resources
            .as_ref()
            .map(|cr| cr.template_ref.clone());
        let new_template = match template_ref {
            None => None,
            Some(template_ref) => match self
                .api
                .tier_templates
                .get_tier_template(self.api.host.as_ref(), &template_ref)
                .await
            {
                Ok(template) => Some(template),
                Err(e) => {
                    return Err(self
                        .status
                        .wrap_error(
                            tmpl,
                            Failure::ClusterResources,
                            e,
                            format!("failed to retrieve TierTemplate for the cluster resources with the name '{template_ref}'"),
                        )
                        .await)
                }
            },
        };

        for kind in ClusterResourceKind::ALL {
            let desired = match &new_template {
                None => vec![],
                Some(template) => {
                    match template.process(
                        &space_params(&self.api, &space),
                        &[Filter::RetainGvk(kind.gvk())],
                    ) {
                        Ok(objs) => objs,
                        Err(e) => {
                            return Err(self
                                .status
                                .wrap_error(
                                    tmpl,
                                    Failure::ClusterResources,
                                    e,
                                    format!(
                                        "failed to process template for the cluster resources with the name '{}'",
                                        template.template_ref
                                    ),
                                )
                                .await)
                        }
                    }
                }
            };

            let existing = match kind.list_if_available(&self.api, tmpl).await {
                Ok(existing) => existing,
                Err(e) => {
                    return Err(self
                        .status
                        .wrap_error(
                            tmpl,
                            Failure::ClusterResources,
                            e,
                            format!(
                                "failed to list existing cluster resources of kind '{}'",
                                kind.gvk().kind
                            ),
                        )
                        .await)
                }
            };

            if self
                .update_or_delete_redundant(
                    tmpl,
                    kind,
                    &existing,
                    &desired,
                    new_template.as_deref(),
                )
                .await?
            {
                return Ok(true);
            }
            if let Some(template) = &new_template {
                if self.create_missing(tmpl, &existing, &desired, template).await? {
                    return Ok(true);
                }
            }
        }
        debug!("cluster resources are up to date");
        Ok(false)
    }

    async fn update_or_delete_redundant(
        &self,
        tmpl: &mut NSTemplateSet,
        kind: ClusterResourceKind,
        existing: &[DynamicObject],
        desired: &[DynamicObject],
        template: Option<&ResolvedTierTemplate>,
    ) -> Result<bool> {
        for current in existing {
            if current.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let name = current.name_any();
            let wanted = desired
                .iter()
                .find(|d| d.name_any() == name)
                .filter(|d| should_create(d, tmpl));

            match (wanted, template) {
                (Some(wanted), Some(template)) => {
                    if is_up_to_date(current, template) {
                        continue;
                    }
                    self.status
                        .set_status_updating_if_not_provisioning(tmpl)
                        .await?;
                    info!(name = %name, "updating cluster resource");
                    if let Err(e) = self.apply(tmpl, template, wanted.clone()).await {
                        return Err(self
                            .status
                            .wrap_error(
                                tmpl,
                                Failure::Update,
                                e,
                                format!("failed to update the cluster resource '{name}'"),
                            )
                            .await);
                    }
                    return Ok(true);
                }
                _ => {
                    self.status
                        .set_status_updating_if_not_provisioning(tmpl)
                        .await?;
                    // listed items carry no apiVersion or kind, the kind comes from the list
                    let ar = kind.api_resource();
                    info!(kind = %ar.kind, name = %name, "deleting redundant cluster resource");
                    match self.api.client.delete(&ar, None, &name).await {
                        Ok(true) => return Ok(true),
                        Ok(false) => continue,
                        Err(e) => {
                            return Err(self
                                .status
                                .wrap_error(
                                    tmpl,
                                    Failure::Update,
                                    e,
                                    format!(
                                        "failed to delete an existing redundant cluster resource of name '{}' and kind '{}'",
                                        name, ar.kind
                                    ),
                                )
                                .await)
                        }
                    }
                }
            }
        }
        Ok(false)
    }

    async fn create_missing(
        &self,
        tmpl: &mut NSTemplateSet,
        existing: &[DynamicObject],
        desired: &[DynamicObject],
        template: &ResolvedTierTemplate,
    ) -> Result<bool> {
        for wanted in desired {
            let name = wanted.name_any();
            if !should_create(wanted, tmpl) || existing.iter().any(|e| e.name_any() == name) {
                continue;
            }

            let namespaces = match self.api.client.list_namespaces(&tmpl.owner_labels()).await {
                Ok(namespaces) => namespaces,
                Err(e) => {
                    return Err(self
                        .status
                        .wrap_error(
                            tmpl,
                            Failure::ClusterResources,
                            e,
                            "failed to list namespaces while creating cluster resources",
                        )
                        .await)
                }
            };
            if namespaces.is_empty() {
                self.status
                    .set_status_provisioning_if_not_updating(tmpl)
                    .await?;
            } else {
                self.status
                    .set_status_updating_if_not_provisioning(tmpl)
                    .await?;
            }

            info!(name = %name, "creating cluster resource");
            match self.apply(tmpl, template, wanted.clone()).await {
                Ok(true) => return Ok(true),
                // optional resource whose API is not served
                Ok(false) => continue,
                Err(e) => {
                    return Err(self
                        .status
                        .wrap_error(
                            tmpl,
                            Failure::ClusterResources,
                            e,
                            format!("failed to create missing cluster resource '{name}'"),
                        )
                        .await)
                }
            }
        }
        Ok(false)
    }

    async fn apply(
        &self,
        tmpl: &NSTemplateSet,
        template: &ResolvedTierTemplate,
        obj: DynamicObject,
    ) -> Result<bool> {
        let labels = BTreeMap::from([
            (SPACE_LABEL_KEY.to_string(), tmpl.name_any()),
            (
                TYPE_LABEL_KEY.to_string(),
                CLUSTER_RESOURCES_TEMPLATE_TYPE.to_string(),
            ),
            (
                TEMPLATE_REF_LABEL_KEY.to_string(),
                template.template_ref.clone(),
            ),
            (TIER_LABEL_KEY.to_string(), template.tier_name.clone()),
            (
                PROVIDER_LABEL_KEY.to_string(),
                PROVIDER_LABEL_VALUE.to_string(),
            ),
        ]);
        self.api.apply_toolchain_objects(vec![obj], &labels).await
    }

    /// Delete one cluster resource of the space per call.
    ///
    /// Returns true while anything is left, including objects that are already being deleted.
    #[instrument(skip(self, tmpl), fields(space = %tmpl.name_any()))]
    pub async fn delete(&self, tmpl: &mut NSTemplateSet) -> Result<bool> {
        for kind in ClusterResourceKind::ALL {
            let existing = match kind.list_if_available(&self.api, tmpl).await {
                Ok(existing) => existing,
                Err(e) => {
                    return Err(self
                        .status
                        .wrap_error(
                            tmpl,
                            Failure::Terminating,
                            e,
                            format!(
                                "failed to list cluster resources of kind '{}'",
                                kind.gvk().kind
                            ),
                        )
                        .await)
                }
            };

            let mut terminating = false;
            for obj in &existing {
                if obj.metadata.deletion_timestamp.is_some() {
                    terminating = true;
                    continue;
                }
                let name = obj.name_any();
                info!(kind = ?kind, name = %name, "deleting cluster resource");
                match self.api.client.delete(&kind.api_resource(), None, &name).await {
                    Ok(true) => return Ok(true),
                    Ok(false) => continue,
                    Err(e) => {
                        return Err(self
                            .status
                            .wrap_error(
                                tmpl,
                                Failure::Terminating,
                                e,
                                format!("failed to delete cluster resource '{name}'"),
                            )
                            .await)
                    }
                }
            }
            if terminating {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Only the template ref and tier labels are compared, not the content
fn is_up_to_date(current: &DynamicObject, template: &ResolvedTierTemplate) -> bool {
    let labels = current.labels();
    labels.get(TEMPLATE_REF_LABEL_KEY) == Some(&template.template_ref)
        && labels.get(TIER_LABEL_KEY) == Some(&template.tier_name)
}
