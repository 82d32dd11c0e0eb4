use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use tracing::*;

use super::status::{Failure, StatusManager};
use super::tier_templates::ResolvedTierTemplate;
use super::{delete_redundant_objects, space_params};
use crate::client::ApiClient;
use crate::resources::nstemplatesets::{
    NSTemplateSet, OWNER_LABEL_KEY, PROVIDER_LABEL_KEY, PROVIDER_LABEL_VALUE,
    TEMPLATE_REF_LABEL_KEY, TIER_LABEL_KEY, TYPE_LABEL_KEY,
};
use crate::template::{gvk_of, Filter};
use crate::{Error, Result};

pub struct NamespacesManager {
    api: ApiClient,
    status: Arc<StatusManager>,
}

fn namespace_resource() -> ApiResource {
    ApiResource::erase::<Namespace>(&())
}

pub(super) fn is_active(ns: &Namespace) -> bool {
    ns.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Active")
}

pub(super) fn is_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
}

fn type_of(ns: &Namespace) -> Option<&str> {
    ns.labels().get(TYPE_LABEL_KEY).map(String::as_str)
}

impl NamespacesManager {
    pub fn new(api: ApiClient, status: Arc<StatusManager>) -> Self {
        Self { api, status }
    }

    /// The namespaces owned by the space, sorted by name
    pub async fn owned_namespaces(&self, tmpl: &NSTemplateSet) -> Result<Vec<Namespace>> {
        let mut namespaces = self.api.client.list_namespaces(&tmpl.owner_labels()).await?;
        namespaces.sort_by_key(|ns| ns.name_any());
        Ok(namespaces)
    }

    /// Create, update or remove one namespace of the space per call.
    ///
    /// Namespaces whose type is no longer part of the tier are removed before anything
    /// is created. A namespace is first created empty, and its inner resources are only
    /// provisioned once it is active.
    #[instrument(skip(self, tmpl), fields(space = %tmpl.name_any(), tier = %tmpl.spec.tier_name))]
    pub async fn ensure(&self, tmpl: &mut NSTemplateSet) -> Result<bool> {
        debug!("ensuring namespaces");
        let space = tmpl.name_any();
        let namespaces = match self.owned_namespaces(tmpl).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::Provision,
                        e,
                        format!("failed to list namespaces with label owner '{space}'"),
                    )
                    .await)
            }
        };

        let templates = match self.templates_for_all_namespaces(tmpl).await {
            Ok(templates) => templates,
            Err(e) => {
                let context = format!("failed to get TierTemplates for tier '{}'", tmpl.spec.tier_name);
                return Err(self
                    .status
                    .wrap_error(tmpl, Failure::Namespace, e, context)
                    .await);
            }
        };

        if let Some(ns) = next_namespace_to_deprovision(&templates, &namespaces) {
            let name = ns.name_any();
            self.status
                .set_status_updating_if_not_provisioning(tmpl)
                .await?;
            info!(namespace = %name, "deleting namespace which is no longer part of the tier");
            if let Err(e) = self.api.client.delete(&namespace_resource(), None, &name).await {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::Update,
                        e,
                        format!("failed to delete namespace {name}"),
                    )
                    .await);
            }
            return Ok(true);
        }

        let next = match self
            .next_namespace_to_provision_or_update(&templates, &namespaces)
            .await
        {
            Ok(next) => next,
            Err(e) => {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::Namespace,
                        e,
                        "failed to check whether the namespaces are provisioned",
                    )
                    .await)
            }
        };
        let Some((template, namespace)) = next else {
            debug!("no more namespaces to create or update");
            return Ok(false);
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

        match namespace {
            None => self.ensure_namespace_resource(tmpl, &template).await?,
            Some(ns) => match self.has_expected_labels(&template, ns, &space) {
                Ok(true) => self.ensure_inner_resources(tmpl, &template, ns).await?,
                Ok(false) => self.ensure_namespace_resource(tmpl, &template).await?,
                Err(e) => {
                    let context = format!(
                        "failed to get namespace object from template for namespace type '{}'",
                        template.type_name
                    );
                    return Err(self
                        .status
                        .wrap_error(tmpl, Failure::Namespace, e, context)
                        .await);
                }
            },
        }
        Ok(true)
    }

    async fn templates_for_all_namespaces(
        &self,
        tmpl: &NSTemplateSet,
    ) -> Result<Vec<Arc<ResolvedTierTemplate>>> {
        let mut templates = Vec::with_capacity(tmpl.spec.namespaces.len());
        for ns in &tmpl.spec.namespaces {
            templates.push(
                self.api
                    .tier_templates
                    .get_tier_template(self.api.host.as_ref(), &ns.template_ref)
                    .await?,
            );
        }
        Ok(templates)
    }

    /// First namespace in spec order which is missing, or active but not fully provisioned
    async fn next_namespace_to_provision_or_update<'a>(
        &self,
        templates: &[Arc<ResolvedTierTemplate>],
        namespaces: &'a [Namespace],
    ) -> Result<Option<(Arc<ResolvedTierTemplate>, Option<&'a Namespace>)>> {
        for template in templates {
            match namespaces
                .iter()
                .find(|ns| type_of(ns) == Some(template.type_name.as_str()))
            {
                None => return Ok(Some((template.clone(), None))),
                // still being created or removed
                Some(ns) if !is_active(ns) => continue,
                Some(ns) => {
                    if !self.is_up_to_date_and_provisioned(ns, template).await? {
                        return Ok(Some((template.clone(), Some(ns))));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Whether the namespace is labeled with the template and holds every Role and
    /// RoleBinding of the template, owned by the space.
    pub async fn is_up_to_date_and_provisioned(
        &self,
        ns: &Namespace,
        template: &ResolvedTierTemplate,
    ) -> Result<bool> {
        let labels = ns.labels();
        if labels.get(TIER_LABEL_KEY) != Some(&template.tier_name)
            || labels.get(TEMPLATE_REF_LABEL_KEY) != Some(&template.template_ref)
        {
            debug!(namespace = %ns.name_any(), "namespace is not up to date");
            return Ok(false);
        }
        let owner = labels.get(OWNER_LABEL_KEY).ok_or(Error::MissingOwnerLabel)?;

        let name = ns.name_any();
        for obj in self.inner_objects(template, owner, &name)? {
            let gvk = gvk_of(&obj)?;
            if gvk.kind != "Role" && gvk.kind != "RoleBinding" {
                continue;
            }
            let existing = self
                .api
                .client
                .get(&ApiResource::from_gvk(&gvk), Some(&name), &obj.name_any())
                .await?;
            let owned = existing.is_some_and(|e| e.labels().get(OWNER_LABEL_KEY) == Some(owner));
            if !owned {
                debug!(namespace = %name, kind = %gvk.kind, name = %obj.name_any(), "missing namespace resource");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether the namespace carries the labels its template sets on it
    fn has_expected_labels(
        &self,
        template: &ResolvedTierTemplate,
        ns: &Namespace,
        space: &str,
    ) -> Result<bool> {
        let name = ns.name_any();
        let objs = template.process(&space_params(&self.api, space), &[Filter::RetainNamespaces])?;
        let expected = objs
            .iter()
            .find(|obj| obj.name_any() == name)
            .ok_or_else(|| {
                Error::InvalidObject(format!("no matching template object found for namespace {name}"))
            })?;
        let labels = ns.labels();
        Ok(expected
            .labels()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v)))
    }

    fn inner_objects(
        &self,
        template: &ResolvedTierTemplate,
        space: &str,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>> {
        let mut objs = template.process(
            &space_params(&self.api, space),
            &[Filter::RetainAllButNamespaces],
        )?;
        for obj in &mut objs {
            obj.metadata
                .namespace
                .get_or_insert_with(|| namespace.to_string());
        }
        Ok(objs)
    }

    /// Create the namespace itself. Its template ref and tier labels are only set
    /// once the inner resources are provisioned.
    async fn ensure_namespace_resource(
        &self,
        tmpl: &mut NSTemplateSet,
        template: &ResolvedTierTemplate,
    ) -> Result<()> {
        let space = tmpl.name_any();
        info!(r#type = %template.type_name, "creating namespace");
        let objs = match template.process(&space_params(&self.api, &space), &[Filter::RetainNamespaces]) {
            Ok(objs) => objs,
            Err(e) => {
                let context = format!(
                    "failed to process template for namespace type '{}'",
                    template.type_name
                );
                return Err(self
                    .status
                    .wrap_error(tmpl, Failure::Namespace, e, context)
                    .await);
            }
        };
        let labels = BTreeMap::from([
            (OWNER_LABEL_KEY.to_string(), space),
            (TYPE_LABEL_KEY.to_string(), template.type_name.clone()),
            (
                PROVIDER_LABEL_KEY.to_string(),
                PROVIDER_LABEL_VALUE.to_string(),
            ),
        ]);
        if let Err(e) = self.api.apply_toolchain_objects(objs, &labels).await {
            let context = format!("failed to create namespace with type '{}'", template.type_name);
            return Err(self
                .status
                .wrap_error(tmpl, Failure::Namespace, e, context)
                .await);
        }
        Ok(())
    }

    /// Provision the resources inside the namespace, removing those of the previous
    /// template first, then label the namespace with the template it now matches.
    async fn ensure_inner_resources(
        &self,
        tmpl: &mut NSTemplateSet,
        template: &ResolvedTierTemplate,
        ns: &Namespace,
    ) -> Result<()> {
        let space = tmpl.name_any();
        let name = ns.name_any();
        info!(namespace = %name, template_ref = %template.template_ref, "provisioning namespace resources");

        let new_objs = match self.inner_objects(template, &space, &name) {
            Ok(objs) => objs,
            Err(e) => {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::Namespace,
                        e,
                        format!("failed to process template for namespace '{name}'"),
                    )
                    .await)
            }
        };

        let current_ref = ns
            .labels()
            .get(TEMPLATE_REF_LABEL_KEY)
            .filter(|r| !r.is_empty() && **r != template.template_ref);
        if let Some(current_ref) = current_ref {
            self.status
                .set_status_updating_if_not_provisioning(tmpl)
                .await?;
            if let Err(e) = self
                .delete_obsolete_objects(current_ref, &space, &name, &new_objs)
                .await
            {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::Update,
                        e,
                        format!("failed to delete redundant objects in namespace '{name}'"),
                    )
                    .await);
            }
        }

        let labels = BTreeMap::from([
            (
                PROVIDER_LABEL_KEY.to_string(),
                PROVIDER_LABEL_VALUE.to_string(),
            ),
            (OWNER_LABEL_KEY.to_string(), space.clone()),
        ]);
        if let Err(e) = self.api.apply_toolchain_objects(new_objs, &labels).await {
            return Err(self
                .status
                .wrap_error(
                    tmpl,
                    Failure::Namespace,
                    e,
                    format!("failed to provision namespace '{name}' with required resources"),
                )
                .await);
        }

        let labels = BTreeMap::from([
            (
                TEMPLATE_REF_LABEL_KEY.to_string(),
                template.template_ref.clone(),
            ),
            (TIER_LABEL_KEY.to_string(), template.tier_name.clone()),
        ]);
        if let Err(e) = self
            .api
            .client
            .patch_namespace_metadata(&name, &labels, &BTreeMap::new())
            .await
        {
            return Err(self
                .status
                .wrap_error(
                    tmpl,
                    Failure::Namespace,
                    e,
                    format!("failed to update namespace '{name}'"),
                )
                .await);
        }
        Ok(())
    }

    async fn delete_obsolete_objects(
        &self,
        current_ref: &str,
        space: &str,
        namespace: &str,
        new_objs: &[DynamicObject],
    ) -> Result<bool> {
        let current = self
            .api
            .tier_templates
            .get_tier_template(self.api.host.as_ref(), current_ref)
            .await
            .map_err(|e| e.context(format!("failed to retrieve current TierTemplate with name '{current_ref}'")))?;
        let current_objs = self.inner_objects(&current, space, namespace)?;
        delete_redundant_objects(&self.api, &current_objs, new_objs).await
    }

    /// Delete one namespace of the space per call.
    ///
    /// Returns true once no namespace is left, false while some are still deleting.
    #[instrument(skip(self, tmpl), fields(space = %tmpl.name_any()))]
    pub async fn delete(&self, tmpl: &mut NSTemplateSet) -> Result<bool> {
        let space = tmpl.name_any();
        let namespaces = match self.owned_namespaces(tmpl).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::Terminating,
                        e,
                        format!("failed to list namespaces with label owner '{space}'"),
                    )
                    .await)
            }
        };
        if namespaces.is_empty() {
            return Ok(true);
        }

        if let Some(ns) = namespaces.iter().find(|ns| !is_terminating(ns)) {
            let name = ns.name_any();
            info!(namespace = %name, "deleting namespace of the deleted NSTemplateSet");
            if let Err(e) = self.api.client.delete(&namespace_resource(), None, &name).await {
                return Err(self
                    .status
                    .wrap_error(
                        tmpl,
                        Failure::Terminating,
                        e,
                        format!("failed to delete user namespace '{name}'"),
                    )
                    .await);
            }
        }
        Ok(false)
    }
}

/// First namespace, not already terminating, whose type is not part of the tier anymore
fn next_namespace_to_deprovision<'a>(
    templates: &[Arc<ResolvedTierTemplate>],
    namespaces: &'a [Namespace],
) -> Option<&'a Namespace> {
    namespaces.iter().find(|ns| {
        !is_terminating(ns)
            && !templates
                .iter()
                .any(|t| type_of(ns) == Some(t.type_name.as_str()))
    })
}
