use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use kube::api::DynamicObject;
use tracing::*;

use crate::host::HostClusterAccessor;
use crate::template::{Filter, Template};
use crate::{Error, Result};

/// A TierTemplate resolved from the host cluster. Immutable once resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTierTemplate {
    pub template_ref: String,
    pub tier_name: String,
    pub type_name: String,
    pub template: Template,
}

impl ResolvedTierTemplate {
    pub fn process(
        &self,
        params: &BTreeMap<String, String>,
        filters: &[Filter],
    ) -> Result<Vec<DynamicObject>> {
        self.template.process(params, filters)
    }
}

/// Read-through cache of TierTemplates, keyed by template ref.
///
/// Entries are never evicted: a template ref names an immutable revision.
#[derive(Default)]
pub struct TierTemplateCache {
    templates: RwLock<HashMap<String, Arc<ResolvedTierTemplate>>>,
}

impl TierTemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, template_ref: &str) -> Option<Arc<ResolvedTierTemplate>> {
        self.templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(template_ref)
            .cloned()
    }

    pub fn add(&self, template: ResolvedTierTemplate) -> Arc<ResolvedTierTemplate> {
        let template = Arc::new(template);
        self.templates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template.template_ref.clone(), template.clone());
        template
    }

    /// Drop every entry
    pub fn reset(&self) {
        self.templates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Return the cached template, or fetch it from the host cluster and cache it.
    ///
    /// A cached template is returned even when the host cluster is gone or not ready.
    pub async fn get_tier_template(
        &self,
        host: &dyn HostClusterAccessor,
        template_ref: &str,
    ) -> Result<Arc<ResolvedTierTemplate>> {
        if template_ref.is_empty() {
            return Err(Error::TemplateRefNotProvided);
        }
        if let Some(template) = self.get(template_ref) {
            return Ok(template);
        }

        let host = host.host_cluster().ok_or(Error::HostClusterUnavailable)?;
        if !host.ready {
            return Err(Error::HostClusterNotReady);
        }
        debug!(template_ref, "fetching TierTemplate from the host cluster");
        let tier_template = host
            .client
            .get_tier_template(&host.operator_namespace, template_ref)
            .await
            .map_err(|e| {
                e.context(format!(
                    "unable to retrieve the TierTemplate '{template_ref}' from 'Host' cluster"
                ))
            })?;

        Ok(self.add(ResolvedTierTemplate {
            template_ref: template_ref.to_string(),
            tier_name: tier_template.spec.tier_name,
            type_name: tier_template.spec.r#type,
            template: tier_template.spec.template,
        }))
    }
}
