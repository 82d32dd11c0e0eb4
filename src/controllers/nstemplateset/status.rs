use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::*;

use super::features::split_comma_separated_list;
use crate::client::KubeClient;
use crate::resources::nstemplatesets::{
    Condition, NSTemplateSet, NSTemplateSetStatus, ReadyReason, SpaceNamespace, CONDITION_READY,
};
use crate::{Error, Result};

/// The phase a failure happened in, which decides the reason of the Ready condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Provision,
    Namespace,
    ClusterResources,
    SpaceRoles,
    Update,
    Terminating,
}

/// Owns every write to the Ready condition of an NSTemplateSet
pub struct StatusManager {
    client: Arc<dyn KubeClient>,
}

impl StatusManager {
    pub fn new(client: Arc<dyn KubeClient>) -> Self {
        Self { client }
    }

    /// Report the error on the Ready condition and return it with `context` prepended.
    ///
    /// A failure to write the status is logged, never returned in place of `err`.
    pub async fn wrap_error(
        &self,
        tmpl: &mut NSTemplateSet,
        failure: Failure,
        err: Error,
        context: impl Into<String>,
    ) -> Error {
        let reason = failure_reason(tmpl, failure);
        if let Err(e) = self.set_status_failed(tmpl, reason, &err.to_string()).await {
            error!("status update failed: {e}");
        }
        err.context(context)
    }

    pub async fn set_status_provisioning_if_not_updating(&self, tmpl: &mut NSTemplateSet) -> Result<()> {
        if tmpl.ready_reason_is(ReadyReason::Updating) {
            return Ok(());
        }
        self.update_conditions(tmpl, not_ready(ReadyReason::Provisioning, None))
            .await
    }

    pub async fn set_status_updating_if_not_provisioning(&self, tmpl: &mut NSTemplateSet) -> Result<()> {
        if tmpl.ready_reason_is(ReadyReason::Provisioning) {
            return Ok(());
        }
        self.update_conditions(tmpl, not_ready(ReadyReason::Updating, None))
            .await
    }

    pub async fn set_status_terminating(&self, tmpl: &mut NSTemplateSet) -> Result<()> {
        self.update_conditions(tmpl, not_ready(ReadyReason::Terminating, None))
            .await
    }

    pub async fn set_status_failed(
        &self,
        tmpl: &mut NSTemplateSet,
        reason: ReadyReason,
        message: &str,
    ) -> Result<()> {
        self.update_conditions(tmpl, not_ready(reason, Some(message.to_string())))
            .await
    }

    /// Mark the NSTemplateSet as provisioned and mirror what was provisioned into the status
    pub async fn set_status_ready(&self, tmpl: &mut NSTemplateSet, namespaces: &[Namespace]) -> Result<()> {
        let mut status = tmpl.status.clone().unwrap_or_default();
        status.cluster_resources = tmpl.spec.cluster_resources.clone();
        status.namespaces = tmpl.spec.namespaces.clone();
        status.space_roles = tmpl.spec.space_roles.clone();
        if let Some(features) = tmpl.feature_toggles() {
            status.feature_toggles = split_comma_separated_list(features);
        }
        if !namespaces.is_empty() {
            status.provisioned_namespaces = provisioned_namespaces(namespaces);
        }
        let ready = Condition {
            r#type: CONDITION_READY.into(),
            status: "True".into(),
            reason: Some(ReadyReason::Provisioned.as_str().into()),
            message: None,
            last_transition_time: None,
        };
        self.write(tmpl, status, ready).await
    }

    async fn update_conditions(&self, tmpl: &mut NSTemplateSet, condition: Condition) -> Result<()> {
        let status = tmpl.status.clone().unwrap_or_default();
        self.write(tmpl, status, condition).await
    }

    // skips the API call when nothing changed
    async fn write(
        &self,
        tmpl: &mut NSTemplateSet,
        mut status: NSTemplateSetStatus,
        condition: Condition,
    ) -> Result<()> {
        add_or_update_condition(&mut status.conditions, condition);
        if tmpl.status.as_ref() == Some(&status) {
            return Ok(());
        }
        debug!(
            reason = status
                .conditions
                .iter()
                .find(|c| c.r#type == CONDITION_READY)
                .and_then(|c| c.reason.as_deref())
                .unwrap_or_default(),
            "updating NSTemplateSet status"
        );
        self.client
            .patch_nstemplateset_status(
                &tmpl.namespace().unwrap_or_default(),
                &tmpl.name_any(),
                &status,
            )
            .await?;
        tmpl.status = Some(status);
        Ok(())
    }
}

fn not_ready(reason: ReadyReason, message: Option<String>) -> Condition {
    Condition {
        r#type: CONDITION_READY.into(),
        status: "False".into(),
        reason: Some(reason.as_str().into()),
        message,
        last_transition_time: None,
    }
}

/// Once the NSTemplateSet is updating, failures of the cluster resources and space roles
/// are reported as update failures.
fn failure_reason(tmpl: &NSTemplateSet, failure: Failure) -> ReadyReason {
    let updating =
        tmpl.ready_reason_is(ReadyReason::Updating) || tmpl.ready_reason_is(ReadyReason::UpdateFailed);
    match failure {
        Failure::ClusterResources if updating => ReadyReason::UpdateFailed,
        Failure::SpaceRoles if updating => ReadyReason::UpdateFailed,
        Failure::ClusterResources => ReadyReason::UnableToProvisionClusterResources,
        Failure::SpaceRoles => ReadyReason::UnableToProvisionSpaceRoles,
        Failure::Provision => ReadyReason::UnableToProvision,
        Failure::Namespace => ReadyReason::UnableToProvisionNamespace,
        Failure::Update => ReadyReason::UpdateFailed,
        Failure::Terminating => ReadyReason::TerminatingFailed,
    }
}

/// Replace the condition of the same type. The transition time moves only when the status does.
fn add_or_update_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return;
            }
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                Some(Time(Utc::now()))
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(Time(Utc::now()));
            conditions.push(condition);
        }
    }
}

/// Every namespace sorted by name, the first one being the default
fn provisioned_namespaces(namespaces: &[Namespace]) -> Vec<SpaceNamespace> {
    let mut provisioned: Vec<_> = namespaces
        .iter()
        .map(|ns| SpaceNamespace {
            name: ns.name_any(),
            type_: None,
        })
        .collect();
    provisioned.sort_by(|a, b| a.name.cmp(&b.name));
    if let Some(first) = provisioned.first_mut() {
        first.type_ = Some("default".into());
    }
    provisioned
}
