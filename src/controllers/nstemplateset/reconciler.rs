use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio::time::Duration;
use tracing::*;

use super::cluster_resources::ClusterResourcesManager;
use super::namespaces::NamespacesManager;
use super::space_roles::SpaceRolesManager;
use super::status::{Failure, StatusManager};
use crate::client::ApiClient;
use crate::resources::nstemplatesets::{NSTemplateSet, NSTEMPLATESET_FINALIZER};
use crate::{Error, Result};

/// Delay before reconciling again after a step changed something
pub const STEP_REQUEUE: Duration = Duration::from_secs(1);
/// Resync period of a provisioned NSTemplateSet
pub const READY_REQUEUE: Duration = Duration::from_secs(5 * 60);
/// How long namespaces may take to go away before the deletion is reported as stuck
const DELETION_TIMEOUT_SECONDS: i64 = 60;

/// Drives one NSTemplateSet through provisioning, updates and deletion.
///
/// Each call performs a single step and asks to be called again until the
/// NSTemplateSet is provisioned or gone.
pub struct Reconciler {
    api: ApiClient,
    status: Arc<StatusManager>,
    cluster_resources: ClusterResourcesManager,
    namespaces: NamespacesManager,
    space_roles: SpaceRolesManager,
}

impl Reconciler {
    pub fn new(api: ApiClient) -> Self {
        let status = Arc::new(StatusManager::new(api.client.clone()));
        Self {
            cluster_resources: ClusterResourcesManager::new(api.clone(), status.clone()),
            namespaces: NamespacesManager::new(api.clone(), status.clone()),
            space_roles: SpaceRolesManager::new(api.clone(), status.clone()),
            status,
            api,
        }
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(mut tmpl) = self
            .api
            .client
            .get_nstemplateset(namespace, name)
            .await
            .map_err(|e| e.context("failed to get NSTemplateSet"))?
        else {
            debug!("NSTemplateSet not found");
            return Ok(Action::await_change());
        };

        if tmpl.is_being_deleted() {
            return self.delete(&mut tmpl).await;
        }

        self.add_finalizer(&mut tmpl).await?;

        // cluster-scoped resources such as quotas come first so that they constrain
        // the namespaces from the moment they exist
        if self.cluster_resources.ensure(&mut tmpl).await? {
            return Ok(Action::requeue(STEP_REQUEUE));
        }
        if self.namespaces.ensure(&mut tmpl).await? {
            return Ok(Action::requeue(STEP_REQUEUE));
        }
        if self.space_roles.ensure(&mut tmpl).await? {
            return Ok(Action::requeue(STEP_REQUEUE));
        }

        let namespaces = match self.namespaces.owned_namespaces(&tmpl).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                return Err(self
                    .status
                    .wrap_error(
                        &mut tmpl,
                        Failure::Provision,
                        e,
                        "failed to list provisioned namespaces",
                    )
                    .await)
            }
        };
        self.status.set_status_ready(&mut tmpl, &namespaces).await?;
        Ok(Action::requeue(READY_REQUEUE))
    }

    async fn add_finalizer(&self, tmpl: &mut NSTemplateSet) -> Result<()> {
        if tmpl.has_finalizer() {
            return Ok(());
        }
        let mut finalizers = tmpl.finalizers().to_vec();
        finalizers.push(NSTEMPLATESET_FINALIZER.to_string());
        self.api
            .client
            .patch_nstemplateset_finalizers(
                &tmpl.namespace().unwrap_or_default(),
                &tmpl.name_any(),
                finalizers.clone(),
            )
            .await
            .map_err(|e| e.context("failed to add finalizer"))?;
        tmpl.metadata.finalizers = Some(finalizers);
        Ok(())
    }

    /// Remove the namespaces, then the cluster resources, then the finalizer
    async fn delete(&self, tmpl: &mut NSTemplateSet) -> Result<Action> {
        if !tmpl.has_finalizer() {
            debug!("NSTemplateSet is terminated");
            return Ok(Action::await_change());
        }
        info!("NSTemplateSet is being deleted");

        if let Err(e) = self.status.set_status_terminating(tmpl).await {
            return Err(self
                .status
                .wrap_error(
                    tmpl,
                    Failure::Terminating,
                    e,
                    "failed to set status to 'ready=false/reason=terminating' on NSTemplateSet",
                )
                .await);
        }

        if !self.namespaces.delete(tmpl).await? {
            let deleting_since = tmpl
                .metadata
                .deletion_timestamp
                .as_ref()
                .map(|t| Utc::now().signed_duration_since(t.0));
            if deleting_since.is_some_and(|d| d.num_seconds() > DELETION_TIMEOUT_SECONDS) {
                return Err(Error::DeletionTimeout);
            }
            return Ok(Action::requeue(STEP_REQUEUE));
        }

        if self.cluster_resources.delete(tmpl).await? {
            return Ok(Action::requeue(STEP_REQUEUE));
        }

        info!("all resources of the NSTemplateSet are gone, removing the finalizer");
        let finalizers: Vec<String> = tmpl
            .finalizers()
            .iter()
            .filter(|f| *f != NSTEMPLATESET_FINALIZER)
            .cloned()
            .collect();
        if let Err(e) = self
            .api
            .client
            .patch_nstemplateset_finalizers(
                &tmpl.namespace().unwrap_or_default(),
                &tmpl.name_any(),
                finalizers,
            )
            .await
        {
            let context = format!("failed to remove finalizer on NSTemplateSet '{}'", tmpl.name_any());
            return Err(self
                .status
                .wrap_error(tmpl, Failure::Terminating, e, context)
                .await);
        }
        Ok(Action::await_change())
    }
}
