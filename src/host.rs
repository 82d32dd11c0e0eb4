use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::Api;
use kube::Client;
use tracing::*;

use crate::resources::tiertemplates::TierTemplate;
use crate::{Metrics, Result};

/// Reads tier templates from the host cluster
#[async_trait]
pub trait HostClusterClient: Send + Sync {
    async fn get_tier_template(&self, namespace: &str, name: &str) -> Result<TierTemplate>;
}

#[async_trait]
impl HostClusterClient for Client {
    async fn get_tier_template(&self, namespace: &str, name: &str) -> Result<TierTemplate> {
        let api: Api<TierTemplate> = Api::namespaced(self.clone(), namespace);
        Ok(api.get(name).await?)
    }
}

/// A connection to the host cluster together with its last known health
#[derive(Clone)]
pub struct HostCluster {
    pub client: Arc<dyn HostClusterClient>,
    /// Namespace of the host operator, where the TierTemplates live
    pub operator_namespace: String,
    pub ready: bool,
}

/// Returns the host cluster, if one is registered
pub trait HostClusterAccessor: Send + Sync {
    fn host_cluster(&self) -> Option<HostCluster>;
}

impl<F> HostClusterAccessor for F
where
    F: Fn() -> Option<HostCluster> + Send + Sync,
{
    fn host_cluster(&self) -> Option<HostCluster> {
        self()
    }
}

/// Holds the host cluster connection and keeps its readiness current
#[derive(Default)]
pub struct HostClusterRegistry {
    cluster: RwLock<Option<HostCluster>>,
}

impl HostClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cluster: HostCluster) {
        info!(namespace = %cluster.operator_namespace, "registering host cluster");
        *self.cluster.write().unwrap_or_else(|e| e.into_inner()) = Some(cluster);
    }

    pub fn set_ready(&self, ready: bool) {
        if let Some(cluster) = self
            .cluster
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            if cluster.ready != ready {
                info!(ready, "host cluster readiness changed");
            }
            cluster.ready = ready;
        }
    }
}

impl HostClusterAccessor for HostClusterRegistry {
    fn host_cluster(&self) -> Option<HostCluster> {
        self.cluster
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Probe the host API server every `period` and record whether it answered
pub async fn monitor_health(
    registry: Arc<HostClusterRegistry>,
    client: Client,
    metrics: Metrics,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let ready = match client.apiserver_version().await {
            Ok(_) => true,
            Err(e) => {
                warn!("host cluster health check failed: {e}");
                false
            }
        };
        registry.set_ready(ready);
        metrics.set_host_cluster_ready(ready);
    }
}
