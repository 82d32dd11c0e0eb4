use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::core::PartialObjectMeta;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, watcher, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use serde::de::DeserializeOwned;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::client::{api_group_is_present, ApiClient, KubeClientImpl};
use crate::controllers::{Diagnostics, State};
use crate::resources::clusterresourcequotas::ClusterResourceQuota;
use crate::resources::idlers::Idler;
use crate::resources::nstemplatesets::{NSTemplateSet, OWNER_LABEL_KEY, SPACE_LABEL_KEY};
use crate::{telemetry, Error, Metrics, Result};

use super::cluster_resources::ClusterResourceKind;
use super::reconciler::Reconciler;
use super::tier_templates::TierTemplateCache;

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Drives the NSTemplateSets, holding the tier template cache
    pub reconciler: Arc<Reconciler>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: &State, reconciler: Reconciler) -> Arc<Context> {
        Arc::new(Context {
            recorder: Recorder::new(client, "member-operator".into()),
            reconciler: Arc::new(reconciler),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, tmpl), fields(trace_id))]
async fn reconcile(tmpl: Arc<NSTemplateSet>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<NSTemplateSet>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = tmpl.name_any();
    let namespace = tmpl.namespace().unwrap_or_default();
    info!("Reconciling NSTemplateSet \"{namespace}/{name}\"");
    match ctx.reconciler.reconcile(&namespace, &name).await {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {err}");

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &tmpl.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(tmpl.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<K, C>(_tmpl: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

/// Metadata of the objects of kind `K` carrying `label`, filtered down to real changes
fn labeled_watcher<K>(
    client: &Client,
    label: &str,
) -> impl Stream<Item = Result<PartialObjectMeta<K>, watcher::Error>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    metadata_watcher(Api::<K>::all(client.clone()), Config::default().labels(label))
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate)
}

/// Maps a derived object back to the NSTemplateSet named by its `label`
fn owner_by_label<K: Resource>(
    label: &'static str,
    namespace: String,
) -> impl Fn(PartialObjectMeta<K>) -> Option<ObjectRef<NSTemplateSet>> + Send + Sync + 'static {
    move |obj| {
        let owner = obj.labels().get(label)?;
        Some(ObjectRef::new(owner).within(&namespace))
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let api_groups = match client.list_api_groups().await {
        Ok(list) => list.groups,
        Err(e) => {
            error!("Could not list api groups: {e:?}");
            std::process::exit(1);
        }
    };

    let tmpl_api = Api::<NSTemplateSet>::namespaced(client.clone(), &state.watch_namespace);
    if let Err(e) = tmpl_api.list(&ListParams::default().limit(1)).await {
        error!("NSTemplateSet is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let available = |kind: ClusterResourceKind| api_group_is_present(&api_groups, &kind.gvk());
    let quotas_installed = available(ClusterResourceKind::Quota);
    let idlers_installed = available(ClusterResourceKind::Idler);

    let watch_namespace = state.watch_namespace.clone();
    let controller = Controller::new(tmpl_api, Config::default())
        .shutdown_on_signal()
        .watches_stream(
            labeled_watcher::<Namespace>(&client, OWNER_LABEL_KEY),
            owner_by_label(OWNER_LABEL_KEY, watch_namespace.clone()),
        )
        .watches_stream(
            labeled_watcher::<ClusterRoleBinding>(&client, SPACE_LABEL_KEY),
            owner_by_label(SPACE_LABEL_KEY, watch_namespace.clone()),
        );
    let controller = if quotas_installed {
        controller.watches_stream(
            labeled_watcher::<ClusterResourceQuota>(&client, SPACE_LABEL_KEY),
            owner_by_label(SPACE_LABEL_KEY, watch_namespace.clone()),
        )
    } else {
        controller
    };
    let controller = if idlers_installed {
        controller.watches_stream(
            labeled_watcher::<Idler>(&client, SPACE_LABEL_KEY),
            owner_by_label(SPACE_LABEL_KEY, watch_namespace.clone()),
        )
    } else {
        controller
    };

    let api = ApiClient {
        client: Arc::new(KubeClientImpl::new(client.clone())),
        host: state.host_clusters.clone(),
        tier_templates: Arc::new(TierTemplateCache::new()),
        operator_namespace: state.watch_namespace.clone(),
        available_api_groups: Arc::new(api_groups),
    };

    controller
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, &state, Reconciler::new(api)),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    Some(hasher.finish())
}
