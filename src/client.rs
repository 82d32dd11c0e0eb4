use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIGroup;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams,
};
use kube::Client;
use serde_json::json;
use tracing::*;

use crate::controllers::nstemplateset::tier_templates::TierTemplateCache;
use crate::host::HostClusterAccessor;
use crate::resources::nstemplatesets::{
    NSTemplateSet, NSTemplateSetStatus, OPTIONAL_RESOURCE_ANNOTATION_KEY,
};
use crate::template::gvk_of;
use crate::{Error, Result};

pub const FIELD_MANAGER: &str = "member-operator";

/// Object store operations needed to reconcile NSTemplateSets
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_nstemplateset(&self, namespace: &str, name: &str) -> Result<Option<NSTemplateSet>>;

    async fn patch_nstemplateset_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn patch_nstemplateset_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NSTemplateSetStatus,
    ) -> Result<()>;

    async fn list_namespaces(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Namespace>>;

    /// Merge the given labels and annotations into a namespace
    async fn patch_namespace_metadata(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;

    /// Create or update the object with a server-side apply
    async fn apply(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<()>;

    /// Returns false if the object did not exist
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_nstemplateset(&self, namespace: &str, name: &str) -> Result<Option<NSTemplateSet>> {
        let api: Api<NSTemplateSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_nstemplateset_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let api: Api<NSTemplateSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        debug!("Patching finalizers of NSTemplateSet {} in namespace {}", name, namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_nstemplateset_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NSTemplateSetStatus,
    ) -> Result<()> {
        let api: Api<NSTemplateSet> = Api::namespaced(self.client.clone(), namespace);
        let new_status = Patch::Apply(json!({
            "apiVersion": "toolchain.dev.openshift.com/v1alpha1",
            "kind": "NSTemplateSet",
            "status": status,
        }));
        let ps = PatchParams::apply(FIELD_MANAGER).force();
        api.patch_status(name, &ps, &new_status).await?;
        Ok(())
    }

    async fn list_namespaces(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&lp).await?.items)
    }

    async fn patch_namespace_metadata(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": labels, "annotations": annotations } });
        debug!("Patching metadata of Namespace {}", name);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.dynamic_api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let lp = ListParams::default().labels(&label_selector(labels));
        Ok(self.dynamic_api(resource, namespace).list(&lp).await?.items)
    }

    async fn apply(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<()> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::InvalidObject(format!("{} without a name", resource.kind)))?;
        let namespace = obj.metadata.namespace.as_deref();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        debug!(
            "Applying {} {} in namespace {}",
            resource.kind,
            name,
            namespace.unwrap_or("<cluster>")
        );
        self.dynamic_api(resource, namespace)
            .patch(name, &params, &Patch::Apply(obj))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        debug!(
            "Deleting {} {} in namespace {}",
            resource.kind,
            name,
            namespace.unwrap_or("<cluster>")
        );
        match self
            .dynamic_api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Whether the cluster serves the group and version of the given kind
pub fn api_group_is_present(api_groups: &[APIGroup], gvk: &GroupVersionKind) -> bool {
    // the core group is not part of the discovered groups
    if gvk.group.is_empty() {
        return true;
    }
    api_groups.iter().any(|group| {
        group.name == gvk.group && group.versions.iter().any(|v| v.version == gvk.version)
    })
}

/// Everything the NSTemplateSet managers need to talk to the member and host clusters
#[derive(Clone)]
pub struct ApiClient {
    pub client: Arc<dyn KubeClient>,
    pub host: Arc<dyn HostClusterAccessor>,
    pub tier_templates: Arc<TierTemplateCache>,
    /// Namespace the operator runs in, passed to templates as MEMBER_OPERATOR_NAMESPACE
    pub operator_namespace: String,
    /// API groups served by the member cluster, discovered at startup
    pub available_api_groups: Arc<Vec<APIGroup>>,
}

impl ApiClient {
    /// Apply the objects after merging `labels` into each of them.
    ///
    /// Objects annotated as optional are skipped when their API group is not served.
    /// Returns whether anything was applied.
    pub async fn apply_toolchain_objects(
        &self,
        objects: Vec<DynamicObject>,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let mut applied = false;
        for mut obj in objects {
            let gvk = gvk_of(&obj)?;
            let optional = obj
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(OPTIONAL_RESOURCE_ANNOTATION_KEY));
            if optional && !api_group_is_present(&self.available_api_groups, &gvk) {
                info!(
                    kind = %gvk.kind,
                    name = obj.metadata.name.as_deref().unwrap_or_default(),
                    "skipping optional resource, its API group is not available"
                );
                continue;
            }
            obj.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            self.client
                .apply(&ApiResource::from_gvk(&gvk), &obj)
                .await?;
            applied = true;
        }
        Ok(applied)
    }
}
