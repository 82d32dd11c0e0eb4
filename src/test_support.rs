//! In-memory fakes of the member and host clusters, and the `advanced` tier fixtures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroup, GroupVersionForDiscovery, Time};
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::json;

use crate::client::{ApiClient, KubeClient};
use crate::controllers::nstemplateset::tier_templates::TierTemplateCache;
use crate::host::{HostCluster, HostClusterAccessor, HostClusterClient};
use crate::resources::nstemplatesets::{
    NSTemplateSet, NSTemplateSetClusterResources, NSTemplateSetNamespace, NSTemplateSetSpec,
    NSTemplateSetStatus, FEATURE_TOGGLE_NAME_ANNOTATION_KEY, NSTEMPLATESET_FINALIZER,
};
use crate::resources::tiertemplates::{TierTemplate, TierTemplateSpec};
use crate::{Error, Result};

pub const WATCH_NAMESPACE: &str = "toolchain-member-operator";
pub const HOST_NAMESPACE: &str = "toolchain-host-operator";

pub const ADVANCED_CLUSTER_RESOURCES: &str = "advanced-clusterresources-abcde11";
pub const ADVANCED_CLUSTER_RESOURCES_WITH_FEATURES: &str = "advanced-clusterresources-withfeatures";
pub const BASIC_CLUSTER_RESOURCES: &str = "basic-clusterresources-abcde11";
pub const ADVANCED_DEV: &str = "advanced-dev-abcde11";
pub const ADVANCED_DEV_NEXT: &str = "advanced-dev-abcde12";
pub const ADVANCED_STAGE: &str = "advanced-stage-abcde11";
pub const ADVANCED_ADMIN: &str = "advanced-admin-abcde10";
pub const ADVANCED_VIEWER: &str = "advanced-viewer-abcde10";

const CLUSTER_RESOURCES_TEMPLATE: &str = r#"
objects:
- apiVersion: quota.openshift.io/v1
  kind: ClusterResourceQuota
  metadata:
    name: for-${SPACE_NAME}
  spec:
    quota:
      hard:
        limits.cpu: 2000m
        limits.memory: 10Gi
    selector:
      annotations:
        openshift.io/requester: ${SPACE_NAME}
- apiVersion: rbac.authorization.k8s.io/v1
  kind: ClusterRoleBinding
  metadata:
    name: ${SPACE_NAME}-tekton-view
  roleRef:
    apiGroup: rbac.authorization.k8s.io
    kind: ClusterRole
    name: tekton-view-for-${SPACE_NAME}
  subjects:
  - kind: User
    name: ${SPACE_NAME}
- apiVersion: toolchain.dev.openshift.com/v1alpha1
  kind: Idler
  metadata:
    name: ${SPACE_NAME}-dev
  spec:
    timeoutSeconds: 28800
- apiVersion: toolchain.dev.openshift.com/v1alpha1
  kind: Idler
  metadata:
    name: ${SPACE_NAME}-code
  spec:
    timeoutSeconds: 28800
- apiVersion: toolchain.dev.openshift.com/v1alpha1
  kind: Idler
  metadata:
    name: ${SPACE_NAME}-stage
  spec:
    timeoutSeconds: 28800
parameters:
- name: SPACE_NAME
  required: true
"#;

const CLUSTER_RESOURCES_WITH_FEATURES_TEMPLATE: &str = r#"
objects:
- apiVersion: quota.openshift.io/v1
  kind: ClusterResourceQuota
  metadata:
    name: for-${SPACE_NAME}
  spec:
    quota:
      hard:
        limits.cpu: 2000m
    selector:
      annotations:
        openshift.io/requester: ${SPACE_NAME}
- apiVersion: rbac.authorization.k8s.io/v1
  kind: ClusterRoleBinding
  metadata:
    name: ${SPACE_NAME}-feature-1
    annotations:
      toolchain.dev.openshift.com/feature: feature-1
  roleRef:
    apiGroup: rbac.authorization.k8s.io
    kind: ClusterRole
    name: feature-1
  subjects:
  - kind: User
    name: ${SPACE_NAME}
- apiVersion: rbac.authorization.k8s.io/v1
  kind: ClusterRoleBinding
  metadata:
    name: ${SPACE_NAME}-feature-2
    annotations:
      toolchain.dev.openshift.com/feature: feature-2
  roleRef:
    apiGroup: rbac.authorization.k8s.io
    kind: ClusterRole
    name: feature-2
  subjects:
  - kind: User
    name: ${SPACE_NAME}
parameters:
- name: SPACE_NAME
  required: true
"#;

const BASIC_CLUSTER_RESOURCES_TEMPLATE: &str = r#"
objects:
- apiVersion: quota.openshift.io/v1
  kind: ClusterResourceQuota
  metadata:
    name: for-${SPACE_NAME}
  spec:
    quota:
      hard:
        limits.cpu: 1000m
    selector:
      annotations:
        openshift.io/requester: ${SPACE_NAME}
parameters:
- name: SPACE_NAME
  required: true
"#;

fn namespace_template(type_name: &str, rolebinding: &str) -> String {
    format!(
        r#"
objects:
- apiVersion: v1
  kind: Namespace
  metadata:
    name: ${{SPACE_NAME}}-{type_name}
- apiVersion: rbac.authorization.k8s.io/v1
  kind: Role
  metadata:
    name: exec-pods
    namespace: ${{SPACE_NAME}}-{type_name}
  rules:
  - apiGroups: [""]
    resources: ["pods/exec"]
    verbs: ["get", "list", "watch", "create", "delete", "update"]
- apiVersion: rbac.authorization.k8s.io/v1
  kind: RoleBinding
  metadata:
    name: {rolebinding}
    namespace: ${{SPACE_NAME}}-{type_name}
  roleRef:
    apiGroup: rbac.authorization.k8s.io
    kind: Role
    name: exec-pods
  subjects:
  - kind: Group
    name: crtadmins
parameters:
- name: SPACE_NAME
  required: true
- name: MEMBER_OPERATOR_NAMESPACE
"#
    )
}

fn space_role_template(role: &str) -> String {
    format!(
        r#"
objects:
- apiVersion: rbac.authorization.k8s.io/v1
  kind: Role
  metadata:
    name: space-{role}
    namespace: ${{NAMESPACE}}
  rules:
  - apiGroups: ["*"]
    resources: ["*"]
    verbs: ["get", "list", "watch"]
- apiVersion: rbac.authorization.k8s.io/v1
  kind: RoleBinding
  metadata:
    name: ${{USERNAME}}-space-{role}
    namespace: ${{NAMESPACE}}
  roleRef:
    apiGroup: rbac.authorization.k8s.io
    kind: Role
    name: space-{role}
  subjects:
  - kind: User
    name: ${{USERNAME}}
parameters:
- name: NAMESPACE
  required: true
- name: USERNAME
  required: true
"#
    )
}

pub fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".into(),
        message: message.into(),
        reason: reason.into(),
        code,
    }))
}

pub fn api_group(name: &str, version: &str) -> APIGroup {
    APIGroup {
        name: name.into(),
        versions: vec![GroupVersionForDiscovery {
            group_version: format!("{name}/{version}"),
            version: version.into(),
        }],
        ..Default::default()
    }
}

pub fn default_api_groups() -> Vec<APIGroup> {
    vec![
        api_group("quota.openshift.io", "v1"),
        api_group("rbac.authorization.k8s.io", "v1"),
        api_group("toolchain.dev.openshift.com", "v1alpha1"),
    ]
}

/// Host cluster serving TierTemplates from memory and counting the fetches
#[derive(Clone, Default)]
pub struct FakeHost {
    templates: Arc<Mutex<HashMap<String, TierTemplate>>>,
    fetches: Arc<AtomicUsize>,
}

impl FakeHost {
    pub fn with_advanced_tier() -> Self {
        let host = Self::default();
        host.add(ADVANCED_CLUSTER_RESOURCES, "advanced", "clusterresources", CLUSTER_RESOURCES_TEMPLATE);
        host.add(
            ADVANCED_CLUSTER_RESOURCES_WITH_FEATURES,
            "advanced",
            "clusterresources",
            CLUSTER_RESOURCES_WITH_FEATURES_TEMPLATE,
        );
        host.add(BASIC_CLUSTER_RESOURCES, "basic", "clusterresources", BASIC_CLUSTER_RESOURCES_TEMPLATE);
        host.add(ADVANCED_DEV, "advanced", "dev", &namespace_template("dev", "crtadmin-pods"));
        host.add(ADVANCED_DEV_NEXT, "advanced", "dev", &namespace_template("dev", "crtadmin-view"));
        host.add(ADVANCED_STAGE, "advanced", "stage", &namespace_template("stage", "crtadmin-pods"));
        host.add(ADVANCED_ADMIN, "advanced", "admin", &space_role_template("admin"));
        host.add(ADVANCED_VIEWER, "advanced", "viewer", &space_role_template("viewer"));
        host
    }

    pub fn add(&self, template_ref: &str, tier: &str, type_name: &str, yaml: &str) {
        let revision = template_ref.rsplit('-').next().unwrap_or_default();
        let template = TierTemplate::new(
            template_ref,
            TierTemplateSpec {
                tier_name: tier.into(),
                r#type: type_name.into(),
                revision: revision.into(),
                template: serde_yaml::from_str(yaml).unwrap(),
            },
        );
        self.templates
            .lock()
            .unwrap()
            .insert(template_ref.into(), template);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn cluster(&self, ready: bool) -> HostCluster {
        HostCluster {
            client: Arc::new(self.clone()),
            operator_namespace: HOST_NAMESPACE.into(),
            ready,
        }
    }
}

#[async_trait]
impl HostClusterClient for FakeHost {
    async fn get_tier_template(&self, namespace: &str, name: &str) -> Result<TierTemplate> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if namespace != HOST_NAMESPACE {
            return Err(api_error(404, "NotFound", "wrong namespace"));
        }
        self.templates
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                api_error(
                    404,
                    "NotFound",
                    &format!("tiertemplates.toolchain.dev.openshift.com \"{name}\" not found"),
                )
            })
    }
}

/// A call made against the fake cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Apply { kind: String, name: String },
    Delete { kind: String, name: String },
    PatchNamespace { name: String },
    PatchFinalizers { name: String },
    PatchStatus { name: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Apply,
    Delete,
    PatchNamespace,
    PatchStatus,
}

type Key = (String, String, String, String);

fn key(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Key {
    (
        api_version.into(),
        kind.into(),
        namespace.unwrap_or_default().into(),
        name.into(),
    )
}

fn has_labels(obj: &DynamicObject, labels: &BTreeMap<String, String>) -> bool {
    let existing = obj.labels();
    labels.iter().all(|(k, v)| existing.get(k) == Some(v))
}

/// Member cluster held in memory, journaling every mutation
#[derive(Default)]
pub struct FakeKubeClient {
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    nstemplatesets: Mutex<BTreeMap<(String, String), NSTemplateSet>>,
    ops: Mutex<Vec<Op>>,
    failures: Mutex<Vec<(Verb, String)>>,
    /// Deleted namespaces stay around as Terminating
    pub slow_namespace_deletion: AtomicBool,
    /// Created namespaces never become Active
    pub pending_namespaces: AtomicBool,
}

impl FakeKubeClient {
    pub fn insert_nstemplateset(&self, tmpl: NSTemplateSet) {
        let key = (tmpl.namespace().unwrap_or_default(), tmpl.name_any());
        self.nstemplatesets.lock().unwrap().insert(key, tmpl);
    }

    pub fn nstemplateset(&self, name: &str) -> Option<NSTemplateSet> {
        self.nstemplatesets
            .lock()
            .unwrap()
            .get(&(WATCH_NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn insert(&self, obj: DynamicObject) {
        let types = obj.types.clone().unwrap();
        let key = key(
            &types.api_version,
            &types.kind,
            obj.metadata.namespace.as_deref(),
            &obj.name_any(),
        );
        self.objects.lock().unwrap().insert(key, obj);
    }

    pub fn all_objects(&self) -> Vec<DynamicObject> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    /// Names of the stored objects of a kind
    pub fn names_of(&self, kind: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((_, k, _, _), _)| k == kind)
            .map(|((_, _, _, name), _)| name.clone())
            .collect()
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|((_, k, ns, n), _)| {
                k == kind && ns.as_str() == namespace.unwrap_or_default() && n == name
            })
            .map(|(_, obj)| obj.clone())
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.object("Namespace", None, name)
            .map(|obj| serde_json::from_value(serde_json::to_value(obj).unwrap()).unwrap())
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    /// Recorded calls that changed derived objects (everything but NSTemplateSet writes)
    pub fn mutations(&self) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| !matches!(op, Op::PatchStatus { .. } | Op::PatchFinalizers { .. }))
            .collect()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    /// Make every `verb` call on `kind` fail. `*` matches any kind.
    pub fn fail(&self, verb: Verb, kind: &str) {
        self.failures.lock().unwrap().push((verb, kind.into()));
    }

    fn check(&self, verb: Verb, kind: &str) -> Result<()> {
        let failing = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|(v, k)| *v == verb && (k == kind || k == "*"));
        if failing {
            return Err(api_error(500, "InternalError", &format!("mock {verb:?} {kind} error")));
        }
        Ok(())
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn get_nstemplateset(&self, namespace: &str, name: &str) -> Result<Option<NSTemplateSet>> {
        self.check(Verb::Get, "NSTemplateSet")?;
        Ok(self
            .nstemplatesets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn patch_nstemplateset_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        self.record(Op::PatchFinalizers { name: name.into() });
        let mut tmpls = self.nstemplatesets.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let gone = match tmpls.get_mut(&key) {
            Some(tmpl) => {
                tmpl.metadata.finalizers = Some(finalizers.clone());
                finalizers.is_empty() && tmpl.metadata.deletion_timestamp.is_some()
            }
            None => return Err(api_error(404, "NotFound", "nstemplateset not found")),
        };
        if gone {
            tmpls.remove(&key);
        }
        Ok(())
    }

    async fn patch_nstemplateset_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NSTemplateSetStatus,
    ) -> Result<()> {
        self.check(Verb::PatchStatus, "NSTemplateSet")?;
        self.record(Op::PatchStatus { name: name.into() });
        match self
            .nstemplatesets
            .lock()
            .unwrap()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            Some(tmpl) => {
                tmpl.status = Some(status.clone());
                Ok(())
            }
            None => Err(api_error(404, "NotFound", "nstemplateset not found")),
        }
    }

    async fn list_namespaces(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Namespace>> {
        self.check(Verb::List, "Namespace")?;
        let namespaces = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((_, kind, _, _), obj)| kind == "Namespace" && has_labels(obj, labels))
            .map(|(_, obj)| serde_json::from_value(serde_json::to_value(obj).unwrap()).unwrap())
            .collect();
        Ok(namespaces)
    }

    async fn patch_namespace_metadata(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.check(Verb::PatchNamespace, "Namespace")?;
        self.record(Op::PatchNamespace { name: name.into() });
        let mut objects = self.objects.lock().unwrap();
        let ns = objects
            .get_mut(&key("v1", "Namespace", None, name))
            .ok_or_else(|| api_error(404, "NotFound", "namespace not found"))?;
        ns.labels_mut()
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        ns.annotations_mut()
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.check(Verb::Get, &resource.kind)?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&key(&resource.api_version, &resource.kind, namespace, name))
            .cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        self.check(Verb::List, &resource.kind)?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((api_version, kind, ns, _), obj)| {
                api_version == &resource.api_version
                    && kind == &resource.kind
                    && namespace.is_none_or(|n| n == ns)
                    && has_labels(obj, labels)
            })
            // the API server leaves apiVersion and kind out of list items
            .map(|(_, obj)| DynamicObject {
                types: None,
                ..obj.clone()
            })
            .collect())
    }

    async fn apply(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<()> {
        self.check(Verb::Apply, &resource.kind)?;
        let name = obj.name_any();
        self.record(Op::Apply {
            kind: resource.kind.clone(),
            name: name.clone(),
        });
        let key = key(
            &resource.api_version,
            &resource.kind,
            obj.metadata.namespace.as_deref(),
            &name,
        );
        let mut objects = self.objects.lock().unwrap();
        let mut applied = obj.clone();
        if let Some(existing) = objects.get(&key) {
            let mut labels = existing.labels().clone();
            labels.extend(obj.labels().clone());
            applied.metadata.labels = Some(labels);
            let mut annotations = existing.annotations().clone();
            annotations.extend(obj.annotations().clone());
            applied.metadata.annotations = Some(annotations);
            applied.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
            if resource.kind == "Namespace" {
                applied.data["status"] = existing.data["status"].clone();
            }
        } else if resource.kind == "Namespace" && !self.pending_namespaces.load(Ordering::SeqCst) {
            applied.data["status"] = json!({"phase": "Active"});
        }
        objects.insert(key, applied);
        Ok(())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        self.check(Verb::Delete, &resource.kind)?;
        let key = key(&resource.api_version, &resource.kind, namespace, name);
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&key) {
            return Ok(false);
        }
        self.record(Op::Delete {
            kind: resource.kind.clone(),
            name: name.into(),
        });
        if resource.kind == "Namespace" {
            if self.slow_namespace_deletion.load(Ordering::SeqCst) {
                if let Some(ns) = objects.get_mut(&key) {
                    ns.metadata.deletion_timestamp = Some(Time(Utc::now()));
                    ns.data["status"] = json!({"phase": "Terminating"});
                }
                return Ok(true);
            }
            // namespaced content goes with the namespace
            objects.retain(|(_, _, ns, _), _| ns != name);
        }
        objects.remove(&key);
        Ok(true)
    }
}

/// The NSTemplateSet of the `johnsmith` space on the `advanced` tier with a `dev` namespace
pub fn johnsmith() -> NSTemplateSet {
    let mut tmpl = NSTemplateSet::new(
        "johnsmith",
        NSTemplateSetSpec {
            tier_name: "advanced".into(),
            namespaces: vec![NSTemplateSetNamespace {
                template_ref: ADVANCED_DEV.into(),
            }],
            cluster_resources: Some(NSTemplateSetClusterResources {
                template_ref: ADVANCED_CLUSTER_RESOURCES.into(),
            }),
            space_roles: vec![],
        },
    );
    tmpl.metadata.namespace = Some(WATCH_NAMESPACE.into());
    tmpl.metadata.finalizers = Some(vec![NSTEMPLATESET_FINALIZER.into()]);
    tmpl
}

pub fn with_features(mut tmpl: NSTemplateSet, features: &str) -> NSTemplateSet {
    tmpl.annotations_mut()
        .insert(FEATURE_TOGGLE_NAME_ANNOTATION_KEY.into(), features.into());
    tmpl
}

/// Everything a manager under test needs, wired to the fakes
pub struct ApiClientBuilder {
    client: Arc<FakeKubeClient>,
    host: Arc<dyn HostClusterAccessor>,
    api_groups: Vec<APIGroup>,
}

impl ApiClientBuilder {
    pub fn new(client: Arc<FakeKubeClient>) -> Self {
        let host = FakeHost::with_advanced_tier();
        Self {
            client,
            host: Arc::new(move || Some(host.cluster(true))),
            api_groups: default_api_groups(),
        }
    }

    pub fn host(mut self, host: impl HostClusterAccessor + 'static) -> Self {
        self.host = Arc::new(host);
        self
    }

    pub fn api_groups(mut self, api_groups: Vec<APIGroup>) -> Self {
        self.api_groups = api_groups;
        self
    }

    pub fn build(self) -> ApiClient {
        ApiClient {
            client: self.client,
            host: self.host,
            tier_templates: Arc::new(TierTemplateCache::new()),
            operator_namespace: WATCH_NAMESPACE.into(),
            available_api_groups: Arc::new(self.api_groups),
        }
    }
}
