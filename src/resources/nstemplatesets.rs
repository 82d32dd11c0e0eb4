use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static NSTEMPLATESET_FINALIZER: &str = "finalizer.toolchain.dev.openshift.com";

/// Name of the space owning a namespace
pub const OWNER_LABEL_KEY: &str = "toolchain.dev.openshift.com/owner";
/// Name of the space owning a cluster-scoped resource
pub const SPACE_LABEL_KEY: &str = "toolchain.dev.openshift.com/space";
/// Namespace type (eg. `dev`) or `clusterresources`
pub const TYPE_LABEL_KEY: &str = "toolchain.dev.openshift.com/type";
pub const TEMPLATE_REF_LABEL_KEY: &str = "toolchain.dev.openshift.com/templateref";
pub const TIER_LABEL_KEY: &str = "toolchain.dev.openshift.com/tier";
pub const PROVIDER_LABEL_KEY: &str = "toolchain.dev.openshift.com/provider";
pub const PROVIDER_LABEL_VALUE: &str = "codeready-toolchain";

/// Comma-separated feature toggles on an NSTemplateSet, or the single feature a template object belongs to
pub const FEATURE_TOGGLE_NAME_ANNOTATION_KEY: &str = "toolchain.dev.openshift.com/feature";
/// JSON snapshot of the space roles last applied to a namespace
pub const LAST_APPLIED_SPACE_ROLES_ANNOTATION_KEY: &str =
    "toolchain.dev.openshift.com/last-applied-space-roles";
/// Objects carrying this annotation are skipped when their API group is not served
pub const OPTIONAL_RESOURCE_ANNOTATION_KEY: &str = "toolchain.dev.openshift.com/optional-resource";

pub const CLUSTER_RESOURCES_TEMPLATE_TYPE: &str = "clusterresources";

pub const CONDITION_READY: &str = "Ready";

/// Describes the namespaces, cluster resources and space roles provisioned for one space
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "NSTemplateSet",
    group = "toolchain.dev.openshift.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Tier", "type":"string", "jsonPath":".spec.tierName"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[kube(status = "NSTemplateSetStatus", shortname = "nstt")]
#[serde(rename_all = "camelCase")]
pub struct NSTemplateSetSpec {
    /// The name of the tier the templates belong to
    pub tier_name: String,

    /// One entry per namespace type
    #[serde(default)]
    pub namespaces: Vec<NSTemplateSetNamespace>,

    /// The cluster-scoped resources, if the tier defines any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_resources: Option<NSTemplateSetClusterResources>,

    /// Roles to grant to users in every namespace of the space
    #[serde(default)]
    pub space_roles: Vec<NSTemplateSetSpaceRole>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NSTemplateSetNamespace {
    pub template_ref: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NSTemplateSetClusterResources {
    pub template_ref: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NSTemplateSetSpaceRole {
    pub template_ref: String,
    #[serde(default)]
    pub usernames: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NSTemplateSetStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Namespaces owned by the space, sorted by name
    #[serde(default)]
    pub provisioned_namespaces: Vec<SpaceNamespace>,

    /// The following fields mirror the spec once it is fully provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_resources: Option<NSTemplateSetClusterResources>,
    #[serde(default)]
    pub namespaces: Vec<NSTemplateSetNamespace>,
    #[serde(default)]
    pub space_roles: Vec<NSTemplateSetSpaceRole>,
    #[serde(default)]
    pub feature_toggles: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpaceNamespace {
    pub name: String,
    /// Set to `default` for the namespace users land in
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition, known values are (`Ready`).
    pub r#type: String,

    /// Status is the status of the condition. Can be True, False, Unknown.
    pub status: String,

    /// Unique, one-word, CamelCase reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message indicating details about last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// Reasons of the Ready condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyReason {
    Provisioning,
    Updating,
    Provisioned,
    Terminating,
    UnableToProvision,
    UnableToProvisionNamespace,
    UnableToProvisionClusterResources,
    UnableToProvisionSpaceRoles,
    UpdateFailed,
    TerminatingFailed,
}

impl ReadyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyReason::Provisioning => "Provisioning",
            ReadyReason::Updating => "Updating",
            ReadyReason::Provisioned => "Provisioned",
            ReadyReason::Terminating => "Terminating",
            ReadyReason::UnableToProvision => "UnableToProvision",
            ReadyReason::UnableToProvisionNamespace => "UnableToProvisionNamespace",
            ReadyReason::UnableToProvisionClusterResources => "UnableToProvisionClusterResources",
            ReadyReason::UnableToProvisionSpaceRoles => "UnableToProvisionSpaceRoles",
            ReadyReason::UpdateFailed => "UpdateFailed",
            ReadyReason::TerminatingFailed => "TerminatingFailed",
        }
    }
}

impl std::fmt::Display for ReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NSTemplateSet {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == CONDITION_READY))
    }

    /// Whether the Ready condition currently carries the given reason
    pub fn ready_reason_is(&self, reason: ReadyReason) -> bool {
        self.ready_condition()
            .and_then(|c| c.reason.as_deref())
            .is_some_and(|r| r == reason.as_str())
    }

    /// The raw feature toggle annotation. `Some("")` and `None` are distinct.
    pub fn feature_toggles(&self) -> Option<&str> {
        self.annotations()
            .get(FEATURE_TOGGLE_NAME_ANNOTATION_KEY)
            .map(String::as_str)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == NSTEMPLATESET_FINALIZER)
    }

    /// Labels identifying the namespaces owned by this space
    pub fn owner_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(OWNER_LABEL_KEY.to_string(), self.name_any())])
    }

    /// Labels identifying the cluster resources owned by this space
    pub fn space_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(SPACE_LABEL_KEY.to_string(), self.name_any())])
    }
}
