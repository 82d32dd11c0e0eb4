use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Idles the workloads of a namespace once they ran for longer than the timeout
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "Idler",
    group = "toolchain.dev.openshift.com",
    version = "v1alpha1"
)]
#[serde(rename_all = "camelCase")]
pub struct IdlerSpec {
    pub timeout_seconds: i32,
}
