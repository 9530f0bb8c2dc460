use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A k3k virtual cluster. Only the fields the controller reads or tears
/// down are typed; the rest is owned by the k3k operator.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "k3k.io", version = "v1alpha1", kind = "Cluster")]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<i32>,
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "k3k.io", version = "v1alpha1", kind = "VirtualClusterPolicy")]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterPolicySpec {
    #[serde(default)]
    pub allowed_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority_class: Option<String>,
}

/// Higress registry bridge. Registries are opaque to the sync bridge and
/// copied verbatim.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "networking.higress.io", version = "v1", kind = "McpBridge")]
#[kube(namespaced)]
pub struct McpBridgeSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registries: Vec<Value>,
}
