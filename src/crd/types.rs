//! Shared types for EMQX cluster specifications
//!
//! These types are used across the CRD definition and controller logic.
//!
//! # Type Hierarchy
//!
//! - [`NodeRole`] - Role of an EMQX node in the cluster (core or replicant)
//! - [`NodeTemplate`] - Workload template for one node role
//! - [`ServiceTemplate`] - Template for the dashboard and listener Services
//! - [`Condition`] - Lifecycle condition reported in status
//! - [`EmqxNode`] - A node as reported by the EMQX management API
//! - [`EmqxState`] - Explicit lifecycle state of the cluster

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ServicePort};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role of an EMQX node in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Owns persistent identity and participates in cluster-membership storage
    Core,
    /// Stateless node that joins an existing cluster
    Replicant,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Core => "core",
            NodeRole::Replicant => "replicant",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style resource requirements
///
/// Resource quantities use the usual formats (`"500m"`, `"1Gi"`).
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Minimum resources requested
    pub requests: ResourceSpec,
    /// Maximum resources allowed
    pub limits: ResourceSpec,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            requests: ResourceSpec {
                cpu: "250m".to_string(),
                memory: "512Mi".to_string(),
            },
            limits: ResourceSpec {
                cpu: "1".to_string(),
                memory: "1Gi".to_string(),
            },
        }
    }
}

/// Resource specification for CPU and memory
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceSpec {
    /// CPU cores (e.g., "500m", "2")
    pub cpu: String,
    /// Memory (e.g., "512Mi", "2Gi")
    pub memory: String,
}

/// Persistent storage for core nodes
///
/// When absent, core nodes keep their data in an `emptyDir` volume.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Storage class name; the cluster default class is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Size of each PersistentVolumeClaim (e.g., "10Gi")
    pub size: String,
}

/// Labels and annotations copied onto generated objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Overrides the generated object name where supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Pod-level settings for one node role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateSpec {
    /// Desired number of replicas; `None` means "use the role default"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Extra environment variables for the EMQX container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub env: Vec<EnvVar>,

    /// Additional container ports exposed by the EMQX container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub extra_ports: Vec<ServicePort>,

    /// Persistent storage (core nodes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
}

/// Workload template for core or replicant nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    #[serde(default)]
    pub spec: NodeTemplateSpec,
}

/// Service settings for the dashboard and listener Services
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplateSpec {
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Statically declared ports; these win over discovered listeners
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub ports: Vec<ServicePort>,
}

/// Template for a Service managed by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    #[serde(default)]
    pub spec: ServiceTemplateSpec,
}

/// Explicit lifecycle state of an EMQX cluster
///
/// Variants are ordered by lifecycle progress.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum EmqxState {
    /// Not yet observed by the operator
    #[default]
    Init,
    /// Child objects are being created
    Creating,
    /// Core nodes are rolling out (or re-validating after an image change)
    CoreUpdating,
    /// Core nodes are ready, replicant nodes are rolling out
    CoreReady,
    /// Every declared node is ready and running
    Running,
}

impl EmqxState {
    /// Condition type that is `True` while the cluster is in this state
    pub fn condition_type(&self) -> Option<&'static str> {
        match self {
            EmqxState::Init => None,
            EmqxState::Creating => Some(CONDITION_TYPE_CREATING),
            EmqxState::CoreUpdating => Some(CONDITION_TYPE_CORE_NODES_UPDATING),
            EmqxState::CoreReady => Some(CONDITION_TYPE_CORE_NODES_READY),
            EmqxState::Running => Some(CONDITION_TYPE_RUNNING),
        }
    }
}

impl std::fmt::Display for EmqxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmqxState::Init => write!(f, "Init"),
            EmqxState::Creating => write!(f, "Creating"),
            EmqxState::CoreUpdating => write!(f, "CoreUpdating"),
            EmqxState::CoreReady => write!(f, "CoreReady"),
            EmqxState::Running => write!(f, "Running"),
        }
    }
}

/// Lifecycle condition types
pub const CONDITION_TYPE_CREATING: &str = "Creating";
pub const CONDITION_TYPE_CORE_NODES_UPDATING: &str = "CoreNodesUpdating";
pub const CONDITION_TYPE_CORE_NODES_READY: &str = "CoreNodesReady";
pub const CONDITION_TYPE_RUNNING: &str = "Running";

/// Condition for status reporting (Kubernetes convention)
///
/// At most one condition of each type exists; entries are never removed, so
/// the list doubles as an audit trail of past states.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Creating", "Running")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True" or "False"
    pub status: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Last time the condition flipped status
    pub last_transition_time: String,
    /// Last time the condition was written
    pub last_update_time: String,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// An EMQX node as reported by `GET /api/v5/nodes`
///
/// Rebuilt on every reconcile pass and never persisted beyond the status
/// snapshot. Volatile API fields such as uptime are not kept, so an
/// unchanged cluster yields an unchanged status.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxNode {
    /// Erlang node name, `name@address`
    pub node: String,
    /// "running" or "stopped"
    #[serde(alias = "node_status")]
    pub node_status: String,
    #[serde(default, alias = "otp_release", skip_serializing_if = "Option::is_none")]
    pub otp_release: Option<String>,
    #[serde(default)]
    pub version: String,
    pub role: NodeRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
}

impl EmqxNode {
    pub fn is_running(&self) -> bool {
        self.node_status == "running"
    }

    /// Address part of the node name (after `@`)
    pub fn host(&self) -> &str {
        self.node
            .split_once('@')
            .map(|(_, host)| host)
            .unwrap_or(&self.node)
    }
}

/// Number of running nodes with the given role
pub fn running_nodes(nodes: &[EmqxNode], role: NodeRole) -> i32 {
    nodes
        .iter()
        .filter(|n| n.role == role && n.is_running())
        .count() as i32
}
