//! EMQX Custom Resource Definition
//!
//! The EMQX CRD represents a managed EMQX broker cluster made of stateful
//! core nodes and optional stateless replicant nodes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, EmqxNode, EmqxState, NodeRole, NodeTemplate, ServiceTemplate};

/// Replica count used when the core template does not declare one
pub const DEFAULT_CORE_REPLICAS: i32 = 2;

/// Structured validation error for `EmqxSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.emqx.io",
    version = "v2alpha1",
    kind = "EMQX",
    root = "Emqx",
    plural = "emqxes",
    namespaced,
    status = "EmqxStatus",
    shortname = "emqx",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Core","type":"integer","jsonPath":".status.coreNodeReadyReplicas"}"#,
    printcolumn = r#"{"name":"Replicant","type":"integer","jsonPath":".status.replicantNodeReadyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EmqxSpec {
    /// EMQX container image, e.g. `emqx/emqx:5.1.0`
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Cluster DNS domain used to build node FQDNs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,

    /// Extra HOCON appended to the generated `emqx.conf`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_config: Option<String>,

    #[serde(default)]
    pub core_template: NodeTemplate,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicant_template: Option<NodeTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_service_template: Option<ServiceTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listeners_service_template: Option<ServiceTemplate>,
}

impl EmqxSpec {
    /// Declared core replicas
    pub fn core_replicas(&self) -> i32 {
        self.core_template
            .spec
            .replicas
            .unwrap_or(DEFAULT_CORE_REPLICAS)
    }

    /// Declared replicant replicas; an absent template means zero
    pub fn replicant_replicas(&self) -> i32 {
        self.replicant_template
            .as_ref()
            .and_then(|t| t.spec.replicas)
            .unwrap_or(0)
    }

    /// Declared replicas for a node role
    pub fn replicas_for(&self, role: NodeRole) -> i32 {
        match role {
            NodeRole::Core => self.core_replicas(),
            NodeRole::Replicant => self.replicant_replicas(),
        }
    }

    pub fn cluster_domain(&self) -> &str {
        self.cluster_domain.as_deref().unwrap_or("cluster.local")
    }

    /// Validate the spec
    ///
    /// Core replicas must be at least 1, replicant replicas may be zero, and
    /// statically declared listener ports must be uniquely named and in range.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();

        if self.image.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.image",
                "image must not be empty",
                "Set spec.image to an EMQX image reference such as emqx/emqx:5.1.0.",
            ));
        }

        if let Some(replicas) = self.core_template.spec.replicas {
            if replicas < 1 {
                errors.push(SpecValidationError::new(
                    "spec.coreTemplate.spec.replicas",
                    "core replicas must be at least 1",
                    "Set spec.coreTemplate.spec.replicas to 1 or more; core nodes own cluster membership.",
                ));
            }
        }

        if let Some(replicas) = self
            .replicant_template
            .as_ref()
            .and_then(|t| t.spec.replicas)
        {
            if replicas < 0 {
                errors.push(SpecValidationError::new(
                    "spec.replicantTemplate.spec.replicas",
                    "replicant replicas must not be negative",
                    "Set spec.replicantTemplate.spec.replicas to 0 or more.",
                ));
            }
        }

        if let Some(template) = &self.listeners_service_template {
            let mut seen = std::collections::BTreeSet::new();
            for (i, port) in template.spec.ports.iter().enumerate() {
                match port.name.as_deref() {
                    Some(name) if !name.is_empty() => {
                        if !seen.insert(name.to_string()) {
                            errors.push(SpecValidationError::new(
                                format!("spec.listenersServiceTemplate.spec.ports[{i}].name"),
                                format!("duplicate port name {name:?}"),
                                "Give every declared listener port a unique name.",
                            ));
                        }
                    }
                    _ => errors.push(SpecValidationError::new(
                        format!("spec.listenersServiceTemplate.spec.ports[{i}].name"),
                        "declared listener ports must be named",
                        "Set a name on each port; names are used to merge with discovered listeners.",
                    )),
                }
                if !(1..=65535).contains(&port.port) {
                    errors.push(SpecValidationError::new(
                        format!("spec.listenersServiceTemplate.spec.ports[{i}].port"),
                        format!("port {} is out of range", port.port),
                        "Use a port between 1 and 65535.",
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Observed state of an EMQX cluster, owned by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxStatus {
    /// Current lifecycle state, set directly by each transition
    #[serde(default)]
    pub state: EmqxState,

    /// Image the core nodes were last validated against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image: Option<String>,

    #[serde(default)]
    pub core_node_replicas: i32,

    #[serde(default)]
    pub core_node_ready_replicas: i32,

    #[serde(default)]
    pub replicant_node_replicas: i32,

    #[serde(default)]
    pub replicant_node_ready_replicas: i32,

    /// Nodes reported by the EMQX management API on the last pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emqx_nodes: Vec<EmqxNode>,

    /// Condition history; the `state` field is authoritative
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl EmqxStatus {
    pub fn is_running(&self) -> bool {
        self.state == EmqxState::Running
    }

    pub fn find_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

impl Emqx {
    /// Current state, `Init` if status was never written
    pub fn state(&self) -> EmqxState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Nodes observed on the last pass
    pub fn observed_nodes(&self) -> &[EmqxNode] {
        self.status
            .as_ref()
            .map(|s| s.emqx_nodes.as_slice())
            .unwrap_or(&[])
    }
}
