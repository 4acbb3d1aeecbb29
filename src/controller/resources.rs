//! Kubernetes resource builders for EMQX clusters
//!
//! This module creates and manages the child objects of an `EMQX` resource:
//! bootstrap Secrets, the `emqx.conf` ConfigMap, the headless and dashboard
//! Services, the core StatefulSet and the replicant Deployment. Listener
//! routing objects live in `listeners.rs`.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, HTTPGetAction, KeyToPath, LocalObjectReference, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements as K8sResources, Secret, SecretKeySelector, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::crd::{Emqx, NodeRole, NodeTemplate, ServiceTemplate};
use crate::error::{Error, Result, ResultExt};

use super::emqx_api::MANAGEMENT_PORT;

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "emqx-operator";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_DB_ROLE: &str = "apps.emqx.io/db-role";
pub const ANNOTATION_CONFIG_HASH: &str = "apps.emqx.io/config-hash";

/// Erlang distribution (ekka) port
pub const EKKA_PORT: i32 = 4370;
/// gen_rpc port
pub const GEN_RPC_PORT: i32 = 5369;

const CONFIG_FILE: &str = "emqx.conf";
const BOOTSTRAP_API_KEY_FILE: &str = "bootstrap_api_key";
const BOOTSTRAP_API_KEY_NAME: &str = "emqx-operator-controller";
const EMQX_HOME: &str = "/opt/emqx";

// ============================================================================
// Naming and metadata
// ============================================================================

/// Labels shared by every object owned by an EMQX cluster
pub fn standard_labels(emqx: &Emqx) -> BTreeMap<String, String> {
    let mut labels = selector_labels(emqx);
    labels.insert(LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string());
    labels
}

/// Minimal stable label set used in selectors
pub fn selector_labels(emqx: &Emqx) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_NAME.to_string(), "emqx".to_string());
    labels.insert(LABEL_INSTANCE.to_string(), emqx.name_any());
    labels
}

/// Selector labels for pods of one node role
pub fn role_selector_labels(emqx: &Emqx, role: NodeRole) -> BTreeMap<String, String> {
    let mut labels = selector_labels(emqx);
    labels.insert(LABEL_DB_ROLE.to_string(), role.to_string());
    labels
}

/// Render a label map as a label selector string (`k=v,k=v`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(emqx: &Emqx) -> OwnerReference {
    OwnerReference {
        api_version: Emqx::api_version(&()).to_string(),
        kind: Emqx::kind(&()).to_string(),
        name: emqx.name_any(),
        uid: emqx.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build the resource name for a given component
pub fn resource_name(emqx: &Emqx, suffix: &str) -> String {
    format!("{}-{}", emqx.name_any(), suffix)
}

pub fn namespace_of(emqx: &Emqx) -> String {
    emqx.namespace().unwrap_or_else(|| "default".to_string())
}

pub fn workload_name(emqx: &Emqx, role: NodeRole) -> String {
    resource_name(emqx, role.as_str())
}

pub fn headless_service_name(emqx: &Emqx) -> String {
    resource_name(emqx, "headless")
}

pub fn dashboard_service_name(emqx: &Emqx) -> String {
    template_name(emqx.spec.dashboard_service_template.as_ref())
        .unwrap_or_else(|| resource_name(emqx, "dashboard"))
}

pub fn listeners_service_name(emqx: &Emqx) -> String {
    template_name(emqx.spec.listeners_service_template.as_ref())
        .unwrap_or_else(|| resource_name(emqx, "listeners"))
}

pub fn node_cookie_secret_name(emqx: &Emqx) -> String {
    resource_name(emqx, "node-cookie")
}

pub fn bootstrap_api_key_secret_name(emqx: &Emqx) -> String {
    resource_name(emqx, "bootstrap-api-key")
}

pub fn config_map_name(emqx: &Emqx) -> String {
    resource_name(emqx, "configs")
}

fn template_name(template: Option<&ServiceTemplate>) -> Option<String> {
    template
        .and_then(|t| t.metadata.name.clone())
        .filter(|n| !n.is_empty())
}

fn object_meta(
    emqx: &Emqx,
    name: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: emqx.namespace(),
        labels: Some(labels),
        annotations: if annotations.is_empty() {
            None
        } else {
            Some(annotations)
        },
        owner_references: Some(vec![owner_reference(emqx)]),
        ..Default::default()
    }
}

/// Server-side apply `obj` under the operator's field manager
pub async fn apply<K>(client: &Client, namespace: &str, name: &str, obj: &K) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let kind = K::kind(&K::DynamicType::default()).to_string();
    debug!("Applying {} {}/{}", kind, namespace, name);
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(obj),
    )
    .await
    .context(format!("apply {kind} {name}"))
}

// ============================================================================
// Bootstrap Secrets
// ============================================================================

/// Random alphanumeric string of `len` characters
pub fn generate_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn build_secret(emqx: &Emqx, name: String, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: object_meta(emqx, name, standard_labels(emqx), BTreeMap::new()),
        string_data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

pub fn build_node_cookie_secret(emqx: &Emqx, cookie: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert("node_cookie".to_string(), cookie.to_string());
    build_secret(emqx, node_cookie_secret_name(emqx), data)
}

pub fn build_bootstrap_api_key_secret(emqx: &Emqx, secret: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert("key".to_string(), BOOTSTRAP_API_KEY_NAME.to_string());
    data.insert("secret".to_string(), secret.to_string());
    data.insert(
        BOOTSTRAP_API_KEY_FILE.to_string(),
        format!("{BOOTSTRAP_API_KEY_NAME}:{secret}"),
    );
    build_secret(emqx, bootstrap_api_key_secret_name(emqx), data)
}

/// Create `secret` unless it already exists; existing Secrets are never rewritten
async fn create_if_absent(client: &Client, namespace: &str, secret: &Secret) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let name = secret.name_any();

    match api.create(&PostParams::default(), secret).await {
        Ok(_) => {
            info!("Created Secret {}/{}", namespace, name);
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!("Secret {}/{} already exists", namespace, name);
            Ok(())
        }
        Err(e) => Err(Error::KubeError(e).context(format!("create Secret {name}"))),
    }
}

/// Ensure the Erlang cookie and bootstrap API key Secrets exist
#[instrument(skip(client, emqx), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
pub async fn ensure_bootstrap_secrets(client: &Client, emqx: &Emqx) -> Result<()> {
    let namespace = namespace_of(emqx);
    let cookie = build_node_cookie_secret(emqx, &generate_secret(64));
    create_if_absent(client, &namespace, &cookie).await?;
    let api_key = build_bootstrap_api_key_secret(emqx, &generate_secret(32));
    create_if_absent(client, &namespace, &api_key).await
}

// ============================================================================
// ConfigMap
// ============================================================================

/// Fully qualified domain name of the headless Service
pub fn headless_fqdn(emqx: &Emqx) -> String {
    format!(
        "{}.{}.svc.{}",
        headless_service_name(emqx),
        namespace_of(emqx),
        emqx.spec.cluster_domain()
    )
}

/// Render the `emqx.conf` shipped to every node
pub fn render_emqx_conf(emqx: &Emqx) -> String {
    let mut conf = format!(
        r#"cluster {{
  discovery_strategy = dns
  dns {{
    record_type = srv
    name = "{fqdn}"
  }}
}}
dashboard.listeners.http.bind = {dashboard}
api_key.bootstrap_file = "{home}/etc/bootstrap/{key_file}"
"#,
        fqdn = headless_fqdn(emqx),
        dashboard = MANAGEMENT_PORT,
        home = EMQX_HOME,
        key_file = BOOTSTRAP_API_KEY_FILE,
    );

    if let Some(extra) = emqx
        .spec
        .bootstrap_config
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        conf.push('\n');
        conf.push_str(extra.trim_end());
        conf.push('\n');
    }
    conf
}

/// Hex-encoded sha256 of the rendered configuration
pub fn config_hash(conf: &str) -> String {
    hex::encode(Sha256::digest(conf.as_bytes()))
}

pub fn build_config_map(emqx: &Emqx, conf: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(CONFIG_FILE.to_string(), conf.to_string());

    ConfigMap {
        metadata: object_meta(
            emqx,
            config_map_name(emqx),
            standard_labels(emqx),
            BTreeMap::new(),
        ),
        data: Some(data),
        ..Default::default()
    }
}

/// Apply the ConfigMap and return the hash of the applied configuration
#[instrument(skip(client, emqx), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
pub async fn ensure_config_map(client: &Client, emqx: &Emqx) -> Result<String> {
    let conf = render_emqx_conf(emqx);
    let cm = build_config_map(emqx, &conf);
    apply(client, &namespace_of(emqx), &config_map_name(emqx), &cm).await?;
    Ok(config_hash(&conf))
}

// ============================================================================
// Services
// ============================================================================

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Headless Service giving core nodes stable DNS names
pub fn build_headless_service(emqx: &Emqx) -> Service {
    Service {
        metadata: object_meta(
            emqx,
            headless_service_name(emqx),
            standard_labels(emqx),
            BTreeMap::new(),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(role_selector_labels(emqx, NodeRole::Core)),
            ports: Some(vec![
                service_port("dashboard", i32::from(MANAGEMENT_PORT)),
                service_port("ekka", EKKA_PORT),
                service_port("gen-rpc", GEN_RPC_PORT),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Dashboard Service selecting every EMQX pod of the cluster
pub fn build_dashboard_service(emqx: &Emqx) -> Service {
    let template = emqx.spec.dashboard_service_template.clone().unwrap_or_default();
    let mut labels = standard_labels(emqx);
    labels.extend(template.metadata.labels.clone());

    let ports = if template.spec.ports.is_empty() {
        vec![service_port("dashboard", i32::from(MANAGEMENT_PORT))]
    } else {
        template.spec.ports.clone()
    };

    Service {
        metadata: object_meta(
            emqx,
            dashboard_service_name(emqx),
            labels,
            template.metadata.annotations.clone(),
        ),
        spec: Some(ServiceSpec {
            type_: template.spec.type_.clone(),
            selector: Some(selector_labels(emqx)),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// Ensure the headless and dashboard Services exist
#[instrument(skip(client, emqx), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
pub async fn ensure_services(client: &Client, emqx: &Emqx) -> Result<()> {
    let namespace = namespace_of(emqx);
    apply(
        client,
        &namespace,
        &headless_service_name(emqx),
        &build_headless_service(emqx),
    )
    .await?;
    apply(
        client,
        &namespace,
        &dashboard_service_name(emqx),
        &build_dashboard_service(emqx),
    )
    .await?;
    Ok(())
}

// ============================================================================
// Workloads
// ============================================================================

/// Core StatefulSet; pods get stable names under the headless Service
pub fn build_statefulset(emqx: &Emqx, config_hash: &str) -> StatefulSet {
    let template = &emqx.spec.core_template;
    let selector = role_selector_labels(emqx, NodeRole::Core);

    let volume_claim_templates = template.spec.storage.as_ref().map(|storage| {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(storage.size.clone()));
        vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                labels: Some(selector.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }]
    });

    StatefulSet {
        metadata: workload_meta(emqx, NodeRole::Core, template),
        spec: Some(StatefulSetSpec {
            replicas: Some(emqx.spec.core_replicas()),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            service_name: headless_service_name(emqx),
            pod_management_policy: Some("Parallel".to_string()),
            template: build_pod_template(emqx, NodeRole::Core, template, config_hash),
            volume_claim_templates,
            ..Default::default()
        }),
        status: None,
    }
}

/// Replicant Deployment; always present, possibly scaled to zero
pub fn build_deployment(emqx: &Emqx, config_hash: &str) -> Deployment {
    let template = emqx.spec.replicant_template.clone().unwrap_or_default();

    Deployment {
        metadata: workload_meta(emqx, NodeRole::Replicant, &template),
        spec: Some(DeploymentSpec {
            replicas: Some(emqx.spec.replicant_replicas()),
            selector: LabelSelector {
                match_labels: Some(role_selector_labels(emqx, NodeRole::Replicant)),
                ..Default::default()
            },
            template: build_pod_template(emqx, NodeRole::Replicant, &template, config_hash),
            ..Default::default()
        }),
        status: None,
    }
}

fn workload_meta(emqx: &Emqx, role: NodeRole, template: &NodeTemplate) -> ObjectMeta {
    let mut labels = standard_labels(emqx);
    labels.insert(LABEL_DB_ROLE.to_string(), role.to_string());
    labels.extend(template.metadata.labels.clone());
    object_meta(
        emqx,
        workload_name(emqx, role),
        labels,
        template.metadata.annotations.clone(),
    )
}

fn build_pod_template(
    emqx: &Emqx,
    role: NodeRole,
    template: &NodeTemplate,
    config_hash: &str,
) -> PodTemplateSpec {
    let mut labels = standard_labels(emqx);
    labels.insert(LABEL_DB_ROLE.to_string(), role.to_string());
    labels.extend(template.metadata.labels.clone());

    let mut annotations = template.metadata.annotations.clone();
    annotations.insert(ANNOTATION_CONFIG_HASH.to_string(), config_hash.to_string());

    let mut volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(config_map_name(emqx)),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "bootstrap-api-key".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(bootstrap_api_key_secret_name(emqx)),
                items: Some(vec![KeyToPath {
                    key: BOOTSTRAP_API_KEY_FILE.to_string(),
                    path: BOOTSTRAP_API_KEY_FILE.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let persistent = role == NodeRole::Core && template.spec.storage.is_some();
    if !persistent {
        volumes.push(Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }

    let image_pull_secrets = if emqx.spec.image_pull_secrets.is_empty() {
        None
    } else {
        Some(
            emqx.spec
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference {
                    name: Some(name.clone()),
                })
                .collect(),
        )
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![build_container(emqx, role, template)],
            volumes: Some(volumes),
            image_pull_secrets,
            node_selector: if template.spec.node_selector.is_empty() {
                None
            } else {
                Some(template.spec.node_selector.clone())
            },
            ..Default::default()
        }),
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn build_container(emqx: &Emqx, role: NodeRole, template: &NodeTemplate) -> Container {
    let resources = &template.spec.resources;
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(resources.requests.cpu.clone()));
    requests.insert(
        "memory".to_string(),
        Quantity(resources.requests.memory.clone()),
    );
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(resources.limits.cpu.clone()));
    limits.insert("memory".to_string(), Quantity(resources.limits.memory.clone()));

    // Core nodes are addressed by their headless FQDN, replicants by pod IP
    let host = match role {
        NodeRole::Core => format!("$(POD_NAME).{}", headless_fqdn(emqx)),
        NodeRole::Replicant => "$(POD_IP)".to_string(),
    };

    let mut env = vec![
        field_env("POD_NAME", "metadata.name"),
        field_env("POD_IP", "status.podIP"),
        value_env("EMQX_HOST", host),
        value_env("EMQX_NODE__DB_ROLE", role.as_str()),
        EnvVar {
            name: "EMQX_NODE__COOKIE".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(node_cookie_secret_name(emqx)),
                    key: "node_cookie".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    env.extend(template.spec.env.iter().cloned());

    let mut ports = vec![
        container_port("dashboard", i32::from(MANAGEMENT_PORT)),
        container_port("ekka", EKKA_PORT),
        container_port("gen-rpc", GEN_RPC_PORT),
    ];
    for extra in &template.spec.extra_ports {
        ports.push(ContainerPort {
            name: extra.name.clone(),
            container_port: extra.port,
            protocol: extra.protocol.clone(),
            ..Default::default()
        });
    }

    let status_probe = |initial_delay: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/status".to_string()),
            port: IntOrString::Int(i32::from(MANAGEMENT_PORT)),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(5),
        failure_threshold: Some(12),
        ..Default::default()
    };

    Container {
        name: "emqx".to_string(),
        image: Some(emqx.spec.image.clone()),
        image_pull_policy: emqx.spec.image_pull_policy.clone(),
        env: Some(env),
        ports: Some(ports),
        resources: Some(K8sResources {
            requests: Some(requests),
            limits: Some(limits),
            ..Default::default()
        }),
        readiness_probe: Some(status_probe(10)),
        liveness_probe: Some(status_probe(60)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: format!("{EMQX_HOME}/etc/{CONFIG_FILE}"),
                sub_path: Some(CONFIG_FILE.to_string()),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "bootstrap-api-key".to_string(),
                mount_path: format!("{EMQX_HOME}/etc/bootstrap"),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "data".to_string(),
                mount_path: format!("{EMQX_HOME}/data"),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Apply the core StatefulSet and return the server's view of it
#[instrument(skip(client, emqx, config_hash), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
pub async fn ensure_statefulset(
    client: &Client,
    emqx: &Emqx,
    config_hash: &str,
) -> Result<StatefulSet> {
    let sts = build_statefulset(emqx, config_hash);
    apply(
        client,
        &namespace_of(emqx),
        &workload_name(emqx, NodeRole::Core),
        &sts,
    )
    .await
}

/// Apply the replicant Deployment and return the server's view of it
#[instrument(skip(client, emqx, config_hash), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
pub async fn ensure_deployment(
    client: &Client,
    emqx: &Emqx,
    config_hash: &str,
) -> Result<Deployment> {
    let deployment = build_deployment(emqx, config_hash);
    apply(
        client,
        &namespace_of(emqx),
        &workload_name(emqx, NodeRole::Replicant),
        &deployment,
    )
    .await
}
