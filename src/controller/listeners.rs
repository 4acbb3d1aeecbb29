//! Listener and endpoint synchronization
//!
//! The listener Service has no selector. Its backends are written into an
//! EndpointSlice of the same name, populated with the pods of whichever role
//! currently serves client traffic: replicants once any is running, core
//! nodes otherwise.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

use crate::crd::{running_nodes, Emqx, EmqxNode, NodeRole};
use crate::error::{Error, Result};

use super::emqx_api::Listener;
use super::prober::{is_pod_ready, is_pod_running, list_role_pods};
use super::resources::{
    apply, listeners_service_name, namespace_of, owner_reference, standard_labels, FIELD_MANAGER,
};

pub const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";
pub const LABEL_ENDPOINTSLICE_MANAGED_BY: &str = "endpointslice.kubernetes.io/managed-by";

pub const ADDRESS_TYPE_IPV4: &str = "IPv4";
pub const ADDRESS_TYPE_IPV6: &str = "IPv6";

/// Port number of a listener bind address
///
/// Accepts `0.0.0.0:1883`, `[::]:8883`, `:1883` and a bare `1883`.
pub fn bind_port(bind: &str) -> Option<i32> {
    let digits = bind.rsplit(':').next()?;
    digits
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .map(i32::from)
}

/// Service port for each enabled listener with a parsable bind address
pub fn listeners_to_ports(listeners: &[Listener]) -> Vec<ServicePort> {
    listeners
        .iter()
        .filter(|l| l.enable)
        .filter_map(|l| {
            let port = bind_port(&l.bind)?;
            let protocol = match l.type_.as_str() {
                "quic" | "udp" | "dtls" => "UDP",
                _ => "TCP",
            };
            Some(ServicePort {
                name: Some(l.id.replace([':', '_'], "-")),
                port,
                protocol: Some(protocol.to_string()),
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            })
        })
        .collect()
}

/// Name-keyed union; declared ports win on collision
///
/// The result is the declared ports in their order, followed by discovered
/// ports whose name is not declared.
pub fn merge_service_ports(declared: &[ServicePort], discovered: &[ServicePort]) -> Vec<ServicePort> {
    let mut merged = declared.to_vec();
    for port in discovered {
        if !merged.iter().any(|p| p.name == port.name) {
            merged.push(port.clone());
        }
    }
    merged
}

/// EndpointSlice address type for a textual address
///
/// Anything that is not an IP literal is a bug in the caller.
pub fn address_type(address: &str) -> Result<&'static str> {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok(ADDRESS_TYPE_IPV4),
        Ok(IpAddr::V6(_)) => Ok(ADDRESS_TYPE_IPV6),
        Err(_) => Err(Error::InvalidAddress(address.to_string())),
    }
}

/// Role whose pods receive client traffic
pub fn target_role(declared_replicants: i32, nodes: &[EmqxNode]) -> NodeRole {
    if declared_replicants > 0 && running_nodes(nodes, NodeRole::Replicant) > 0 {
        NodeRole::Replicant
    } else {
        NodeRole::Core
    }
}

fn pod_matches_node(pod: &Pod, pod_ip: &str, node: &EmqxNode, role: NodeRole) -> bool {
    if node.role != role || !node.is_running() {
        return false;
    }
    let host = node.host();
    let pod_name = pod.name_any();
    host == pod_ip || host == pod_name || host.starts_with(&format!("{pod_name}."))
}

/// A pod selected as a routing target
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointTarget {
    pub address: String,
    pub ready: bool,
    pub terminating: bool,
    pub target_ref: ObjectReference,
}

/// Running pods of `role` that the management API also reports as running
pub fn select_endpoints(pods: &[Pod], nodes: &[EmqxNode], role: NodeRole) -> Vec<EndpointTarget> {
    pods.iter()
        .filter(|pod| is_pod_running(pod))
        .filter_map(|pod| {
            let ip = pod.status.as_ref()?.pod_ip.clone()?;
            if !nodes.iter().any(|n| pod_matches_node(pod, &ip, n, role)) {
                debug!("Pod {} is running but not an active {} node", pod.name_any(), role);
                return None;
            }
            Some(EndpointTarget {
                address: ip,
                ready: is_pod_ready(pod),
                terminating: pod.metadata.deletion_timestamp.is_some(),
                target_ref: ObjectReference {
                    api_version: Some("v1".to_string()),
                    kind: Some("Pod".to_string()),
                    name: pod.metadata.name.clone(),
                    namespace: pod.metadata.namespace.clone(),
                    uid: pod.metadata.uid.clone(),
                    ..Default::default()
                },
            })
        })
        .collect()
}

fn routing_labels(emqx: &Emqx, service_name: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(emqx);
    if let Some(template) = &emqx.spec.listeners_service_template {
        labels.extend(template.metadata.labels.clone());
    }
    labels.insert(LABEL_SERVICE_NAME.to_string(), service_name.to_string());
    labels
}

/// Listener Service without a selector
pub fn build_listeners_service(emqx: &Emqx, ports: &[ServicePort]) -> Service {
    let name = listeners_service_name(emqx);
    let template = emqx.spec.listeners_service_template.clone().unwrap_or_default();
    let mut labels = standard_labels(emqx);
    labels.extend(template.metadata.labels.clone());

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: emqx.namespace(),
            labels: Some(labels),
            annotations: if template.metadata.annotations.is_empty() {
                None
            } else {
                Some(template.metadata.annotations.clone())
            },
            owner_references: Some(vec![owner_reference(emqx)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: template.spec.type_.clone(),
            ports: Some(ports.to_vec()),
            selector: None,
            ..Default::default()
        }),
        status: None,
    }
}

/// EndpointSlice paired with the listener Service
///
/// The address type follows the first target; targets of the other family
/// are dropped. No targets yields an empty IPv4 slice.
pub fn build_endpoint_slice(
    emqx: &Emqx,
    ports: &[ServicePort],
    targets: &[EndpointTarget],
) -> Result<EndpointSlice> {
    let name = listeners_service_name(emqx);
    let mut labels = routing_labels(emqx, &name);
    labels.insert(
        LABEL_ENDPOINTSLICE_MANAGED_BY.to_string(),
        FIELD_MANAGER.to_string(),
    );

    let family = match targets.first() {
        Some(first) => address_type(&first.address)?,
        None => ADDRESS_TYPE_IPV4,
    };

    let mut endpoints = Vec::with_capacity(targets.len());
    for target in targets {
        if address_type(&target.address)? != family {
            debug!("Skipping non-{} address {}", family, target.address);
            continue;
        }
        endpoints.push(Endpoint {
            addresses: vec![target.address.clone()],
            conditions: Some(EndpointConditions {
                ready: Some(target.ready),
                serving: Some(target.ready),
                terminating: Some(target.terminating),
            }),
            target_ref: Some(target.target_ref.clone()),
            ..Default::default()
        });
    }

    let endpoint_ports = ports
        .iter()
        .map(|p| EndpointPort {
            name: p.name.clone(),
            // Endpoints carry the pod-side port
            port: match &p.target_port {
                Some(IntOrString::Int(target)) => Some(*target),
                _ => Some(p.port),
            },
            protocol: p.protocol.clone(),
            app_protocol: p.app_protocol.clone(),
        })
        .collect();

    Ok(EndpointSlice {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: emqx.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(emqx)]),
            ..Default::default()
        },
        address_type: family.to_string(),
        endpoints,
        ports: Some(endpoint_ports),
    })
}

/// Outcome of one listener sync, for logging and tests
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerSync {
    /// No ports yet, nothing written
    NoPorts,
    Applied {
        role: NodeRole,
        ports: usize,
        endpoints: usize,
    },
}

/// Write the listener Service and its EndpointSlice
///
/// `discovered` is whatever the management API returned this pass, possibly
/// nothing when it was unreachable.
#[instrument(skip(client, emqx, discovered), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
pub async fn ensure_listeners(
    client: &Client,
    emqx: &Emqx,
    discovered: &[Listener],
) -> Result<ListenerSync> {
    let declared = emqx
        .spec
        .listeners_service_template
        .as_ref()
        .map(|t| t.spec.ports.clone())
        .unwrap_or_default();
    let ports = merge_service_ports(&declared, &listeners_to_ports(discovered));
    if ports.is_empty() {
        debug!("No listener ports known yet, skipping listener Service");
        return Ok(ListenerSync::NoPorts);
    }

    let nodes = emqx.observed_nodes();
    let role = target_role(emqx.spec.replicant_replicas(), nodes);
    let pods = list_role_pods(client, emqx, role).await?;
    let targets = select_endpoints(&pods, nodes, role);

    let namespace = namespace_of(emqx);
    let name = listeners_service_name(emqx);
    let service = build_listeners_service(emqx, &ports);
    let slice = build_endpoint_slice(emqx, &ports, &targets)?;
    apply(client, &namespace, &name, &service).await?;
    apply(client, &namespace, &name, &slice).await?;

    info!(
        "Listener Service {} routes {} ports to {} {} pods",
        name,
        ports.len(),
        slice.endpoints.len(),
        role
    );
    Ok(ListenerSync::Applied {
        role,
        ports: ports.len(),
        endpoints: slice.endpoints.len(),
    })
}
