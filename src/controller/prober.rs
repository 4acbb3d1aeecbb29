//! Node prober
//!
//! Opens an authenticated management API session against one core pod,
//! tunnelled through a port-forward. Listener discovery and node probing
//! both sample that single pod's view of the cluster.

use std::cmp::Ordering;

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

use crate::crd::{Emqx, EmqxNode, NodeRole};
use crate::error::{Error, Result, ResultExt};

use super::emqx_api::{
    discover_listeners, AdminApi, ApiCredentials, EmqxApiClient, ListenerDiscovery,
    MANAGEMENT_PORT,
};
use super::port_forward::PortForward;
use super::resources::{
    bootstrap_api_key_secret_name, label_selector, namespace_of, role_selector_labels,
};

/// A live management API session; the port-forward closes on drop
pub struct NodeProber {
    api: EmqxApiClient,
    forward: PortForward,
}

impl NodeProber {
    /// Connect to the first reachable core pod
    ///
    /// Returns `Ok(None)` when no core pod is running yet.
    #[instrument(skip(client, emqx), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
    pub async fn connect(client: &Client, emqx: &Emqx) -> Result<Option<Self>> {
        let namespace = namespace_of(emqx);
        let pods = list_role_pods(client, emqx, NodeRole::Core).await?;
        let Some(pod) = pick_target_pod(&pods) else {
            debug!("No running core pod to probe");
            return Ok(None);
        };
        let pod_name = pod.name_any();

        let credentials = read_credentials(client, emqx).await?;
        let forward = PortForward::start(client.clone(), &namespace, &pod_name, MANAGEMENT_PORT)
            .await
            .context(format!("port-forward to {pod_name}"))?;
        let api = EmqxApiClient::new(forward.local_url(), credentials)?;

        Ok(Some(Self { api, forward }))
    }

    pub fn pod(&self) -> &str {
        self.forward.pod()
    }

    pub fn api(&self) -> &dyn AdminApi {
        &self.api
    }

    /// Cluster members, sorted by node name
    pub async fn nodes(&self) -> Result<Vec<EmqxNode>> {
        let mut nodes = self
            .api
            .nodes()
            .await
            .context(format!("list nodes via {}", self.pod()))?;
        nodes.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(nodes)
    }

    pub async fn listeners(&self) -> ListenerDiscovery {
        let mut discovery = discover_listeners(&self.api).await;
        let pod = self.pod().to_string();
        discovery.errors = discovery
            .errors
            .into_iter()
            .map(|e| e.context(format!("discover listeners via {pod}")))
            .collect();
        discovery
    }
}

/// List the pods of one node role
pub async fn list_role_pods(client: &Client, emqx: &Emqx, role: NodeRole) -> Result<Vec<Pod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace_of(emqx));
    let selector = label_selector(&role_selector_labels(emqx, role));
    let pods = api
        .list(&ListParams::default().labels(&selector))
        .await
        .context(format!("list {role} pods"))?;
    Ok(pods.items)
}

pub fn is_pod_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false)
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// First Running pod, ready pods first, then by name
pub fn pick_target_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter()
        .filter(|p| is_pod_running(p) && p.metadata.deletion_timestamp.is_none())
        .min_by(|a, b| match (is_pod_ready(a), is_pod_ready(b)) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name_any().cmp(&b.name_any()),
        })
}

async fn read_credentials(client: &Client, emqx: &Emqx) -> Result<ApiCredentials> {
    let name = bootstrap_api_key_secret_name(emqx);
    let api: Api<Secret> = Api::namespaced(client.clone(), &namespace_of(emqx));
    let secret = api
        .get(&name)
        .await
        .context(format!("get Secret {name}"))?;
    credentials_from_secret(&secret)
}

/// Extract the bootstrap API key from its Secret
pub fn credentials_from_secret(secret: &Secret) -> Result<ApiCredentials> {
    let field = |key: &str| -> Result<String> {
        let from_data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned());
        let from_string_data = || secret.string_data.as_ref().and_then(|d| d.get(key).cloned());

        from_data.or_else(from_string_data).ok_or_else(|| {
            Error::NotReady(format!(
                "Secret {} has no {key:?} entry",
                secret.name_any()
            ))
        })
    };

    Ok(ApiCredentials {
        key: field("key")?,
        secret: field("secret")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str, phase: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pick_prefers_ready_then_name() {
        let pods = vec![
            pod("emqx-core-2", "Running", true),
            pod("emqx-core-0", "Running", false),
            pod("emqx-core-1", "Running", true),
        ];
        assert_eq!(pick_target_pod(&pods).unwrap().name_any(), "emqx-core-1");
    }

    #[test]
    fn test_pick_skips_pending_and_terminating() {
        let mut terminating = pod("emqx-core-0", "Running", true);
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let pods = vec![terminating, pod("emqx-core-1", "Pending", false)];
        assert!(pick_target_pod(&pods).is_none());

        let pods = vec![pod("emqx-core-1", "Pending", false), pod("emqx-core-2", "Running", false)];
        assert_eq!(pick_target_pod(&pods).unwrap().name_any(), "emqx-core-2");
    }

    #[test]
    fn test_credentials_from_secret_data() {
        let mut data = BTreeMap::new();
        data.insert("key".to_string(), ByteString(b"emqx-operator-controller".to_vec()));
        data.insert("secret".to_string(), ByteString(b"abc".to_vec()));
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        let credentials = credentials_from_secret(&secret).unwrap();
        assert_eq!(credentials.key, "emqx-operator-controller");
        assert_eq!(credentials.secret, "abc");
    }

    #[test]
    fn test_credentials_missing_entry_is_transient() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("emqx-bootstrap-api-key".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = credentials_from_secret(&secret).unwrap_err();
        assert!(err.is_retriable());
    }
}
