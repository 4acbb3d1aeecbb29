//! Port forwarding to EMQX pods
//!
//! Pods are not assumed to be reachable from wherever the operator runs, so
//! every call to the EMQX management API travels over a kube-native
//! port-forward. A [`PortForward`] binds an ephemeral loopback port and
//! relays each accepted connection to the pod. Dropping it stops the relay.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Errors that can occur during port forwarding
#[derive(Error, Debug)]
pub enum PortForwardError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Port {0} stream was not returned by the port-forward")]
    MissingStream(u16),

    #[error("Port forward join error: {0}")]
    Join(String),
}

/// RAII handle for a running port-forward
pub struct PortForward {
    pod: String,
    local_port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _handle: JoinHandle<()>,
}

impl PortForward {
    /// Forward an ephemeral loopback port to `remote_port` on `pod`
    pub async fn start(
        client: Client,
        namespace: &str,
        pod: &str,
        remote_port: u16,
    ) -> Result<Self, PortForwardError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_port = listener.local_addr()?.port();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let pod_name = pod.to_string();
        let handle = tokio::spawn(async move {
            relay(pods, pod_name, listener, remote_port, shutdown_rx).await;
        });

        debug!(
            namespace = namespace,
            pod = pod,
            local_port = local_port,
            remote_port = remote_port,
            "Port-forward established"
        );

        Ok(Self {
            pod: pod.to_string(),
            local_port,
            shutdown_tx: Some(shutdown_tx),
            _handle: handle,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Base URL for HTTP clients talking through this forward
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn relay(
    pods: Api<Pod>,
    pod: String,
    listener: tokio::net::TcpListener,
    remote_port: u16,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                trace!(pod = %pod, "Port forward shutdown requested");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let pods = pods.clone();
                    let pod = pod.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward_connection(pods, &pod, remote_port, stream).await {
                            warn!(pod = %pod, error = %e, "Port forward connection error");
                        }
                    });
                }
                Err(e) => warn!(pod = %pod, error = %e, "Port forward accept error"),
            }
        }
    }
}

#[allow(clippy::indexing_slicing)]
async fn forward_connection(
    pods: Api<Pod>,
    pod: &str,
    remote_port: u16,
    mut local: TcpStream,
) -> Result<(), PortForwardError> {
    let mut forwarder = pods.portforward(pod, &[remote_port]).await?;
    let upstream = forwarder
        .take_stream(remote_port)
        .ok_or(PortForwardError::MissingStream(remote_port))?;

    let (mut local_read, mut local_write) = local.split();
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let to_pod = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upstream_write.write_all(&buf[..n]).await?;
        }
        upstream_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    let from_pod = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            local_write.write_all(&buf[..n]).await?;
        }
        local_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    let _ = tokio::try_join!(to_pod, from_pod);
    drop(upstream_read);
    drop(upstream_write);

    // The forwarder can hang if the pod went away mid-request
    match tokio::time::timeout(Duration::from_secs(5), forwarder.join()).await {
        Ok(result) => result.map_err(|e| PortForwardError::Join(e.to_string())),
        Err(_) => Err(PortForwardError::Join("timed out".to_string())),
    }
}
