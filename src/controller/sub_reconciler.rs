//! Sub-reconciler chain
//!
//! Each step is idempotent and may run against objects it did not create.
//! Steps return a [`SubResult`]; the chain stops at the first requeue or
//! error. Status is evaluated both first and last so that a failure seen
//! early is reflected even when later steps are skipped. The leading
//! evaluation never blocks the structural steps: an unreachable management
//! API only means the node list is unknown for that pass.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::crd::{Emqx, EmqxNode, EmqxState, EmqxStatus, NodeRole};
use crate::error::{Error, Result, ResultExt};

use super::emqx_api::ListenerDiscovery;
use super::listeners::{ensure_listeners, ListenerSync};
use super::prober::NodeProber;
use super::reconciler::{emit_event, ControllerState};
use super::resources::{
    config_hash, ensure_bootstrap_secrets, ensure_config_map, ensure_deployment,
    ensure_services, ensure_statefulset, namespace_of, render_emqx_conf, workload_name,
    FIELD_MANAGER,
};
use super::status::{self, Observation, WorkloadObservation};

/// Delay before retrying when a precondition is not met yet
pub const NOT_READY_REQUEUE: Duration = Duration::from_millis(500);

/// Outcome of one step
#[derive(Debug)]
pub enum SubResult {
    /// Success, run the next step
    Continue,
    /// Preconditions not met; stop and come back later
    RequeueAfter(Duration),
    Failed(Error),
}

impl From<Result<()>> for SubResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => SubResult::Continue,
            Err(e) => SubResult::Failed(e),
        }
    }
}

/// One step of the chain
#[async_trait]
pub trait SubReconciler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, ctx: &ControllerState, emqx: &mut Emqx) -> SubResult;
}

/// The steps in dependency order
pub fn default_chain() -> Vec<Box<dyn SubReconciler>> {
    vec![
        Box::new(UpdateStatus::leading()),
        Box::new(BootstrapSecrets),
        Box::new(Configs),
        Box::new(Services),
        Box::new(CoreWorkload),
        Box::new(ReplicantWorkload),
        Box::new(Listeners),
        Box::new(UpdateStatus::trailing()),
    ]
}

// ============================================================================
// Status
// ============================================================================

pub struct UpdateStatus {
    /// Keep the last known nodes when the management API cannot be queried
    keep_nodes_on_probe_failure: bool,
}

impl UpdateStatus {
    /// Evaluation ahead of the structural steps; probe failures are tolerated
    pub fn leading() -> Self {
        Self {
            keep_nodes_on_probe_failure: true,
        }
    }

    /// Evaluation after the structural steps; probe failures requeue
    pub fn trailing() -> Self {
        Self {
            keep_nodes_on_probe_failure: false,
        }
    }
}

#[async_trait]
impl SubReconciler for UpdateStatus {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn reconcile(&self, ctx: &ControllerState, emqx: &mut Emqx) -> SubResult {
        update_status(&ctx.client, emqx, self.keep_nodes_on_probe_failure)
            .await
            .into()
    }
}

/// Gather workload counters and the live node list
async fn observe(
    client: &Client,
    emqx: &Emqx,
    keep_nodes_on_probe_failure: bool,
) -> Result<Observation> {
    let namespace = namespace_of(emqx);

    let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
    let core_name = workload_name(emqx, NodeRole::Core);
    let core = sts_api
        .get_opt(&core_name)
        .await
        .context(format!("get StatefulSet {core_name}"))?
        .map(|sts| WorkloadObservation::from_statefulset(&sts))
        .unwrap_or_default();

    let deploy_api: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let replicant_name = workload_name(emqx, NodeRole::Replicant);
    let replicant = deploy_api
        .get_opt(&replicant_name)
        .await
        .context(format!("get Deployment {replicant_name}"))?
        .map(|d| WorkloadObservation::from_deployment(&d))
        .unwrap_or_default();

    let nodes = match probe_nodes(client, emqx).await {
        Ok(nodes) => nodes,
        Err(e) if keep_nodes_on_probe_failure => {
            warn!("Node probe failed, keeping last known nodes: {}", e);
            if let Err(event_err) =
                emit_event(client, emqx, "Warning", "NodeProbeFailed", &e.to_string()).await
            {
                warn!("Failed to emit event: {}", event_err);
            }
            emqx.observed_nodes().to_vec()
        }
        Err(e) => return Err(e),
    };

    Ok(Observation {
        core,
        replicant,
        nodes,
    })
}

/// Nodes reported by a running core pod; none when no core pod runs yet
async fn probe_nodes(client: &Client, emqx: &Emqx) -> Result<Vec<EmqxNode>> {
    match NodeProber::connect(client, emqx).await? {
        Some(prober) => prober.nodes().await,
        None => Ok(Vec::new()),
    }
}

async fn patch_status(client: &Client, emqx: &Emqx, status: &EmqxStatus) -> Result<()> {
    let api: Api<Emqx> = Api::namespaced(client.clone(), &namespace_of(emqx));
    let patch = serde_json::json!({
        "apiVersion": <Emqx as kube::Resource>::api_version(&()),
        "kind": <Emqx as kube::Resource>::kind(&()),
        "status": status,
    });
    api.patch_status(
        &emqx.name_any(),
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&patch),
    )
    .await
    .context("patch EMQX status")?;
    Ok(())
}

#[instrument(skip(client, emqx), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
async fn update_status(
    client: &Client,
    emqx: &mut Emqx,
    keep_nodes_on_probe_failure: bool,
) -> Result<()> {
    let observed = observe(client, emqx, keep_nodes_on_probe_failure).await?;
    let previous = emqx.status.clone();
    let next = status::evaluate(
        &emqx.spec,
        previous.as_ref(),
        &observed,
        emqx.metadata.generation,
    );

    if previous.as_ref() != Some(&next) {
        patch_status(client, emqx, &next).await?;

        let before = previous.map(|s| s.state).unwrap_or_default();
        if before != next.state {
            info!("EMQX state {} -> {}", before, next.state);
            let message = format!("State changed from {} to {}", before, next.state);
            if let Err(e) = emit_event(client, emqx, "Normal", "StateChanged", &message).await {
                warn!("Failed to emit event: {}", e);
            }
        }
    } else {
        debug!("Status unchanged ({})", next.state);
    }

    #[cfg(feature = "metrics")]
    {
        let namespace = namespace_of(emqx);
        let name = emqx.name_any();
        super::metrics::set_cluster_state(&namespace, &name, next.state);
        super::metrics::set_ready_replicas(
            &namespace,
            &name,
            NodeRole::Core,
            next.core_node_ready_replicas,
        );
        super::metrics::set_ready_replicas(
            &namespace,
            &name,
            NodeRole::Replicant,
            next.replicant_node_ready_replicas,
        );
    }

    emqx.status = Some(next);
    Ok(())
}

// ============================================================================
// Identity and configuration
// ============================================================================

pub struct BootstrapSecrets;

#[async_trait]
impl SubReconciler for BootstrapSecrets {
    fn name(&self) -> &'static str {
        "bootstrap-secrets"
    }

    async fn reconcile(&self, ctx: &ControllerState, emqx: &mut Emqx) -> SubResult {
        ensure_bootstrap_secrets(&ctx.client, emqx).await.into()
    }
}

pub struct Configs;

#[async_trait]
impl SubReconciler for Configs {
    fn name(&self) -> &'static str {
        "configs"
    }

    async fn reconcile(&self, ctx: &ControllerState, emqx: &mut Emqx) -> SubResult {
        ensure_config_map(&ctx.client, emqx).await.map(|_| ()).into()
    }
}

pub struct Services;

#[async_trait]
impl SubReconciler for Services {
    fn name(&self) -> &'static str {
        "services"
    }

    async fn reconcile(&self, ctx: &ControllerState, emqx: &mut Emqx) -> SubResult {
        ensure_services(&ctx.client, emqx).await.into()
    }
}

// ============================================================================
// Workloads
// ============================================================================

pub struct CoreWorkload;

#[async_trait]
impl SubReconciler for CoreWorkload {
    fn name(&self) -> &'static str {
        "core"
    }

    async fn reconcile(&self, ctx: &ControllerState, emqx: &mut Emqx) -> SubResult {
        let hash = config_hash(&render_emqx_conf(emqx));
        ensure_statefulset(&ctx.client, emqx, &hash)
            .await
            .map(|_| ())
            .into()
    }
}

pub struct ReplicantWorkload;

#[async_trait]
impl SubReconciler for ReplicantWorkload {
    fn name(&self) -> &'static str {
        "replicant"
    }

    /// Replicants join through core nodes, so they roll out only after the
    /// core nodes are ready on the current image. The gate skips rather than
    /// requeues so the trailing status evaluation still runs this pass.
    async fn reconcile(&self, ctx: &ControllerState, emqx: &mut Emqx) -> SubResult {
        if emqx.state() < EmqxState::CoreReady {
            debug!("Core nodes not ready ({}), holding replicants", emqx.state());
            return SubResult::Continue;
        }
        let hash = config_hash(&render_emqx_conf(emqx));
        ensure_deployment(&ctx.client, emqx, &hash)
            .await
            .map(|_| ())
            .into()
    }
}

// ============================================================================
// Listener routing
// ============================================================================

pub struct Listeners;

#[async_trait]
impl SubReconciler for Listeners {
    fn name(&self) -> &'static str {
        "listeners"
    }

    /// Skipped until core nodes are ready, like the replicant step.
    async fn reconcile(&self, ctx: &ControllerState, emqx: &mut Emqx) -> SubResult {
        if emqx.state() < EmqxState::CoreReady {
            debug!("Core nodes not ready ({}), routing unchanged", emqx.state());
            return SubResult::Continue;
        }
        sync_listeners(&ctx.client, emqx).await.map(|_| ()).into()
    }
}

#[instrument(skip(client, emqx), fields(name = %emqx.name_any(), namespace = emqx.namespace()))]
pub(crate) async fn sync_listeners(client: &Client, emqx: &Emqx) -> Result<ListenerSync> {
    // The listener set is best effort: an unreachable API must not block routing
    let discovery = discover(client, emqx).await;
    if !discovery.is_complete() {
        let message = discovery.error_summary();
        warn!(
            "Listener discovery incomplete ({} listeners found): {}",
            discovery.listeners.len(),
            message
        );
        if let Err(event_err) =
            emit_event(client, emqx, "Warning", "ListenerDiscoveryFailed", &message).await
        {
            warn!("Failed to emit event: {}", event_err);
        }
    }

    let sync = ensure_listeners(client, emqx, &discovery.listeners).await?;
    match &sync {
        ListenerSync::NoPorts => debug!("No listener ports yet"),
        ListenerSync::Applied {
            role,
            ports,
            endpoints,
        } => debug!("Routed {} ports to {} {} endpoints", ports, endpoints, role),
    }
    Ok(sync)
}

async fn discover(client: &Client, emqx: &Emqx) -> ListenerDiscovery {
    match NodeProber::connect(client, emqx).await {
        Ok(Some(prober)) => prober.listeners().await,
        Ok(None) => ListenerDiscovery::default(),
        Err(e) => ListenerDiscovery::failed(e),
    }
}
