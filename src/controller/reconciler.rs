//! Main reconciler for EMQX resources
//!
//! Implements the controller pattern using kube-rs runtime. The actual work
//! is done by the sub-reconciler chain; this module owns the watch setup,
//! the requeue policy and event emission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Emqx, EmqxState};
use crate::error::{Error, Result};

use super::sub_reconciler::{default_chain, SubReconciler, SubResult, NOT_READY_REQUEUE};

/// Requeue delay after a transient error
pub const COMMON_ERROR_REQUEUE: Duration = Duration::from_secs(1);

/// Periodic resync once the cluster is running
pub const RUNNING_REQUEUE: Duration = Duration::from_secs(30);

const STANDBY_REQUEUE: Duration = Duration::from_secs(5);

#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
const CONTROLLER_NAME: &str = "emqx";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    /// Restrict watches to one namespace; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Set by the leader election loop; only the leader writes
    pub is_leader: Arc<AtomicBool>,
}

impl ControllerState {
    /// State for a single operator instance that is always the leader
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        Self {
            client,
            watch_namespace,
            is_leader: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    fn scoped_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// EMQX API handle respecting the watch namespace
    pub fn emqx_api(&self) -> Api<Emqx> {
        self.scoped_api()
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let clusters = state.emqx_api();

    info!(
        "Starting EMQX controller (namespace: {})",
        state.watch_namespace.as_deref().unwrap_or("<all>")
    );

    // Verify CRD exists
    match clusters.list(&Default::default()).await {
        Ok(_) => info!("EMQX CRD is available"),
        Err(e) => {
            error!("EMQX CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("EMQX CRD not installed".to_string()));
        }
    }

    Controller::new(clusters, Config::default())
        // Watch owned resources for changes
        .owns::<StatefulSet>(state.scoped_api(), Config::default())
        .owns::<Deployment>(state.scoped_api(), Config::default())
        .owns::<Service>(state.scoped_api(), Config::default())
        .owns::<EndpointSlice>(state.scoped_api(), Config::default())
        .owns::<ConfigMap>(state.scoped_api(), Config::default())
        .owns::<Secret>(state.scoped_api(), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Helper to emit a Kubernetes Event
pub(crate) async fn emit_event(
    client: &Client,
    emqx: &Emqx,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = emqx.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", emqx.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: emqx.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        reporting_component: Some("emqx-operator".to_string()),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// The reconciliation function
///
/// This function is called whenever:
/// - An EMQX resource is created or updated
/// - An owned resource (workload, Service, EndpointSlice, ConfigMap, Secret) changes
/// - The requeue timer expires
///
/// Owned objects carry owner references, so deletion is left to the
/// Kubernetes garbage collector.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Emqx>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader() {
        debug!("Not the leader, skipping");
        return Ok(Action::requeue(STANDBY_REQUEUE));
    }

    if obj.metadata.deletion_timestamp.is_some() {
        debug!("EMQX is being deleted, nothing to do");
        #[cfg(feature = "metrics")]
        super::metrics::forget_cluster(&super::resources::namespace_of(&obj), &obj.name_any());
        return Ok(Action::await_change());
    }

    if let Err(errors) = obj.spec.validate() {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        warn!("Validation failed: {}", message);
        if let Err(e) = emit_event(&ctx.client, &obj, "Warning", "InvalidSpec", &message).await {
            warn!("Failed to emit event: {}", e);
        }
        return Err(Error::ValidationError(message));
    }

    let started = Instant::now();
    let mut emqx = (*obj).clone();
    let result = run_chain(&ctx, &mut emqx, &default_chain()).await;

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(
        CONTROLLER_NAME,
        started.elapsed().as_secs_f64(),
    );
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    result
}

/// Run the steps in order until one asks to stop
///
/// A requeue request ends the pass with that delay. Transient errors end it
/// with [`COMMON_ERROR_REQUEUE`]; other errors are returned to the runtime.
pub async fn run_chain(
    ctx: &ControllerState,
    emqx: &mut Emqx,
    chain: &[Box<dyn SubReconciler>],
) -> Result<Action> {
    for step in chain {
        match step.reconcile(ctx, emqx).await {
            SubResult::Continue => {}
            SubResult::RequeueAfter(delay) => {
                debug!("Step {} requested requeue after {:?}", step.name(), delay);
                return Ok(Action::requeue(delay));
            }
            SubResult::Failed(e) if e.is_retriable() => {
                info!("Step {} hit a transient error: {}", step.name(), e);
                #[cfg(feature = "metrics")]
                super::metrics::inc_reconcile_error(CONTROLLER_NAME, e.kind());
                return Ok(Action::requeue(COMMON_ERROR_REQUEUE));
            }
            SubResult::Failed(e) => {
                return Err(e.context(format!("step {}", step.name())));
            }
        }
    }

    Ok(match emqx.state() {
        EmqxState::Running => Action::requeue(RUNNING_REQUEUE),
        _ => Action::requeue(NOT_READY_REQUEUE),
    })
}

/// Error policy for the controller
fn error_policy(emqx: Arc<Emqx>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", emqx.name_any(), error);

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
