//! Status state machine
//!
//! A pure function from (declared spec, observed workloads, observed nodes)
//! to the next [`EmqxState`]. The machine is level-triggered: every pass
//! re-validates the current state and regresses when readiness is lost.
//!
//! ```text
//! Init -> Creating -> CoreUpdating -> CoreReady -> Running
//!                          ^              |           |
//!                          +--------------+-----------+   (core not ready / image changed)
//!                                         ^           |
//!                                         +-----------+   (replicants not ready)
//! ```

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};

use crate::crd::{running_nodes, EmqxNode, EmqxSpec, EmqxState, EmqxStatus, NodeRole};

use super::conditions;

/// Rollout counters of one workload (StatefulSet or Deployment)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadObservation {
    pub generation: Option<i64>,
    pub observed_generation: Option<i64>,
    pub updated_replicas: i32,
    pub ready_replicas: i32,
}

impl WorkloadObservation {
    pub fn from_statefulset(sts: &StatefulSet) -> Self {
        let status = sts.status.as_ref();
        Self {
            generation: sts.metadata.generation,
            observed_generation: status.and_then(|s| s.observed_generation),
            updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
            ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        }
    }

    pub fn from_deployment(deployment: &Deployment) -> Self {
        let status = deployment.status.as_ref();
        Self {
            generation: deployment.metadata.generation,
            observed_generation: status.and_then(|s| s.observed_generation),
            updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
            ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        }
    }

    /// Replicas that are both on the current revision and ready
    pub fn effective_ready(&self) -> i32 {
        self.updated_replicas.min(self.ready_replicas)
    }

    /// The workload controller has seen the latest spec
    pub fn generation_observed(&self) -> bool {
        match (self.generation, self.observed_generation) {
            (Some(generation), Some(observed)) => observed >= generation,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    /// Rolled out to exactly `declared` updated and ready replicas
    pub fn rolled_out(&self, declared: i32) -> bool {
        self.generation_observed() && self.effective_ready() == declared
    }
}

/// Everything the state machine looks at on one pass
#[derive(Clone, Debug, Default)]
pub struct Observation {
    pub core: WorkloadObservation,
    pub replicant: WorkloadObservation,
    pub nodes: Vec<EmqxNode>,
}

impl Observation {
    fn core_ready(&self, spec: &EmqxSpec) -> bool {
        let declared = spec.core_replicas();
        self.core.rolled_out(declared) && running_nodes(&self.nodes, NodeRole::Core) == declared
    }

    fn replicant_ready(&self, spec: &EmqxSpec) -> bool {
        let declared = spec.replicant_replicas();
        self.replicant.rolled_out(declared)
            && running_nodes(&self.nodes, NodeRole::Replicant) == declared
    }
}

/// Compute the next lifecycle state
///
/// At most one forward step is taken per pass. Losing readiness regresses
/// immediately, core first: a cluster whose core nodes are not ready goes
/// to `CoreUpdating` even if it was `Running`.
pub fn next_state(
    spec: &EmqxSpec,
    current: EmqxState,
    current_image: Option<&str>,
    observed: &Observation,
) -> EmqxState {
    match current {
        EmqxState::Init => EmqxState::Creating,
        EmqxState::Creating => EmqxState::CoreUpdating,
        EmqxState::CoreUpdating => {
            if observed.core_ready(spec) {
                EmqxState::CoreReady
            } else {
                EmqxState::CoreUpdating
            }
        }
        EmqxState::CoreReady | EmqxState::Running => {
            if current_image != Some(spec.image.as_str()) || !observed.core_ready(spec) {
                EmqxState::CoreUpdating
            } else if !observed.replicant_ready(spec) {
                EmqxState::CoreReady
            } else {
                EmqxState::Running
            }
        }
    }
}

fn transition_reason(state: EmqxState) -> &'static str {
    match state {
        EmqxState::Init => "Init",
        EmqxState::Creating => "ClusterCreating",
        EmqxState::CoreUpdating => "CoreNodesUpdating",
        EmqxState::CoreReady => "CoreNodesReady",
        EmqxState::Running => "ClusterRunning",
    }
}

fn transition_message(state: EmqxState, spec: &EmqxSpec, observed: &Observation) -> String {
    match state {
        EmqxState::Init => String::new(),
        EmqxState::Creating => "Creating EMQX cluster".to_string(),
        EmqxState::CoreUpdating => format!(
            "Core nodes updating: {}/{} ready, {} running",
            observed.core.effective_ready(),
            spec.core_replicas(),
            running_nodes(&observed.nodes, NodeRole::Core)
        ),
        EmqxState::CoreReady => format!(
            "Core nodes ready, replicant nodes {}/{} ready",
            observed.replicant.effective_ready(),
            spec.replicant_replicas()
        ),
        EmqxState::Running => "All EMQX nodes are running".to_string(),
    }
}

/// Write `next` and the observation into `status`
///
/// Conditions are only touched when the state's own condition is not
/// already `True`, so a steady state produces an identical status.
pub fn apply_transition(
    status: &mut EmqxStatus,
    spec: &EmqxSpec,
    observed: &Observation,
    next: EmqxState,
    generation: Option<i64>,
) {
    if let Some(type_) = next.condition_type() {
        if !conditions::is_condition_true(&status.conditions, type_) {
            conditions::supersede(
                &mut status.conditions,
                type_,
                transition_reason(next),
                &transition_message(next, spec, observed),
            );
        }
    }

    if matches!(next, EmqxState::CoreReady | EmqxState::Running) {
        status.current_image = Some(spec.image.clone());
    }

    status.state = next;
    status.core_node_replicas = spec.core_replicas();
    status.core_node_ready_replicas = observed.core.effective_ready();
    status.replicant_node_replicas = spec.replicant_replicas();
    status.replicant_node_ready_replicas = observed.replicant.effective_ready();
    status.emqx_nodes = observed.nodes.clone();
    status.observed_generation = generation;
}

/// One full evaluation: the status that should be persisted after this pass
pub fn evaluate(
    spec: &EmqxSpec,
    current: Option<&EmqxStatus>,
    observed: &Observation,
    generation: Option<i64>,
) -> EmqxStatus {
    let mut status = current.cloned().unwrap_or_default();
    let next = next_state(
        spec,
        status.state,
        status.current_image.as_deref(),
        observed,
    );
    apply_transition(&mut status, spec, observed, next, generation);
    status
}
