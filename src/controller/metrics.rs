//! Prometheus metrics for the EMQX operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `emqx_operator_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `emqx_operator_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `emqx_cluster_ready_replicas` (gauge): ready replicas labeled by namespace/name/role.
//! - `emqx_cluster_state` (gauge): lifecycle state as a number (0 = Init .. 4 = Running).

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::{EmqxState, NodeRole};

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "emqx"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::kind`
    pub kind: String,
}

/// Labels for per-cluster gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

/// Labels for per-role gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RoleLabels {
    pub namespace: String,
    pub name: String,
    pub role: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking ready replicas per cluster and role
pub static READY_REPLICAS: Lazy<Family<RoleLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the lifecycle state per cluster
pub static CLUSTER_STATE: Lazy<Family<ClusterLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "emqx_operator_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "emqx_operator_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "emqx_cluster_ready_replicas",
        "Ready replicas of an EMQX cluster by node role",
        READY_REPLICAS.clone(),
    );
    registry.register(
        "emqx_cluster_state",
        "Lifecycle state of an EMQX cluster (0=Init, 1=Creating, 2=CoreUpdating, 3=CoreReady, 4=Running)",
        CLUSTER_STATE.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_ready_replicas(namespace: &str, name: &str, role: NodeRole, ready: i32) {
    let labels = RoleLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        role: role.to_string(),
    };
    READY_REPLICAS.get_or_create(&labels).set(i64::from(ready));
}

pub fn set_cluster_state(namespace: &str, name: &str, state: EmqxState) {
    let labels = ClusterLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    CLUSTER_STATE.get_or_create(&labels).set(state as i64);
}

/// Drop the per-cluster gauges of a deleted cluster
pub fn forget_cluster(namespace: &str, name: &str) {
    CLUSTER_STATE.remove(&ClusterLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    });
    for role in [NodeRole::Core, NodeRole::Replicant] {
        READY_REPLICAS.remove(&RoleLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            role: role.to_string(),
        });
    }
}
