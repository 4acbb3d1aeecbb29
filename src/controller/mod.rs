//! Controller module for EMQX reconciliation
//!
//! This module contains the main controller loop, the sub-reconciler chain,
//! and the builders for every object the operator owns.

pub mod conditions;
pub mod emqx_api;
pub mod listeners;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod port_forward;
pub mod prober;
mod reconciler;
pub mod resources;
pub mod status;
pub mod sub_reconciler;
#[cfg(test)]
pub(crate) mod test_utils;

pub use reconciler::{run_chain, run_controller, ControllerState};
pub use sub_reconciler::{default_chain, SubReconciler, SubResult};
