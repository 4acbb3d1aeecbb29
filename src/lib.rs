//! emqx-k8s: Kubernetes operator for EMQX clusters
//!
//! This crate provides a Kubernetes operator that runs an EMQX cluster as a
//! StatefulSet of core nodes plus a Deployment of replicant nodes, and keeps
//! client-facing listener routing in step with the nodes EMQX reports.

pub mod controller;
pub mod crd;
pub mod error;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
