//! Response bodies for the REST API

use serde::Serialize;

use crate::crd::{EmqxState, EmqxStatus};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub state: EmqxState,
    pub core_replicas: i32,
    pub core_ready_replicas: i32,
    pub replicant_replicas: i32,
    pub replicant_ready_replicas: i32,
}

#[derive(Debug, Serialize)]
pub struct ClusterListResponse {
    pub items: Vec<ClusterSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetailResponse {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub status: EmqxStatus,
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
