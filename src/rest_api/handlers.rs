//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::{api::Api, ResourceExt};
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::Emqx;

use super::dto::{
    ClusterDetailResponse, ClusterListResponse, ClusterSummary, ErrorResponse, HealthResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub(crate) fn summarize(emqx: &Emqx) -> ClusterSummary {
    let status = emqx.status.clone().unwrap_or_default();
    ClusterSummary {
        name: emqx.name_any(),
        namespace: emqx.namespace().unwrap_or_default(),
        image: emqx.spec.image.clone(),
        state: status.state,
        core_replicas: emqx.spec.core_replicas(),
        core_ready_replicas: status.core_node_ready_replicas,
        replicant_replicas: emqx.spec.replicant_replicas(),
        replicant_ready_replicas: status.replicant_node_ready_replicas,
    }
}

/// List all EMQX clusters
#[instrument(skip(state))]
pub async fn list_clusters(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ClusterListResponse>, ApiError> {
    let api: Api<Emqx> = state.emqx_api();

    match api.list(&Default::default()).await {
        Ok(list) => {
            let items: Vec<ClusterSummary> = list.items.iter().map(summarize).collect();
            let total = items.len();
            Ok(Json(ClusterListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list EMQX clusters: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Get a specific EMQX cluster
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_cluster(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ClusterDetailResponse>, ApiError> {
    let api: Api<Emqx> = Api::namespaced(state.client.clone(), &namespace);

    match api.get(&name).await {
        Ok(emqx) => Ok(Json(ClusterDetailResponse {
            name: emqx.name_any(),
            namespace: emqx.namespace().unwrap_or_default(),
            image: emqx.spec.image.clone(),
            status: emqx.status.clone().unwrap_or_default(),
            created_at: emqx.metadata.creation_timestamp.map(|t| t.0.to_rfc3339()),
        })),
        Err(kube::Error::Api(e)) if e.code == 404 => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("EMQX {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get EMQX {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EmqxSpec, EmqxState, EmqxStatus};

    #[tokio::test]
    async fn test_health_reports_version() {
        let Json(body) = health().await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_summarize_without_status() {
        let mut emqx = Emqx::new(
            "emqx",
            EmqxSpec {
                image: "emqx/emqx:5.1.0".to_string(),
                image_pull_policy: None,
                image_pull_secrets: vec![],
                cluster_domain: None,
                bootstrap_config: None,
                core_template: Default::default(),
                replicant_template: None,
                dashboard_service_template: None,
                listeners_service_template: None,
            },
        );
        let summary = summarize(&emqx);
        assert_eq!(summary.state, EmqxState::Init);
        assert_eq!(summary.core_replicas, 2);

        emqx.status = Some(EmqxStatus {
            state: EmqxState::Running,
            core_node_ready_replicas: 2,
            ..Default::default()
        });
        assert_eq!(summarize(&emqx).core_ready_replicas, 2);
    }
}
