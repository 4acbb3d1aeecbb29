//! In-process stand-in for the Kubernetes API server
//!
//! Every request is recorded and answered by a handler closure, so tests can
//! drive the real reconcile steps and inspect what they wrote.

use std::sync::{Arc, Mutex};

use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use kube::api::ObjectMeta;
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};

use crate::controller::resources::{LABEL_DB_ROLE, LABEL_INSTANCE};
use crate::crd::{EmqxNode, NodeRole};

/// One request as seen by the fake API server
#[derive(Clone, Debug)]
pub struct ApiCall {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: Value,
}

impl ApiCall {
    pub fn is(&self, method: &str, path: &str) -> bool {
        self.method == method && self.path == path
    }
}

pub type CallLog = Arc<Mutex<Vec<ApiCall>>>;

/// Calls matching `method` and `path`
pub fn calls_to(log: &CallLog, method: &str, path: &str) -> Vec<ApiCall> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|c| c.is(method, path))
        .cloned()
        .collect()
}

/// Client whose requests are answered by `handler` with `(status, body)`
pub fn fake_client<F>(handler: F) -> (Client, CallLog)
where
    F: Fn(&ApiCall) -> (u16, Value) + Send + Sync + 'static,
{
    let log: CallLog = Arc::default();
    let recorded = log.clone();
    let handler = Arc::new(handler);

    let service = tower::service_fn(move |req: Request<Body>| {
        let handler = handler.clone();
        let recorded = recorded.clone();
        async move {
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await?.to_bytes();
            let call = ApiCall {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                query: parts.uri.query().unwrap_or_default().to_string(),
                body: serde_json::from_slice(&bytes).unwrap_or(Value::Null),
            };
            let (status, payload) = handler(&call);
            recorded.lock().unwrap().push(call);

            let response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap())
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                .unwrap();
            Ok::<_, kube::Error>(response)
        }
    });

    (Client::new(service, "default"), log)
}

/// Creates and applies return the submitted object
pub fn echo(call: &ApiCall) -> (u16, Value) {
    (200, call.body.clone())
}

pub fn not_found(name: &str) -> (u16, Value) {
    (
        404,
        json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "message": format!("{name} not found"),
            "reason": "NotFound",
            "code": 404
        }),
    )
}

pub fn pod_list(pods: &[Pod]) -> (u16, Value) {
    (
        200,
        json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": {},
            "items": pods,
        }),
    )
}

/// Whether a pod list request selects pods of `role`
pub fn selects_role(call: &ApiCall, role: NodeRole) -> bool {
    let decoded = call.query.replace("%2F", "/").replace("%3D", "=");
    decoded.contains(&format!("{LABEL_DB_ROLE}={role}"))
}

/// A running, ready pod of one node role
pub fn running_pod(name: &str, role: NodeRole, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            labels: Some(
                [
                    (LABEL_INSTANCE.to_string(), "emqx".to_string()),
                    (LABEL_DB_ROLE.to_string(), role.to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn running_node(host: &str, role: NodeRole) -> EmqxNode {
    EmqxNode {
        node: format!("emqx@{host}"),
        node_status: "running".to_string(),
        otp_release: None,
        version: "5.1.0".to_string(),
        role,
        edition: None,
    }
}
