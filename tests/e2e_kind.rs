//! End-to-end test against a Kind cluster
//!
//! Run with: cargo test --test e2e_kind -- --ignored
//!
//! `E2E_OPERATOR_IMAGE` names the operator image; set `E2E_BUILD_IMAGE=1` to
//! build it from a Dockerfile in the working directory first.

use std::error::Error;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use emqx_k8s::crd::Emqx;
use kube::CustomResourceExt;

const OPERATOR_NAMESPACE: &str = "emqx-operator-system";
const TEST_NAMESPACE: &str = "emqx-e2e";
const OPERATOR_NAME: &str = "emqx-operator";
const CLUSTER_NAME: &str = "emqx";

type TestResult<T = ()> = Result<T, Box<dyn Error>>;

/// Full lifecycle of one EMQX cluster:
///
/// 1. Start (or reuse) a Kind cluster and install the CRD.
/// 2. Deploy the operator.
/// 3. Apply an EMQX resource with two core nodes and one replicant.
/// 4. Wait for `status.state` to reach `Running`.
/// 5. Check the listener Service and its EndpointSlice.
/// 6. Change the image and wait for the new image to be adopted.
/// 7. Delete the resource and verify owned objects are collected.
#[test]
#[ignore]
fn e2e_emqx_lifecycle() -> TestResult {
    for tool in &["kind", "kubectl", "docker"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }

    let kind_cluster = std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "emqx-e2e".into());
    ensure_kind_cluster(&kind_cluster)?;

    apply(&serde_yaml::to_string(&Emqx::crd())?)?;

    let image =
        std::env::var("E2E_OPERATOR_IMAGE").unwrap_or_else(|_| "emqx-operator:e2e".into());
    if env_true("E2E_BUILD_IMAGE", false) {
        run("docker", &["build", "-t", &image, "."], None)?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run(
            "kind",
            &["load", "docker-image", &image, "--name", &kind_cluster],
            None,
        )?;
    }

    let operator_yaml = operator_manifest(&image);
    let _cleanup = Cleanup {
        operator_manifest: operator_yaml.clone(),
    };

    apply(&namespace_manifest(OPERATOR_NAMESPACE))?;
    apply(&namespace_manifest(TEST_NAMESPACE))?;
    apply(&operator_yaml)?;
    kubectl(&[
        "rollout",
        "status",
        &format!("deployment/{OPERATOR_NAME}"),
        "-n",
        OPERATOR_NAMESPACE,
        "--timeout=180s",
    ])?;

    apply(&emqx_manifest("emqx/emqx:5.1.0"))?;

    wait_for("core StatefulSet", Duration::from_secs(90), || {
        Ok(kubectl(&["get", "statefulset", "emqx-core", "-n", TEST_NAMESPACE]).is_ok())
    })?;
    wait_for("state Running", Duration::from_secs(600), || {
        Ok(jsonpath("emqx", CLUSTER_NAME, "{.status.state}")? == "Running")
    })?;

    let ready_core = jsonpath("emqx", CLUSTER_NAME, "{.status.coreNodeReadyReplicas}")?;
    assert_eq!(ready_core, "2");
    let ready_replicant = jsonpath("emqx", CLUSTER_NAME, "{.status.replicantNodeReadyReplicas}")?;
    assert_eq!(ready_replicant, "1");

    // Listener routing follows the running replicant
    wait_for("listener endpoints", Duration::from_secs(120), || {
        let addresses = jsonpath(
            "endpointslice",
            "emqx-listeners",
            "{.endpoints[*].addresses[0]}",
        )
        .unwrap_or_default();
        Ok(addresses.split_whitespace().count() == 1)
    })?;
    let ports = jsonpath("service", "emqx-listeners", "{.spec.ports[*].port}")?;
    assert!(
        ports.split_whitespace().any(|p| p == "1883"),
        "expected the default MQTT listener, got {ports:?}"
    );
    let selector = jsonpath("service", "emqx-listeners", "{.spec.selector}")?;
    assert!(selector.is_empty(), "listener Service must not select pods");

    // Image upgrade: core nodes first, then replicants
    apply(&emqx_manifest("emqx/emqx:5.1.1"))?;
    wait_for("new image adopted", Duration::from_secs(900), || {
        let current = jsonpath("emqx", CLUSTER_NAME, "{.status.currentImage}")?;
        let state = jsonpath("emqx", CLUSTER_NAME, "{.status.state}")?;
        Ok(current == "emqx/emqx:5.1.1" && state == "Running")
    })?;

    kubectl(&[
        "delete",
        "emqx",
        CLUSTER_NAME,
        "-n",
        TEST_NAMESPACE,
        "--wait=true",
        "--timeout=120s",
    ])?;
    wait_for("owned objects collected", Duration::from_secs(120), || {
        Ok(kubectl(&["get", "statefulset", "emqx-core", "-n", TEST_NAMESPACE]).is_err())
    })?;

    Ok(())
}

fn emqx_manifest(image: &str) -> String {
    format!(
        r#"apiVersion: apps.emqx.io/v2alpha1
kind: EMQX
metadata:
  name: {CLUSTER_NAME}
  namespace: {TEST_NAMESPACE}
spec:
  image: {image}
  coreTemplate:
    spec:
      replicas: 2
  replicantTemplate:
    spec:
      replicas: 1
"#
    )
}

fn namespace_manifest(name: &str) -> String {
    format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {name}\n")
}

fn operator_manifest(image: &str) -> String {
    format!(
        r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {OPERATOR_NAME}
  namespace: {OPERATOR_NAMESPACE}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {OPERATOR_NAME}
rules:
  - apiGroups: ["apps.emqx.io"]
    resources: ["emqxes"]
    verbs: ["get", "list", "watch"]
  - apiGroups: ["apps.emqx.io"]
    resources: ["emqxes/status"]
    verbs: ["get", "update", "patch"]
  - apiGroups: [""]
    resources: ["pods"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["pods/portforward"]
    verbs: ["create", "get"]
  - apiGroups: [""]
    resources: ["services", "configmaps", "secrets"]
    verbs: ["get", "list", "watch", "create", "update", "patch"]
  - apiGroups: ["apps"]
    resources: ["statefulsets", "deployments"]
    verbs: ["get", "list", "watch", "create", "update", "patch"]
  - apiGroups: ["discovery.k8s.io"]
    resources: ["endpointslices"]
    verbs: ["get", "list", "watch", "create", "update", "patch"]
  - apiGroups: [""]
    resources: ["events"]
    verbs: ["create", "patch"]
  - apiGroups: ["coordination.k8s.io"]
    resources: ["leases"]
    verbs: ["get", "create", "update", "patch"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {OPERATOR_NAME}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {OPERATOR_NAME}
subjects:
  - kind: ServiceAccount
    name: {OPERATOR_NAME}
    namespace: {OPERATOR_NAMESPACE}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {OPERATOR_NAME}
  namespace: {OPERATOR_NAMESPACE}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {OPERATOR_NAME}
  template:
    metadata:
      labels:
        app: {OPERATOR_NAME}
    spec:
      serviceAccountName: {OPERATOR_NAME}
      containers:
        - name: operator
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run", "--log-format", "json"]
          env:
            - name: OPERATOR_NAMESPACE
              value: {OPERATOR_NAMESPACE}
"#
    )
}

struct Cleanup {
    operator_manifest: String,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = kubectl(&[
            "delete",
            "emqx",
            CLUSTER_NAME,
            "-n",
            TEST_NAMESPACE,
            "--ignore-not-found=true",
            "--timeout=60s",
        ]);
        let _ = run("kubectl", &["delete", "-f", "-"], Some(&self.operator_manifest));
        for ns in [TEST_NAMESPACE, OPERATOR_NAMESPACE] {
            let _ = kubectl(&["delete", "namespace", ns, "--ignore-not-found=true"]);
        }
    }
}

fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn ensure_kind_cluster(name: &str) -> TestResult {
    let clusters = run("kind", &["get", "clusters"], None)?;
    if !clusters.lines().any(|line| line.trim() == name) {
        run("kind", &["create", "cluster", "--name", name], None)?;
    }
    Ok(())
}

fn env_true(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn apply(manifest: &str) -> TestResult {
    run("kubectl", &["apply", "-f", "-"], Some(manifest)).map(|_| ())
}

fn kubectl(args: &[&str]) -> TestResult<String> {
    run("kubectl", args, None)
}

fn jsonpath(kind: &str, name: &str, path: &str) -> TestResult<String> {
    kubectl(&[
        "get",
        kind,
        name,
        "-n",
        TEST_NAMESPACE,
        "-o",
        &format!("jsonpath={path}"),
    ])
}

/// Run a command, optionally feeding `stdin`, and return trimmed stdout
fn run(program: &str, args: &[&str], stdin: Option<&str>) -> TestResult<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())?;
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program,
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> TestResult
where
    F: FnMut() -> TestResult<bool>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {label} after {timeout:?} (attempts={attempts})"
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}
