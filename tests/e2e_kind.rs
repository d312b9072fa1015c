use std::error::Error;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

const CONTROLLER_NAMESPACE: &str = "kuryr-system";
const TEST_NAMESPACE: &str = "kuryr-e2e";
const CONTROLLER_NAME: &str = "kuryr-controller";
const POLICY_NAME: &str = "allow-frontend";

// ---------------------------------------------------------------------------
// Kind based end-to-end tests.
//
// Run with: cargo test --test e2e_kind -- --ignored
//
// The dry-run test only needs kind, kubectl and docker. The policy test also
// needs a reachable OpenStack: set KURYR_E2E_CONFIG to a controller TOML file
// with valid `[openstack]` credentials.
// ---------------------------------------------------------------------------

/// Controller in dry-run mode: it starts, turns ready and leaves policies alone.
#[test]
#[ignore]
fn e2e_dry_run_controller_becomes_ready() -> Result<(), Box<dyn Error>> {
    if !prerequisites() {
        return Ok(());
    }
    let _cleanup = Cleanup;
    deploy_controller("[kubernetes]\n", true)?;

    kubectl_apply(&policy_manifest())?;
    // give the watch loops time to (not) act
    sleep(Duration::from_secs(15));
    let knp = run_cmd(
        "kubectl",
        &["get", "kuryrnetworkpolicy", POLICY_NAME, "-n", TEST_NAMESPACE],
    );
    assert!(knp.is_err(), "dry-run controller created a KuryrNetworkPolicy");
    Ok(())
}

/// NetworkPolicy lifecycle against a real Neutron.
#[test]
#[ignore]
fn e2e_network_policy_gets_a_security_group() -> Result<(), Box<dyn Error>> {
    let Ok(config_path) = std::env::var("KURYR_E2E_CONFIG") else {
        eprintln!("KURYR_E2E_CONFIG is not set; skipping OpenStack E2E test.");
        return Ok(());
    };
    if !prerequisites() {
        return Ok(());
    }
    let config = std::fs::read_to_string(&config_path)?;
    let _cleanup = Cleanup;
    deploy_controller(&config, false)?;

    kubectl_apply(&policy_manifest())?;
    wait_for("KuryrNetworkPolicy created", Duration::from_secs(60), || {
        Ok(run_cmd(
            "kubectl",
            &["get", "kuryrnetworkpolicy", POLICY_NAME, "-n", TEST_NAMESPACE],
        )
        .is_ok())
    })?;

    wait_for("security group recorded", Duration::from_secs(180), || {
        let sg = run_cmd(
            "kubectl",
            &[
                "get",
                "kuryrnetworkpolicy",
                POLICY_NAME,
                "-n",
                TEST_NAMESPACE,
                "-o",
                "jsonpath={.status.securityGroupId}",
            ],
        )
        .unwrap_or_default();
        Ok(!sg.is_empty())
    })?;

    run_cmd(
        "kubectl",
        &[
            "delete",
            "networkpolicy",
            POLICY_NAME,
            "-n",
            TEST_NAMESPACE,
            "--timeout=180s",
            "--wait=true",
        ],
    )?;
    wait_for("KuryrNetworkPolicy released", Duration::from_secs(120), || {
        Ok(run_cmd(
            "kubectl",
            &["get", "kuryrnetworkpolicy", POLICY_NAME, "-n", TEST_NAMESPACE],
        )
        .is_err())
    })?;
    Ok(())
}

fn prerequisites() -> bool {
    for tool in &["kind", "kubectl", "docker", "cargo"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return false;
        }
    }
    true
}

/// Install the CRDs, then roll out the controller with `config` mounted as
/// its configuration file.
fn deploy_controller(config: &str, dry_run: bool) -> Result<(), Box<dyn Error>> {
    let cluster_name = std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "kuryr-e2e".into());
    ensure_kind_cluster(&cluster_name)?;

    let crds = run_cmd("cargo", &["run", "--quiet", "--bin", "crdgen"])?;
    kubectl_apply(&crds)?;

    let image =
        std::env::var("E2E_CONTROLLER_IMAGE").unwrap_or_else(|_| "kuryr-controller:e2e".into());
    if env_true("E2E_BUILD_IMAGE", false) {
        run_cmd("docker", &["build", "-t", &image, "."])?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run_cmd(
            "kind",
            &["load", "docker-image", &image, "--name", &cluster_name],
        )?;
    }

    for ns in [CONTROLLER_NAMESPACE, TEST_NAMESPACE] {
        let manifest = run_cmd(
            "kubectl",
            &["create", "namespace", ns, "--dry-run=client", "-o", "yaml"],
        )?;
        kubectl_apply(&manifest)?;
    }
    kubectl_apply(&controller_manifest(&image, config, dry_run))?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            &format!("deployment/{}", CONTROLLER_NAME),
            "-n",
            CONTROLLER_NAMESPACE,
            "--timeout=180s",
        ],
    )?;
    Ok(())
}

struct Cleanup;

impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "delete",
                "networkpolicy",
                POLICY_NAME,
                "-n",
                TEST_NAMESPACE,
                "--ignore-not-found=true",
                "--timeout=120s",
            ],
        );
        for ns in [TEST_NAMESPACE, CONTROLLER_NAMESPACE] {
            let _ = run_cmd_quiet(
                "kubectl",
                &["delete", "namespace", ns, "--ignore-not-found=true"],
            );
        }
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "delete",
                "clusterrolebinding,clusterrole",
                CONTROLLER_NAME,
                "--ignore-not-found=true",
            ],
        );
    }
}

fn policy_manifest() -> String {
    format!(
        r#"apiVersion: networking.k8s.io/v1
kind: NetworkPolicy
metadata:
  name: {name}
  namespace: {namespace}
spec:
  podSelector:
    matchLabels:
      app: backend
  ingress:
    - from:
        - podSelector:
            matchLabels:
              app: frontend
      ports:
        - protocol: TCP
          port: 8080
"#,
        name = POLICY_NAME,
        namespace = TEST_NAMESPACE,
    )
}

fn indent(text: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    text.lines()
        .map(|line| format!("{}{}", pad, line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn controller_manifest(image: &str, config: &str, dry_run: bool) -> String {
    format!(
        r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {name}
  namespace: {namespace}
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: {name}-config
  namespace: {namespace}
data:
  kuryr.toml: |
{config}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {name}
rules:
  - apiGroups: ["openstack.org"]
    resources: ["kuryrnetworkpolicies", "kuryrloadbalancers", "kuryrnetworks"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: ["openstack.org"]
    resources: ["kuryrnetworkpolicies/status", "kuryrloadbalancers/status"]
    verbs: ["get", "update", "patch"]
  - apiGroups: ["networking.k8s.io"]
    resources: ["networkpolicies"]
    verbs: ["get", "list", "watch", "update", "patch"]
  - apiGroups: [""]
    resources: ["pods", "namespaces"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["services", "services/status"]
    verbs: ["get", "list", "watch", "update", "patch"]
  - apiGroups: ["discovery.k8s.io"]
    resources: ["endpointslices"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["events"]
    verbs: ["create", "patch"]
  - apiGroups: ["coordination.k8s.io"]
    resources: ["leases"]
    verbs: ["get", "list", "watch", "create", "update", "patch"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {name}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {name}
subjects:
  - kind: ServiceAccount
    name: {name}
    namespace: {namespace}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  namespace: {namespace}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
    spec:
      serviceAccountName: {name}
      containers:
        - name: controller
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run", "--config", "/etc/kuryr/kuryr.toml"]
          env:
            - name: POD_NAMESPACE
              value: {namespace}
            - name: DRY_RUN
              value: "{dry_run}"
          readinessProbe:
            httpGet:
              path: /readyz
              port: 8082
          volumeMounts:
            - name: config
              mountPath: /etc/kuryr
      volumes:
        - name: config
          configMap:
            name: {name}-config
"#,
        name = CONTROLLER_NAME,
        namespace = CONTROLLER_NAMESPACE,
        config = indent(config, 4),
        image = image,
        dry_run = dry_run,
    )
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
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
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
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

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)
}

fn command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    cmd
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let output = command(program, args).output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program, args, stdout, stderr
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut child = command(program, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
        stdin.flush()?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("command failed: {} {:?}\nstderr:\n{}", program, args, stderr).into());
    }
    Ok(())
}

fn run_cmd_quiet(program: &str, args: &[&str]) -> Result<(), Box<dyn Error>> {
    let _ = command(program, args).output();
    Ok(())
}
