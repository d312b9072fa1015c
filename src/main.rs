use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kuryr_k8s::config::Config;
use kuryr_k8s::controller::{self, Context, ControllerState, KubeCluster};
use kuryr_k8s::crd::{KuryrLoadBalancer, KuryrNetworkPolicy};
use kuryr_k8s::openstack::OpenStackClient;
use kuryr_k8s::Error;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the resources the controller manages
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the TOML configuration file
    #[arg(long, env = "KURYR_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
    namespace: String,

    /// Port of the health and metrics server
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8082)]
    health_port: u16,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Watch and log, but never touch Kubernetes or OpenStack resources
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Limit the listing to one namespace
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Kuryr controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let (knps, klbs): (Api<KuryrNetworkPolicy>, Api<KuryrLoadBalancer>) = match &args.namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    let knps = knps.list(&Default::default()).await?;
    let klbs = klbs.list(&Default::default()).await?;

    let with_group = knps
        .items
        .iter()
        .filter(|knp| knp.security_group_id().is_some())
        .count();
    let with_lb = klbs
        .items
        .iter()
        .filter(|klb| klb.status.as_ref().and_then(|s| s.lb_id()).is_some())
        .count();
    println!(
        "KuryrNetworkPolicies: {} ({} with a security group)",
        knps.items.len(),
        with_group
    );
    println!(
        "KuryrLoadBalancers: {} ({} with a load balancer)",
        klbs.items.len(),
        with_lb
    );
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let json = matches!(format, LogFormat::Json);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(true)));

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = kuryr_k8s::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
    }
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);
    info!("Starting Kuryr controller v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Config::load(path)?
        }
        None => {
            warn!("No configuration file given, using defaults");
            let config = Config::default();
            config.validate()?;
            config
        }
    };
    let config = Arc::new(config);

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let openstack = Arc::new(OpenStackClient::new(config.openstack.clone())?);
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let ctx = Arc::new(Context::new(
        config.clone(),
        cluster,
        openstack.clone(),
        openstack,
    )?);

    let is_leader = Arc::new(AtomicBool::new(false));
    if config.kubernetes.controller_ha {
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let lease_client = client.clone();
        let lease_ns = args.namespace.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_ns, &holder_identity, is_leader_bg).await;
        });
    } else {
        is_leader.store(true, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        controller::metrics::set_leader(true);
    }

    let state = Arc::new(ControllerState::new(
        client,
        ctx,
        Arc::clone(&is_leader),
        args.dry_run,
    ));

    #[cfg(feature = "rest-api")]
    {
        let health = kuryr_k8s::rest_api::HealthState::from(state.as_ref());
        let port = args.health_port;
        tokio::spawn(async move {
            if let Err(e) = kuryr_k8s::rest_api::run_server(health, port).await {
                error!("Health server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    let _ = args.health_port;

    let result = controller::run_controllers(state).await;
    if let Err(e) = &result {
        error!("Controller stopped: {}", e);
    }

    // Flush any remaining traces
    kuryr_k8s::telemetry::shutdown_telemetry();

    result
}

const LEASE_NAME: &str = "kuryr-controller-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

fn set_leader(is_leader: &AtomicBool, leading: bool) {
    is_leader.store(leading, Ordering::Relaxed);
    #[cfg(feature = "metrics")]
    controller::metrics::set_leader(leading);
}

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                set_leader(&is_leader, true);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                set_leader(&is_leader, false);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                set_leader(&is_leader, false);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    now > renew.0 + chrono::Duration::seconds(i64::from(duration))
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }
            info!("Lease held by {:?} has expired, taking over", current_holder);
            let patch = serde_json::json!({
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(true)
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
