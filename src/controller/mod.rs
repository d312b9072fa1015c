//! Controllers reconciling Kubernetes networking objects against OpenStack
//!
//! Four watch loops and one periodic task share a [`Context`]:
//! - NetworkPolicy -> KuryrNetworkPolicy ([`network_policy`])
//! - KuryrNetworkPolicy -> Neutron security group and rules ([`kuryr_network_policy`])
//! - Service and EndpointSlices -> KuryrLoadBalancer ([`service`])
//! - KuryrLoadBalancer -> Octavia load balancer graph ([`load_balancer`])
//! - the [`sweeper`], which resyncs load balancers whose cloud resources vanished

pub mod cidr;
pub mod cluster;
pub mod drivers;
mod finalizers;
#[cfg(test)]
mod fixtures;
pub mod kuryr_network_policy;
pub mod load_balancer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod network_policy;
pub mod policy_translator;
pub mod retry;
pub mod selector;
pub mod service;
pub mod sg_reconciler;
pub mod sg_rules;
pub mod sweeper;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{self, BoxFuture, FutureExt};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::openstack::{LoadBalancerApi, NetworkApi};

pub use cluster::{ClusterApi, EventType, KubeCluster};
pub use drivers::Drivers;
pub use policy_translator::PolicyTranslator;
pub use retry::{calculate_backoff, ReconcileOutcome, RetryTracker};
pub use sg_reconciler::SecurityGroupReconciler;

/// Requeue delay while another replica holds the lease
const STANDBY_REQUEUE: Duration = Duration::from_secs(5);

/// Everything a reconcile pass needs, built once at startup
pub struct Context {
    pub cluster: Arc<dyn ClusterApi>,
    pub network: Arc<dyn NetworkApi>,
    pub lbaas: Arc<dyn LoadBalancerApi>,
    pub config: Arc<Config>,
    pub drivers: Drivers,
    pub translator: PolicyTranslator,
    pub sg_reconciler: SecurityGroupReconciler,
}

impl Context {
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<dyn ClusterApi>,
        network: Arc<dyn NetworkApi>,
        lbaas: Arc<dyn LoadBalancerApi>,
    ) -> Result<Self> {
        let drivers = Drivers::from_config(
            config.clone(),
            cluster.clone(),
            network.clone(),
            lbaas.clone(),
        )?;
        Ok(Self {
            translator: PolicyTranslator::new(cluster.clone(), network.clone(), config.clone()),
            sg_reconciler: SecurityGroupReconciler::new(network.clone()),
            cluster,
            network,
            lbaas,
            config,
            drivers,
        })
    }

    /// Publish an Event on `object`. Failing to publish is only logged.
    pub async fn emit_event(
        &self,
        object: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        if let Err(e) = self
            .cluster
            .publish_event(object, event_type, reason, message)
            .await
        {
            warn!(
                "Failed to publish {} event for {}: {}",
                reason,
                object.name.as_deref().unwrap_or_default(),
                e
            );
        }
    }
}

/// `namespace/name` of a namespaced object
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// State shared by the watch loops
pub struct ControllerState {
    pub client: Client,
    pub ctx: Arc<Context>,
    pub is_leader: Arc<AtomicBool>,
    /// Set once every enabled watch loop is running
    pub ready: Arc<AtomicBool>,
    pub dry_run: bool,
    retries: RetryTracker,
}

impl ControllerState {
    pub fn new(client: Client, ctx: Arc<Context>, is_leader: Arc<AtomicBool>, dry_run: bool) -> Self {
        let retries = RetryTracker::new(ctx.config.kubernetes.max_fatal_retries);
        Self {
            client,
            ctx,
            is_leader,
            ready: Arc::new(AtomicBool::new(false)),
            dry_run,
            retries,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// `Some(action)` when this replica must not touch anything
    fn standby(&self, controller: &str, key: &str) -> Option<Action> {
        if !self.is_leader() {
            debug!("Not leading, deferring {} {}", controller, key);
            return Some(Action::requeue(STANDBY_REQUEUE));
        }
        if self.dry_run {
            info!("[dry-run] skipping {} {}", controller, key);
            return Some(Action::requeue(self.ctx.config.reconcile_interval()));
        }
        None
    }

    /// Turn the result of a pass into the next action, resetting the retry
    /// counter of `key` on success
    fn finish(
        &self,
        controller: &str,
        key: &str,
        started: Instant,
        result: Result<()>,
    ) -> Result<Action> {
        #[cfg(feature = "metrics")]
        metrics::observe_reconcile_duration_seconds(controller, started.elapsed().as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = (controller, started);

        result?;
        Ok(self.retries.next_action(
            key,
            &ReconcileOutcome::Success,
            self.ctx.config.reconcile_interval(),
        ))
    }

    /// Shared error policy: NotReady is retried with backoff forever, other
    /// failures a bounded number of times
    fn error_action(&self, controller: &str, key: &str, error: &Error) -> Action {
        #[cfg(feature = "metrics")]
        metrics::inc_reconcile_error(controller, error.kind());

        if error.is_retriable() {
            debug!("{} {} not ready: {}", controller, key, error);
        } else {
            error!("Reconciliation error for {} {}: {:?}", controller, key, error);
        }
        self.retries.next_action(
            key,
            &ReconcileOutcome::from_error(error),
            self.ctx.config.reconcile_interval(),
        )
    }
}

/// Run every enabled watch loop until shutdown
pub async fn run_controllers(state: Arc<ControllerState>) -> Result<()> {
    let k8s = &state.ctx.config.kubernetes;
    let mut loops: Vec<BoxFuture<'static, Result<()>>> = Vec::new();

    if k8s.handler_enabled("policy") {
        loops.push(network_policy::run(state.clone()).boxed());
    }
    if k8s.handler_enabled("kuryrnetworkpolicy") {
        loops.push(kuryr_network_policy::run(state.clone()).boxed());
    }
    if k8s.handler_enabled("service") {
        loops.push(service::run(state.clone()).boxed());
    }
    if k8s.handler_enabled("kuryrloadbalancer") {
        loops.push(load_balancer::run(state.clone()).boxed());
        loops.push(sweeper::run(state.clone()).boxed());
    }
    if loops.is_empty() {
        return Err(Error::ConfigError(
            "kubernetes.enabled_handlers enables no controller".to_string(),
        ));
    }

    info!("Starting {} controller loops", loops.len());
    state.ready.store(true, Ordering::Relaxed);
    let results = future::join_all(loops).await;
    state.ready.store(false, Ordering::Relaxed);
    results.into_iter().collect()
}
