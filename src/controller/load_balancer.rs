//! KuryrLoadBalancer controller
//!
//! Drives the Octavia graph of one Service towards its KuryrLoadBalancer
//! spec. A pass walks the graph in a fixed order: stale members, pools and
//! listeners go first, then the load balancer itself is synced, then missing
//! listeners, pools and members are added. The status is written after every
//! change so that an interrupted pass resumes where it stopped.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::api::{Api, ListParams, ObjectMeta};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::{calculate_backoff, object_key, Context, ControllerState, EventType};
use crate::config::{MemberMode, OCTAVIA_DEFAULT_PROVIDERS};
use crate::crd::{
    KuryrLoadBalancer, KuryrLoadBalancerStatus, ListenerInfo, LoadBalancerInfo,
    LoadBalancerPort, MemberInfo, PoolInfo, TargetRef, LOAD_BALANCER_FINALIZER,
};
use crate::error::{Error, Result};

const CONTROLLER: &str = "kuryrloadbalancer";

pub async fn run(state: Arc<ControllerState>) -> Result<()> {
    let klbs: Api<KuryrLoadBalancer> = Api::all(state.client.clone());

    if let Err(e) = klbs.list(&ListParams::default().limit(1)).await {
        error!(
            "KuryrLoadBalancer CRD not found. Please install the CRD first: {:?}",
            e
        );
        return Err(Error::ConfigError(
            "KuryrLoadBalancer CRD not installed".to_string(),
        ));
    }
    info!("Starting KuryrLoadBalancer controller");

    Controller::new(klbs, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled KuryrLoadBalancer {}", obj),
                Err(e) => warn!("KuryrLoadBalancer reconcile failed: {}", e),
            }
        })
        .await;
    Ok(())
}

#[instrument(skip(state), fields(name = %klb.name_any(), namespace = klb.namespace()))]
async fn reconcile(klb: Arc<KuryrLoadBalancer>, state: Arc<ControllerState>) -> Result<Action> {
    let key = object_key(klb.as_ref());
    if let Some(action) = state.standby(CONTROLLER, &key) {
        return Ok(action);
    }
    let started = Instant::now();
    let namespace = klb.namespace().unwrap_or_default();
    let api: Api<KuryrLoadBalancer> = Api::namespaced(state.client.clone(), &namespace);
    let ctx = &state.ctx;

    let result = finalizer(&api, LOAD_BALANCER_FINALIZER, klb, |event| async move {
        let pass = match event {
            FinalizerEvent::Apply(klb) => on_present(ctx, &klb).await,
            FinalizerEvent::Cleanup(klb) => on_finalize(ctx, &klb).await,
        };
        pass.map(|()| Action::await_change())
    })
    .await
    .map_err(Error::from);

    state.finish(CONTROLLER, &key, started, result.map(|_| ()))
}

fn error_policy(klb: Arc<KuryrLoadBalancer>, error: &Error, state: Arc<ControllerState>) -> Action {
    state.error_action(CONTROLLER, &object_key(klb.as_ref()), error)
}

/// Events about a KuryrLoadBalancer are attached to its Service
pub(crate) fn service_reference(klb: &KuryrLoadBalancer) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Service".to_string()),
        namespace: klb.namespace(),
        name: Some(klb.name_any()),
        ..Default::default()
    }
}

fn is_default_provider(provider: Option<&str>) -> bool {
    provider.map_or(true, |p| OCTAVIA_DEFAULT_PROVIDERS.contains(&p))
}

fn ip_in_cidr(ip: &str, cidr: &str) -> bool {
    match (ip.parse::<IpAddr>(), cidr.parse::<IpNetwork>()) {
        (Ok(ip), Ok(net)) => net.contains(ip),
        _ => false,
    }
}

/// `(ip, pod name, port, pool id)` identifying a member
type Target = (String, String, u16, String);

fn member_target(member: &MemberInfo) -> Target {
    (
        member.ip.clone(),
        member.pod_name().unwrap_or_default().to_string(),
        member.port,
        member.pool_id.clone(),
    )
}

/// One reconcile pass over the status graph of a KuryrLoadBalancer
struct Graph<'a> {
    ctx: &'a Context,
    klb: &'a KuryrLoadBalancer,
    status: KuryrLoadBalancerStatus,
    /// Set once the resource can no longer be written; the pass stops
    gone: bool,
}

impl<'a> Graph<'a> {
    fn new(ctx: &'a Context, klb: &'a KuryrLoadBalancer, status: KuryrLoadBalancerStatus) -> Self {
        Self {
            ctx,
            klb,
            status,
            gone: false,
        }
    }

    fn namespace(&self) -> String {
        self.klb.namespace().unwrap_or_default()
    }

    async fn event(&self, event_type: EventType, reason: &str, message: &str) {
        self.ctx
            .emit_event(&service_reference(self.klb), event_type, reason, message)
            .await;
    }

    /// Every status change goes through here
    async fn persist(&mut self) -> Result<()> {
        let namespace = self.namespace();
        let name = self.klb.name_any();
        match self
            .ctx
            .cluster
            .patch_klb_status(&namespace, &name, &self.status)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_unprocessable() => {
                debug!("KuryrLoadBalancer {}/{} cannot be updated: {}", namespace, name, e);
                self.gone = true;
                Ok(())
            }
            Err(e) => {
                error!("Error updating KuryrLoadBalancer {}/{}: {}", namespace, name, e);
                self.event(
                    EventType::Warning,
                    "FailedToPatchKuryrLoadBalancer",
                    &format!("Failed to update KuryrLoadBalancer status: {}", e),
                )
                .await;
                Err(e)
            }
        }
    }

    fn loadbalancer(&self) -> Result<LoadBalancerInfo> {
        self.status.loadbalancer.clone().ok_or_else(|| {
            Error::ResourceNotReady(format!("load balancer of {} not created", object_key(self.klb)))
        })
    }

    fn listener(&self, id: &str) -> Option<&ListenerInfo> {
        self.status
            .listeners
            .iter()
            .find(|l| l.id.as_deref() == Some(id))
    }

    /// Spec port served by the listener behind `pool`
    fn spec_port_of(&self, pool: &PoolInfo) -> Option<&'a LoadBalancerPort> {
        let listener = self.listener(&pool.listener_id)?;
        let klb: &'a KuryrLoadBalancer = self.klb;
        klb.spec
            .ports
            .iter()
            .find(|p| p.port == listener.port && p.protocol == listener.protocol)
    }

    fn provider_changed(&self) -> bool {
        let Some(lb) = &self.status.loadbalancer else {
            return false;
        };
        is_default_provider(lb.provider.as_deref())
            != is_default_provider(self.klb.spec.provider.as_deref())
    }

    /// True if a public IP was recorded and has been let go
    async fn release_public_ip(&mut self) -> Result<bool> {
        let Some(info) = self.status.service_pub_ip_info.take() else {
            return Ok(false);
        };
        self.ctx.drivers.pub_ip.disassociate_pub_ip(&info).await?;
        if !self.ctx.drivers.pub_ip.release_pub_ip(&info).await {
            warn!("Floating IP {} of {} was not freed", info.ip_addr, object_key(self.klb));
        }
        Ok(true)
    }

    /// Tear the whole graph down when the provider family changed. A busy
    /// load balancer is retried until `watch_retry_timeout`.
    async fn release_for_provider_change(&mut self) -> Result<()> {
        let lb = self.loadbalancer()?;
        self.event(
            EventType::Normal,
            "KuryrReleaseLB",
            &format!(
                "Provider changed from {} to {}, rebuilding load balancer {}",
                lb.provider.as_deref().unwrap_or("default"),
                self.klb.spec.provider.as_deref().unwrap_or("default"),
                lb.name
            ),
        )
        .await;

        let deadline = Instant::now() + self.ctx.config.watch_retry_timeout();
        let mut attempt = 0;
        loop {
            match self.ctx.drivers.lbaas.release_loadbalancer(&lb).await {
                Ok(()) => break,
                Err(Error::ResourceNotReady(reason)) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        error!("Failed releasing load balancer {}: deadline exceeded", lb.name);
                        return Err(Error::ResourceNotReady(reason));
                    }
                    attempt += 1;
                    debug!("Attempt {} of releasing {} failed: {}", attempt, lb.name, reason);
                    tokio::time::sleep(calculate_backoff(attempt, Some(1), None).min(left)).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.release_public_ip().await?;
        self.status = KuryrLoadBalancerStatus::default();
        self.persist().await
    }

    async fn remove_unused_members(&mut self) -> Result<bool> {
        let Some(lb) = self.status.loadbalancer.clone() else {
            return Ok(false);
        };
        let mut pool_by_port_name: HashMap<Option<String>, String> = HashMap::new();
        for pool in &self.status.pools {
            if let (Some(port), Some(id)) = (self.spec_port_of(pool), pool.id.as_ref()) {
                pool_by_port_name.insert(port.name.clone(), id.clone());
            }
        }

        let mut current: HashSet<Target> = HashSet::new();
        for slice in &self.klb.spec.endpoint_slices {
            for endpoint in &slice.endpoints {
                let Some(ip) = endpoint.addresses.first() else {
                    continue;
                };
                let pod = endpoint
                    .target_ref
                    .as_ref()
                    .and_then(|t| t.name.clone())
                    .unwrap_or_default();
                for port in &slice.ports {
                    if let Some(pool_id) = pool_by_port_name.get(&port.name) {
                        current.insert((ip.clone(), pod.clone(), port.port, pool_id.clone()));
                    }
                }
            }
        }

        let stale: Vec<MemberInfo> = self
            .status
            .members
            .iter()
            .filter(|m| !current.contains(&member_target(m)))
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(false);
        }
        for member in &stale {
            debug!("Releasing member {}", member.name);
            self.ctx.drivers.lbaas.release_member(&lb, member).await?;
        }
        self.status.members.retain(|m| !stale.contains(m));
        self.persist().await?;
        Ok(true)
    }

    async fn remove_unused_pools(&mut self) -> Result<bool> {
        let Some(lb) = self.status.loadbalancer.clone() else {
            return Ok(false);
        };
        let stale: Vec<PoolInfo> = self
            .status
            .pools
            .iter()
            .filter(|p| self.spec_port_of(p).is_none())
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(false);
        }
        for pool in &stale {
            debug!("Releasing pool {}", pool.name);
            self.ctx.drivers.lbaas.release_pool(&lb, pool).await?;
        }
        let removed: HashSet<String> = stale.iter().filter_map(|p| p.id.clone()).collect();
        self.status.pools.retain(|p| !stale.contains(p));
        self.status.members.retain(|m| !removed.contains(&m.pool_id));
        self.persist().await?;
        Ok(true)
    }

    async fn remove_unused_listeners(&mut self) -> Result<bool> {
        let Some(lb) = self.status.loadbalancer.clone() else {
            return Ok(false);
        };
        let used: HashSet<&str> = self
            .status
            .pools
            .iter()
            .map(|p| p.listener_id.as_str())
            .collect();
        let stale: Vec<ListenerInfo> = self
            .status
            .listeners
            .iter()
            .filter(|l| !l.id.as_deref().is_some_and(|id| used.contains(id)))
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(false);
        }
        for listener in &stale {
            debug!("Releasing listener {}", listener.name);
            self.ctx.drivers.lbaas.release_listener(&lb, listener).await?;
        }
        self.status.listeners.retain(|l| !stale.contains(l));
        self.persist().await?;
        Ok(true)
    }

    /// Recreate the load balancer when the VIP moved, create it when missing
    async fn sync_loadbalancer(&mut self) -> Result<bool> {
        let klb = self.klb;
        let spec = &klb.spec;
        let mut changed = false;

        if let Some(lb) = self.status.loadbalancer.clone() {
            if Some(&lb.ip) == spec.ip.as_ref() {
                return Ok(false);
            }
            info!("VIP of {} moved from {}, releasing it", lb.name, lb.ip);
            // A failed release below must not leave the freed IP in the status
            if self.release_public_ip().await? {
                self.persist().await?;
                if self.gone {
                    return Ok(false);
                }
            }
            self.ctx.drivers.lbaas.release_loadbalancer(&lb).await?;
            self.status = KuryrLoadBalancerStatus::default();
            changed = true;
        }

        if let Some(ip) = spec.ip.clone() {
            let request = LoadBalancerInfo {
                id: None,
                name: object_key(self.klb),
                project_id: spec.project_id.clone().unwrap_or_default(),
                subnet_id: spec.subnet_id.clone().unwrap_or_default(),
                ip,
                port_id: None,
                provider: spec.provider.clone(),
                security_groups: spec.security_groups_ids.clone(),
            };
            self.event(
                EventType::Normal,
                "KuryrEnsureLB",
                &format!("Provisioning load balancer {}", request.name),
            )
            .await;
            let lb = self.ctx.drivers.lbaas.ensure_loadbalancer(&request).await?;
            self.event(
                EventType::Normal,
                "KuryrEnsuredLB",
                &format!(
                    "Load balancer {} provisioned",
                    lb.id.as_deref().unwrap_or_default()
                ),
            )
            .await;
            self.status.loadbalancer = Some(lb);
            changed = true;
        }

        if changed {
            self.persist().await?;
        }
        Ok(changed)
    }

    async fn skip_listener(&self, port: &LoadBalancerPort, why: &str) {
        warn!(
            "Skipping listener {}:{} of {}: {}",
            port.protocol,
            port.port,
            object_key(self.klb),
            why
        );
        self.event(
            EventType::Warning,
            "KuryrSkipListener",
            &format!("Skipping listener {}:{}: {}", port.protocol, port.port, why),
        )
        .await;
    }

    async fn add_new_listeners(&mut self) -> Result<bool> {
        if self.status.loadbalancer.is_none() {
            return Ok(false);
        }
        let ctx = self.ctx;
        let octavia = &ctx.config.octavia_defaults;
        let mut ports = self.klb.spec.ports.clone();
        ports.sort_by(|a, b| a.protocol.cmp(&b.protocol));

        let mut changed = false;
        for port in &ports {
            let listeners = &self.status.listeners;
            if listeners
                .iter()
                .any(|l| l.port == port.port && l.protocol == port.protocol)
            {
                continue;
            }
            if listeners.iter().any(|l| l.port == port.port) && !octavia.double_listeners_supported
            {
                self.skip_listener(port, "another listener already uses the port")
                    .await;
                continue;
            }
            if port.protocol.eq_ignore_ascii_case("SCTP") && !octavia.sctp_supported {
                self.skip_listener(port, "SCTP is not supported").await;
                continue;
            }

            let mut lb = self.loadbalancer()?;
            let listener = self
                .ctx
                .drivers
                .lbaas
                .ensure_listener(&mut lb, &port.protocol, port.port, self.klb.spec.timeouts.as_ref())
                .await?;
            let Some(listener) = listener else {
                continue;
            };
            self.status.loadbalancer = Some(lb);
            self.status.listeners.push(listener);
            self.persist().await?;
            changed = true;
            if self.gone {
                break;
            }
        }
        Ok(changed)
    }

    async fn add_new_pools(&mut self) -> Result<bool> {
        let Some(lb) = self.status.loadbalancer.clone() else {
            return Ok(false);
        };
        let with_pool: HashSet<String> = self
            .status
            .pools
            .iter()
            .map(|p| p.listener_id.clone())
            .collect();
        let missing: Vec<ListenerInfo> = self
            .status
            .listeners
            .iter()
            .filter(|l| !l.id.as_ref().is_some_and(|id| with_pool.contains(id)))
            .cloned()
            .collect();

        let mut changed = false;
        for listener in &missing {
            let pool = self.ctx.drivers.lbaas.ensure_pool(&lb, listener).await?;
            self.status.pools.push(pool);
            self.persist().await?;
            changed = true;
            if self.gone {
                break;
            }
        }
        Ok(changed)
    }

    /// Record the Service's current security groups on the load balancer
    async fn sync_security_groups(&mut self) -> Result<bool> {
        let namespace = self.namespace();
        let name = self.klb.name_any();
        let service = match self.ctx.cluster.get_service(&namespace, &name).await {
            Ok(service) => service,
            Err(e) if e.is_not_found() => {
                debug!("Service {}/{} not found", namespace, name);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let project_id = match &self.klb.spec.project_id {
            Some(id) => id.clone(),
            None => self.ctx.drivers.project.get_project(&namespace).await?,
        };
        let sgs = self
            .ctx
            .drivers
            .service_sg
            .get_security_groups(&service, &project_id)
            .await?;
        if let Some(lb) = self.status.loadbalancer.as_mut() {
            lb.security_groups = sgs;
        }
        self.persist().await?;
        Ok(!self.gone)
    }

    /// Subnet of a pod member in L2 mode: the pod subnet holding `ip`, or
    /// the worker nodes subnet for host networked pods
    async fn member_subnet(&self, target: &TargetRef, ip: &str) -> Result<String> {
        let namespace = target.namespace.clone().unwrap_or_else(|| self.namespace());
        let pod = Pod {
            metadata: ObjectMeta {
                name: target.name.clone(),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        let drivers = &self.ctx.drivers;
        let project_id = drivers.project.get_project(&namespace).await?;
        let subnets = drivers.pod_subnets.get_subnets(&pod, &project_id).await?;
        if let Some(subnet) = subnets.iter().find(|s| ip_in_cidr(ip, &s.cidr)) {
            return Ok(subnet.id.clone());
        }
        self.ctx
            .config
            .pod_vif_nested
            .worker_nodes_subnet
            .clone()
            .ok_or_else(|| {
                Error::ConfigError("pod_vif_nested.worker_nodes_subnet is not set".to_string())
            })
    }

    async fn add_new_members(&mut self) -> Result<bool> {
        if self.status.loadbalancer.is_none() || !self.sync_security_groups().await? {
            return Ok(false);
        }
        let lb = self.loadbalancer()?;

        // spec port name -> (pool, port of its listener)
        let mut pool_by_port_name: HashMap<Option<String>, (PoolInfo, u16)> = HashMap::new();
        for pool in &self.status.pools {
            let (Some(port), Some(listener)) =
                (self.spec_port_of(pool), self.listener(&pool.listener_id))
            else {
                continue;
            };
            pool_by_port_name.insert(port.name.clone(), (pool.clone(), listener.port));
        }
        if pool_by_port_name.is_empty() {
            return Ok(false);
        }

        let klb = self.klb;
        let mut changed = false;
        for slice in &klb.spec.endpoint_slices {
            for endpoint in &slice.endpoints {
                let (Some(ip), Some(target)) = (endpoint.addresses.first(), &endpoint.target_ref)
                else {
                    continue;
                };
                if target.kind.as_deref() != Some("Pod") {
                    continue;
                }
                for port in &slice.ports {
                    let Some((pool, listener_port)) = pool_by_port_name.get(&port.name) else {
                        debug!("No pool found for port {:?}", port.name);
                        continue;
                    };
                    let pool_id = pool.id.clone().unwrap_or_default();
                    if self
                        .status
                        .members
                        .iter()
                        .any(|m| &m.ip == ip && m.port == port.port && m.pool_id == pool_id)
                    {
                        continue;
                    }

                    let subnet_id = match self.ctx.config.octavia_defaults.member_mode {
                        MemberMode::L3 => lb.subnet_id.clone(),
                        MemberMode::L2 => match self.member_subnet(target, ip).await {
                            Ok(id) => id,
                            Err(e) if e.is_not_found() => {
                                debug!("Namespace of member {} is gone, skipping it", ip);
                                continue;
                            }
                            Err(e) => return Err(e),
                        },
                    };
                    let first_of_pool = !self.status.members.iter().any(|m| m.pool_id == pool_id);
                    let member = self
                        .ctx
                        .drivers
                        .lbaas
                        .ensure_member(
                            &lb,
                            pool,
                            &subnet_id,
                            ip,
                            port.port,
                            target.namespace.as_deref().unwrap_or_default(),
                            target.name.as_deref().unwrap_or_default(),
                            first_of_pool.then_some(*listener_port),
                        )
                        .await?;
                    self.status.members.push(member);
                    self.persist().await?;
                    changed = true;
                    if self.gone {
                        return Ok(changed);
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Bring the graph in line with `spec`; true if anything changed
    async fn sync(&mut self) -> Result<bool> {
        let mut changed = self.remove_unused_members().await?;
        if !self.gone {
            changed |= self.remove_unused_pools().await?;
        }
        if !self.gone {
            changed |= self.remove_unused_listeners().await?;
        }
        if !self.gone {
            changed |= self.sync_loadbalancer().await?;
        }
        if !self.gone {
            changed |= self.add_new_listeners().await?;
        }
        if !self.gone {
            changed |= self.add_new_pools().await?;
        }
        if !self.gone {
            changed |= self.add_new_members().await?;
        }
        Ok(changed)
    }

    /// Give a LoadBalancer Service its floating IP and publish it
    async fn ensure_public_ip(&mut self) -> Result<()> {
        let klb = self.klb;
        let spec = &klb.spec;
        if !spec.is_load_balancer_type() || self.status.service_pub_ip_info.is_some() {
            return Ok(());
        }
        let lb = self.loadbalancer()?;
        let project_id = spec.project_id.clone().unwrap_or_else(|| lb.project_id.clone());
        let pub_ip = &self.ctx.drivers.pub_ip;
        let Some(info) = pub_ip
            .acquire_service_pub_ip_info(
                spec.type_.as_deref(),
                spec.lb_ip.as_deref(),
                &project_id,
                lb.port_id.as_deref(),
            )
            .await?
        else {
            return Ok(());
        };
        let port_id = lb.port_id.as_deref().ok_or_else(|| {
            Error::ResourceNotReady(format!("load balancer {} has no VIP port", lb.name))
        })?;
        pub_ip.associate_pub_ip(&info, port_id).await?;
        let address = info.ip_addr.clone();
        self.status.service_pub_ip_info = Some(info);
        self.persist().await?;
        if self.gone {
            return Ok(());
        }
        info!("Service {} is reachable on {}", object_key(self.klb), address);
        self.ctx
            .cluster
            .patch_service_ingress(&self.namespace(), &self.klb.name_any(), &address)
            .await
    }
}

#[instrument(skip(ctx, klb), fields(name = %klb.name_any(), namespace = klb.namespace()))]
pub async fn on_present(ctx: &Context, klb: &KuryrLoadBalancer) -> Result<()> {
    if !klb.spec.has_pod_endpoints() {
        debug!("Ignoring {}: no pod endpoints", object_key(klb));
        return Ok(());
    }
    let Some(status) = klb.status.clone() else {
        // settle on an empty status first; the write triggers the next pass
        return Graph::new(ctx, klb, KuryrLoadBalancerStatus::default())
            .persist()
            .await;
    };

    let mut graph = Graph::new(ctx, klb, status);
    if graph.provider_changed() {
        graph.release_for_provider_change().await?;
    }
    if graph.gone {
        return Ok(());
    }
    let changed = graph.sync().await?;
    if changed && !graph.gone {
        graph.ensure_public_ip().await?;
    }
    Ok(())
}

#[instrument(skip(ctx, klb), fields(name = %klb.name_any(), namespace = klb.namespace()))]
pub async fn on_finalize(ctx: &Context, klb: &KuryrLoadBalancer) -> Result<()> {
    let Some(status) = &klb.status else {
        return Ok(());
    };
    if let Some(lb) = status.loadbalancer.as_ref().filter(|lb| lb.id.is_some()) {
        ctx.drivers.lbaas.release_loadbalancer(lb).await?;
        info!("Released load balancer {}", lb.name);
    }
    if let Some(info) = &status.service_pub_ip_info {
        if !ctx.drivers.pub_ip.release_pub_ip(info).await {
            warn!("Floating IP {} of {} was not freed", info.ip_addr, object_key(klb));
        }
    }
    Ok(())
}
