//! Octavia load balancer driver
//!
//! Every `ensure_*` first waits for the load balancer to be ACTIVE, then
//! creates the resource and falls back to looking it up when Octavia answers
//! 409 or 500 (the resource is already there, or the create went through
//! before an error). Every `release_*` retries while the load balancer is
//! immutable and counts a 404 as success.
//!
//! Names are deterministic so that a lookup finds what an earlier,
//! interrupted pass created: load balancers are `namespace/service`,
//! listeners `lbname:PROTOCOL:port`, pools share their listener's name and
//! members are `namespace/pod:port`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use rand_distr::{Distribution, Normal};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SgMode};
use crate::controller::cluster::ClusterApi;
use crate::controller::sg_rules::build_rule;
use crate::crd::{
    Direction, ListenerInfo, LoadBalancerInfo, LoadBalancerTimeouts, MemberInfo, PoolInfo,
    SecurityGroupRule,
};
use crate::error::{Error, Result};
use crate::openstack::{
    provisioning, LoadBalancerApi, NetworkApi, NewListener, NewLoadBalancer, NewMember, NewPool,
    NewSecurityGroup, Port,
};

/// Poll interval for operations that usually settle within seconds
pub const FAST_INTERVAL: Duration = Duration::from_secs(1);
/// Poll interval used while a load balancer is being built
pub const SLOW_INTERVAL: Duration = Duration::from_secs(3);
const MAX_INTERVAL: Duration = Duration::from_secs(15);

pub const LB_ALGORITHM: &str = "ROUND_ROBIN";

/// Growth factor of the poll interval, `2 * N(0.8, 0.05)`
fn jitter_factor() -> f64 {
    let sample: f64 = Normal::new(0.8, 0.05)
        .map(|normal| normal.sample(&mut rand::thread_rng()))
        .unwrap_or(0.8);
    (2.0 * sample).max(0.0)
}

/// Deadline-bound polling with a jittered, roughly doubling interval.
///
/// The first tick returns at once. Each following tick sleeps
/// `interval * 2 * N(0.8, 0.05)`, capped at 15 seconds and at the time left.
/// A tick yields the time left, or `None` once the deadline has passed.
pub struct ProvisioningTimer {
    deadline: Instant,
    interval: Duration,
    started: bool,
}

impl ProvisioningTimer {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            interval,
            started: false,
        }
    }

    fn leftover(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub async fn tick(&mut self) -> Option<Duration> {
        if self.started {
            self.interval = self
                .interval
                .mul_f64(jitter_factor())
                .min(MAX_INTERVAL)
                .min(self.leftover());
            if !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }
        self.started = true;
        let leftover = self.leftover();
        (!leftover.is_zero()).then_some(leftover)
    }
}

fn record(resource: &str, operation: &str) {
    #[cfg(feature = "metrics")]
    crate::controller::metrics::inc_lbaas_operation(resource, operation);
    #[cfg(not(feature = "metrics"))]
    let _ = (resource, operation);
}

/// Octavia answers 409 when the resource exists and 500 when a create raced
fn create_may_have_happened(error: &Error) -> bool {
    matches!(error, Error::OpenStack { status: 409 | 500, .. })
}

/// Create, or find what an earlier create left behind
async fn ensure<T, C, CF, F, FF>(create: &C, find: &F) -> Result<Option<T>>
where
    C: Fn() -> CF,
    CF: Future<Output = Result<Option<T>>>,
    F: Fn() -> FF,
    FF: Future<Output = Result<Option<T>>>,
{
    match create().await {
        Ok(created) => return Ok(created),
        Err(e) if create_may_have_happened(&e) => {
            debug!("Create failed with {}, looking the resource up", e);
        }
        Err(e) => return Err(e),
    }
    find().await
}

/// Ingress rule on a load balancer security group for one listener port
fn lb_rule(
    security_group_id: &str,
    protocol: &str,
    port: u16,
    remote_ip_prefix: Option<&str>,
    description: &str,
) -> SecurityGroupRule {
    let mut rule = build_rule(
        Direction::Ingress,
        Some(port),
        Some(port),
        Some(protocol),
        remote_ip_prefix,
    );
    rule.security_group_id = Some(security_group_id.to_string());
    rule.description = Some(description.to_string());
    rule
}

/// Open ingress rule not created for a NetworkPolicy
fn is_default_rule(rule: &SecurityGroupRule) -> bool {
    rule.direction == Direction::Ingress
        && rule.remote_ip_prefix.is_none()
        && !rule
            .description
            .as_deref()
            .unwrap_or_default()
            .contains("network-policy")
}

#[async_trait]
pub trait LbaasDriver: Send + Sync {
    /// Create or find the load balancer described by `request`
    async fn ensure_loadbalancer(&self, request: &LoadBalancerInfo) -> Result<LoadBalancerInfo>;
    /// Cascade delete, then drop the load balancer's own security group
    async fn release_loadbalancer(&self, lb: &LoadBalancerInfo) -> Result<()>;

    /// `None` when Octavia rejects the listener, e.g. for an unsupported
    /// protocol. May add a security group to `lb`.
    async fn ensure_listener(
        &self,
        lb: &mut LoadBalancerInfo,
        protocol: &str,
        port: u16,
        timeouts: Option<&LoadBalancerTimeouts>,
    ) -> Result<Option<ListenerInfo>>;
    async fn release_listener(&self, lb: &LoadBalancerInfo, listener: &ListenerInfo)
        -> Result<()>;

    async fn ensure_pool(&self, lb: &LoadBalancerInfo, listener: &ListenerInfo) -> Result<PoolInfo>;
    async fn release_pool(&self, lb: &LoadBalancerInfo, pool: &PoolInfo) -> Result<()>;

    /// `listener_port` is only passed for the first member of a pool; it
    /// triggers copying the pods' policy rules onto the load balancer.
    #[allow(clippy::too_many_arguments)]
    async fn ensure_member(
        &self,
        lb: &LoadBalancerInfo,
        pool: &PoolInfo,
        subnet_id: &str,
        ip: &str,
        port: u16,
        target_namespace: &str,
        target_name: &str,
        listener_port: Option<u16>,
    ) -> Result<MemberInfo>;
    async fn release_member(&self, lb: &LoadBalancerInfo, member: &MemberInfo) -> Result<()>;

    /// Record `security_groups` as the Service's policy groups and mirror
    /// their ingress rules onto the load balancer
    async fn update_lbaas_sg(&self, service: &Service, security_groups: &[String]) -> Result<()>;
}

pub struct OctaviaDriver {
    lbaas: Arc<dyn LoadBalancerApi>,
    network: Arc<dyn NetworkApi>,
    cluster: Arc<dyn ClusterApi>,
    config: Arc<Config>,
    activation_timeout: Duration,
}

impl OctaviaDriver {
    pub fn new(
        lbaas: Arc<dyn LoadBalancerApi>,
        network: Arc<dyn NetworkApi>,
        cluster: Arc<dyn ClusterApi>,
        config: Arc<Config>,
    ) -> Self {
        let activation_timeout = config.activation_timeout();
        Self {
            lbaas,
            network,
            cluster,
            config,
            activation_timeout,
        }
    }

    #[cfg(test)]
    pub fn with_activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = timeout;
        self
    }

    fn tags(&self) -> Vec<String> {
        self.config.neutron_defaults.resource_tags.clone()
    }

    fn lb_id(lb: &LoadBalancerInfo) -> Result<&str> {
        lb.id
            .as_deref()
            .ok_or_else(|| Error::ResourceNotReady(format!("load balancer {} has no id", lb.name)))
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    async fn wait_for_provisioning(
        &self,
        lb_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let mut timer = ProvisioningTimer::new(timeout, interval);
        while let Some(remaining) = timer.tick().await {
            let lb = self.lbaas.get_load_balancer(lb_id).await?;
            match lb.provisioning_status.as_str() {
                provisioning::ACTIVE => {
                    debug!("Provisioning complete for load balancer {}", lb_id);
                    return Ok(());
                }
                provisioning::ERROR => {
                    warn!("Load balancer {} is in ERROR, releasing it", lb_id);
                    match self.lbaas.delete_load_balancer(lb_id, true).await {
                        Err(e) if !e.is_not_found() => return Err(e),
                        _ => break,
                    }
                }
                provisioning::DELETED => break,
                status => debug!(
                    "Provisioning status {} for load balancer {}, {:.3}s remaining",
                    status,
                    lb_id,
                    remaining.as_secs_f64()
                ),
            }
        }
        Err(Error::ResourceNotReady(format!(
            "load balancer {} is not ACTIVE",
            lb_id
        )))
    }

    async fn wait_for_deletion(&self, lb_id: &str, timeout: Duration) {
        let mut timer = ProvisioningTimer::new(timeout, FAST_INTERVAL);
        while timer.tick().await.is_some() {
            if let Err(e) = self.lbaas.get_load_balancer(lb_id).await {
                if e.is_not_found() {
                    return;
                }
            }
        }
    }

    async fn ensure_provisioned<T, C, CF, F, FF>(
        &self,
        lb_id: &str,
        what: &str,
        create: C,
        find: F,
        interval: Duration,
    ) -> Result<T>
    where
        C: Fn() -> CF + Send + Sync,
        CF: Future<Output = Result<Option<T>>> + Send,
        F: Fn() -> FF + Send + Sync,
        FF: Future<Output = Result<Option<T>>> + Send,
        T: Send,
    {
        let mut timer = ProvisioningTimer::new(self.activation_timeout, interval);
        while let Some(remaining) = timer.tick().await {
            self.wait_for_provisioning(lb_id, remaining, interval).await?;
            match ensure(&create, &find).await {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => debug!("{} not found after create, retrying", what),
                Err(e) if e.is_bad_request() => return Err(e),
                Err(e) if e.is_retriable() => debug!("Retrying {} after {}", what, e),
                Err(e) => return Err(e),
            }
        }
        Err(Error::ResourceNotReady(what.to_string()))
    }

    async fn release<D, DF>(&self, lb_id: &str, what: &str, delete: D) -> Result<()>
    where
        D: Fn() -> DF + Send + Sync,
        DF: Future<Output = Result<()>> + Send,
    {
        let mut timer = ProvisioningTimer::new(self.activation_timeout, FAST_INTERVAL);
        while let Some(remaining) = timer.tick().await {
            match delete().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {
                    debug!("{} already deleted", what);
                    return Ok(());
                }
                Err(e) if e.is_conflict() || e.is_bad_request() => {
                    debug!("{} is busy ({}), waiting", what, e);
                    match self
                        .wait_for_provisioning(lb_id, remaining, FAST_INTERVAL)
                        .await
                    {
                        Err(e) if e.is_not_found() => return Ok(()),
                        Err(e) => return Err(e),
                        Ok(()) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::ResourceNotReady(format!("release of {}", what)))
    }

    // =========================================================================
    // Security Groups
    // =========================================================================

    async fn vip_port(&self, lb: &LoadBalancerInfo) -> Result<Option<Port>> {
        let Some(port_id) = lb.port_id.as_deref() else {
            return Ok(None);
        };
        match self.network.get_port(port_id).await {
            Ok(port) => Ok(Some(port)),
            Err(e) if e.is_not_found() => {
                warn!("VIP port {} of {} not found", port_id, lb.name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The load balancer's own security group. With `lb_name` the lookup is
    /// by name only, otherwise the group must also be recorded on `lb`.
    async fn find_listeners_sg(
        &self,
        lb: &LoadBalancerInfo,
        lb_name: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(name) = lb_name {
            let sgs = self
                .network
                .list_security_groups(&[("name", name), ("project_id", &lb.project_id)])
                .await?;
            if sgs.is_empty() {
                debug!("Security group for {} not created yet", name);
            }
            return Ok(sgs.into_iter().next().map(|sg| sg.id));
        }

        match self
            .network
            .list_security_groups(&[("name", &lb.name), ("project_id", &lb.project_id)])
            .await
        {
            Ok(sgs) => Ok(sgs
                .into_iter()
                .map(|sg| sg.id)
                .find(|id| lb.security_groups.contains(id))),
            Err(e) => {
                error!("Cannot list security groups for load balancer {}: {}", lb.name, e);
                Ok(None)
            }
        }
    }

    /// Security group holding the listener rules of `lb`
    async fn listener_rules_sg(&self, lb: &LoadBalancerInfo) -> Result<Option<String>> {
        match self.config.octavia_defaults.sg_mode {
            SgMode::Create => self.find_listeners_sg(lb, None).await,
            SgMode::Allocate => Ok(self
                .vip_port(lb)
                .await?
                .and_then(|port| port.security_groups.into_iter().next())),
        }
    }

    async fn create_rule_ignoring_conflict(&self, rule: &SecurityGroupRule, owner: &str) {
        match self.network.create_security_group_rule(rule).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() && !e.is_quota_exceeded() => {
                debug!("Rule {} for {} already exists", rule, owner)
            }
            Err(e) => error!("Failed to create security group rule for {}: {}", owner, e),
        }
    }

    async fn delete_rule(&self, rule: &SecurityGroupRule) -> Result<()> {
        let Some(id) = rule.id.as_deref() else {
            return Ok(());
        };
        debug!("Deleting load balancer rule {}", id);
        match self.network.delete_security_group_rule(id).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    async fn create_lb_security_group_rule(
        &self,
        lb: &mut LoadBalancerInfo,
        listener: &ListenerInfo,
    ) -> Result<()> {
        let sg_id = match self.find_listeners_sg(lb, None).await? {
            Some(id) => id,
            None => {
                let sg = self
                    .network
                    .create_security_group(&NewSecurityGroup {
                        name: lb.name.clone(),
                        project_id: lb.project_id.clone(),
                        description: String::new(),
                    })
                    .await?;
                let tags = self.tags();
                if !tags.is_empty() {
                    self.network
                        .add_tags("security-groups", &sg.id, &tags)
                        .await?;
                }
                info!("Created security group {} for load balancer {}", sg.id, lb.name);
                lb.security_groups.push(sg.id.clone());
                if let Some(port_id) = lb.port_id.as_deref() {
                    self.network
                        .update_port_security_groups(port_id, &[sg.id.clone()])
                        .await?;
                }
                sg.id
            }
        };

        let rule = lb_rule(&sg_id, &listener.protocol, listener.port, None, &listener.name);
        self.create_rule_ignoring_conflict(&rule, &listener.name)
            .await;
        Ok(())
    }

    /// Mirror the ingress rules of the pods' policy groups onto the load
    /// balancer group, for the listener on `port`.
    ///
    /// Rules are copied when their protocol matches and their port range
    /// admits `target_port`. Listener rules whose remote prefix no longer
    /// matches a copied rule are removed. When the pods only carry default
    /// groups, the open listener rule is restored instead.
    pub async fn apply_members_security_groups(
        &self,
        lb: &LoadBalancerInfo,
        port: u16,
        target_port: Option<u16>,
        protocol: &str,
        sg_rule_name: &str,
        new_sgs: Option<&[String]>,
    ) -> Result<()> {
        debug!("Applying member security groups to {}", lb.name);
        let lb_sg = match self.config.octavia_defaults.sg_mode {
            SgMode::Create => {
                let lb_name = new_sgs
                    .map(|_| sg_rule_name.split(':').next().unwrap_or(sg_rule_name));
                self.find_listeners_sg(lb, lb_name).await?
            }
            SgMode::Allocate => self
                .vip_port(lb)
                .await?
                .and_then(|p| p.security_groups.into_iter().next()),
        };
        // Members can be added before the listener group exists
        let Some(lb_sg) = lb_sg else {
            return Ok(());
        };

        let lb_rules = self.network.list_security_group_rules(&lb_sg).await?;
        let protocol_lc = protocol.to_lowercase();
        let defaults = &self.config.neutron_defaults.pod_security_groups;
        let mut pod_rules: Vec<SecurityGroupRule> = Vec::new();
        let mut add_default_rules = false;

        let sgs = new_sgs.unwrap_or(&lb.security_groups);
        for sg in sgs.iter().filter(|sg| **sg != lb_sg) {
            if defaults.contains(sg) {
                add_default_rules = true;
                break;
            }
            for rule in self.network.list_security_group_rules(sg).await? {
                if rule.direction != Direction::Ingress
                    || rule.protocol.as_deref() != Some(protocol_lc.as_str())
                {
                    continue;
                }
                if let Some(min) = rule.port_range_min {
                    let max = rule.port_range_max.unwrap_or(min);
                    if !target_port.is_some_and(|t| (min..=max).contains(&t)) {
                        continue;
                    }
                }
                let copy = lb_rule(
                    &lb_sg,
                    protocol,
                    port,
                    rule.remote_ip_prefix.as_deref(),
                    sg_rule_name,
                );
                pod_rules.push(rule);
                self.create_rule_ignoring_conflict(&copy, sg_rule_name).await;
            }
        }

        for rule in &lb_rules {
            let for_listener = rule.direction == Direction::Ingress
                && rule.protocol.as_deref() == Some(protocol_lc.as_str())
                && rule.port_range_min == Some(port);
            if !for_listener {
                if !pod_rules.is_empty() && is_default_rule(rule) {
                    debug!("Removing default rule from {}", lb_sg);
                    self.delete_rule(rule).await?;
                }
                continue;
            }
            if !pod_rules
                .iter()
                .any(|p| p.remote_ip_prefix == rule.remote_ip_prefix)
            {
                self.delete_rule(rule).await?;
            }
        }

        if add_default_rules {
            debug!("Restoring default rule on {}", lb_sg);
            let rule = lb_rule(&lb_sg, protocol, port, None, sg_rule_name);
            self.create_rule_ignoring_conflict(&rule, sg_rule_name).await;
        }
        Ok(())
    }

    // =========================================================================
    // Create / Find
    // =========================================================================

    async fn create_loadbalancer(&self, lb: &LoadBalancerInfo) -> Result<Option<LoadBalancerInfo>> {
        let created = self
            .lbaas
            .create_load_balancer(&NewLoadBalancer {
                name: lb.name.clone(),
                project_id: lb.project_id.clone(),
                vip_address: lb.ip.clone(),
                vip_subnet_id: lb.subnet_id.clone(),
                provider: lb.provider.clone(),
                tags: self.tags(),
            })
            .await?;
        record("loadbalancer", "create");

        let mut result = lb.clone();
        result.id = Some(created.id);
        result.port_id = created.vip_port_id;
        if let Some(requested) = lb.provider.as_deref() {
            if created.provider.as_deref() != Some(requested) {
                error!(
                    "Requested provider {} but Octavia created the load balancer with {:?}",
                    requested, created.provider
                );
                return Ok(None);
            }
        }
        result.provider = created.provider;
        Ok(Some(result))
    }

    async fn find_loadbalancer(&self, lb: &LoadBalancerInfo) -> Result<Option<LoadBalancerInfo>> {
        let found = self
            .lbaas
            .list_load_balancers(&[
                ("name", &lb.name),
                ("project_id", &lb.project_id),
                ("vip_address", &lb.ip),
                ("vip_subnet_id", &lb.subnet_id),
            ])
            .await?;
        let Some(existing) = found.into_iter().next() else {
            return Ok(None);
        };

        let mut result = lb.clone();
        result.id = Some(existing.id);
        result.port_id = existing.vip_port_id;
        result.provider = existing.provider;
        if existing.provisioning_status == provisioning::ERROR {
            warn!("Found load balancer {} in ERROR, releasing it", lb.name);
            self.release_loadbalancer(&result).await?;
            return Ok(None);
        }
        Ok(Some(result))
    }

    async fn create_listener(&self, listener: &ListenerInfo) -> Result<Option<ListenerInfo>> {
        let created = self
            .lbaas
            .create_listener(&NewListener {
                name: listener.name.clone(),
                project_id: listener.project_id.clone(),
                loadbalancer_id: listener.loadbalancer_id.clone(),
                protocol: listener.protocol.clone(),
                protocol_port: listener.port,
                timeout_client_data: listener.timeout_client_data,
                timeout_member_data: listener.timeout_member_data,
                tags: self.tags(),
            })
            .await?;
        record("listener", "create");
        Ok(Some(ListenerInfo {
            id: Some(created.id),
            ..listener.clone()
        }))
    }

    async fn find_listener(&self, listener: &ListenerInfo) -> Result<Option<ListenerInfo>> {
        let port = listener.port.to_string();
        let found = self
            .lbaas
            .list_listeners(&[
                ("name", &listener.name),
                ("project_id", &listener.project_id),
                ("loadbalancer_id", &listener.loadbalancer_id),
                ("protocol", &listener.protocol),
                ("protocol_port", &port),
            ])
            .await?;
        Ok(found.into_iter().next().map(|l| ListenerInfo {
            id: Some(l.id),
            ..listener.clone()
        }))
    }

    async fn create_pool(&self, pool: &PoolInfo) -> Result<Option<PoolInfo>> {
        let created = self
            .lbaas
            .create_pool(&NewPool {
                name: pool.name.clone(),
                project_id: pool.project_id.clone(),
                listener_id: pool.listener_id.clone(),
                protocol: pool.protocol.clone(),
                lb_algorithm: LB_ALGORITHM.to_string(),
                tags: self.tags(),
            })
            .await?;
        record("pool", "create");
        Ok(Some(PoolInfo {
            id: Some(created.id),
            ..pool.clone()
        }))
    }

    async fn find_pool(&self, pool: &PoolInfo) -> Result<Option<PoolInfo>> {
        let found = self
            .lbaas
            .list_pools(&[
                ("name", &pool.name),
                ("project_id", &pool.project_id),
                ("loadbalancer_id", &pool.loadbalancer_id),
                ("protocol", &pool.protocol),
            ])
            .await?;
        Ok(found
            .into_iter()
            .find(|p| p.listeners.iter().any(|l| l.id == pool.listener_id))
            .map(|p| PoolInfo {
                id: Some(p.id),
                ..pool.clone()
            }))
    }

    async fn create_member(&self, member: &MemberInfo) -> Result<Option<MemberInfo>> {
        let created = self
            .lbaas
            .create_member(
                &member.pool_id,
                &NewMember {
                    name: member.name.clone(),
                    project_id: member.project_id.clone(),
                    subnet_id: member.subnet_id.clone(),
                    address: member.ip.clone(),
                    protocol_port: member.port,
                    tags: self.tags(),
                },
            )
            .await?;
        record("member", "create");
        Ok(Some(MemberInfo {
            id: Some(created.id),
            ..member.clone()
        }))
    }

    async fn find_member(&self, member: &MemberInfo) -> Result<Option<MemberInfo>> {
        let port = member.port.to_string();
        let found = self
            .lbaas
            .list_members(
                &member.pool_id,
                &[
                    ("name", &member.name),
                    ("project_id", &member.project_id),
                    ("subnet_id", &member.subnet_id),
                    ("address", &member.ip),
                    ("protocol_port", &port),
                ],
            )
            .await?;
        Ok(found.into_iter().next().map(|m| MemberInfo {
            id: Some(m.id),
            ..member.clone()
        }))
    }
}

#[async_trait]
impl LbaasDriver for OctaviaDriver {
    async fn ensure_loadbalancer(&self, request: &LoadBalancerInfo) -> Result<LoadBalancerInfo> {
        let created = ensure(
            &|| self.create_loadbalancer(request),
            &|| self.find_loadbalancer(request),
        )
        .await?;
        // Deleted between create and find, or found in ERROR and released
        created.ok_or_else(|| Error::ResourceNotReady(format!("load balancer {}", request.name)))
    }

    async fn release_loadbalancer(&self, lb: &LoadBalancerInfo) -> Result<()> {
        let lb_id = Self::lb_id(lb)?;
        self.release(lb_id, &format!("load balancer {}", lb.name), || {
            self.lbaas.delete_load_balancer(lb_id, true)
        })
        .await?;
        record("loadbalancer", "delete");

        if let Some(sg_id) = self.find_listeners_sg(lb, None).await? {
            self.wait_for_deletion(lb_id, self.activation_timeout).await;
            match self.network.delete_security_group(&sg_id).await {
                Ok(()) => info!("Deleted security group {} of {}", sg_id, lb.name),
                Err(e) if e.is_not_found() => {
                    debug!("Security group {} already deleted", sg_id)
                }
                Err(e) => error!(
                    "Failed to delete security group {} of load balancer {}, leaving it orphaned: {}",
                    sg_id, lb.name, e
                ),
            }
        }
        Ok(())
    }

    async fn ensure_listener(
        &self,
        lb: &mut LoadBalancerInfo,
        protocol: &str,
        port: u16,
        timeouts: Option<&LoadBalancerTimeouts>,
    ) -> Result<Option<ListenerInfo>> {
        let lb_id = Self::lb_id(lb)?.to_string();
        let request = ListenerInfo {
            id: None,
            name: format!("{}:{}:{}", lb.name, protocol, port),
            project_id: lb.project_id.clone(),
            loadbalancer_id: lb_id.clone(),
            protocol: protocol.to_string(),
            port,
            timeout_client_data: timeouts.and_then(|t| t.timeout_client_data),
            timeout_member_data: timeouts.and_then(|t| t.timeout_member_data),
        };
        let listener = match self
            .ensure_provisioned(
                &lb_id,
                &format!("listener {}", request.name),
                || self.create_listener(&request),
                || self.find_listener(&request),
                SLOW_INTERVAL,
            )
            .await
        {
            Ok(listener) => listener,
            Err(e) if e.is_bad_request() => {
                info!(
                    "Listener {} rejected, most probably protocol {} is not supported: {}",
                    request.name, protocol, e
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if self.config.octavia_defaults.sg_mode == SgMode::Create {
            self.create_lb_security_group_rule(lb, &listener).await?;
        }
        Ok(Some(listener))
    }

    async fn release_listener(
        &self,
        lb: &LoadBalancerInfo,
        listener: &ListenerInfo,
    ) -> Result<()> {
        let lb_id = Self::lb_id(lb)?;
        if let Some(id) = listener.id.as_deref() {
            self.release(lb_id, &format!("listener {}", listener.name), || {
                self.lbaas.delete_listener(id)
            })
            .await?;
            record("listener", "delete");
        }

        let Some(sg_id) = self.listener_rules_sg(lb).await? else {
            return Ok(());
        };
        let rules = self.network.list_security_group_rules(&sg_id).await?;
        match rules
            .iter()
            .find(|r| r.description.as_deref() == Some(listener.name.as_str()))
        {
            Some(rule) => self.delete_rule(rule).await?,
            None => warn!(
                "Cannot find the security group rule of listener {}",
                listener.name
            ),
        }
        Ok(())
    }

    async fn ensure_pool(&self, lb: &LoadBalancerInfo, listener: &ListenerInfo) -> Result<PoolInfo> {
        let lb_id = Self::lb_id(lb)?;
        let request = PoolInfo {
            id: None,
            name: listener.name.clone(),
            project_id: lb.project_id.clone(),
            loadbalancer_id: lb_id.to_string(),
            listener_id: listener.id.clone().unwrap_or_default(),
            protocol: listener.protocol.clone(),
        };
        self.ensure_provisioned(
            lb_id,
            &format!("pool {}", request.name),
            || self.create_pool(&request),
            || self.find_pool(&request),
            FAST_INTERVAL,
        )
        .await
    }

    async fn release_pool(&self, lb: &LoadBalancerInfo, pool: &PoolInfo) -> Result<()> {
        let lb_id = Self::lb_id(lb)?;
        let Some(id) = pool.id.as_deref() else {
            return Ok(());
        };
        self.release(lb_id, &format!("pool {}", pool.name), || {
            self.lbaas.delete_pool(id)
        })
        .await?;
        record("pool", "delete");
        Ok(())
    }

    async fn ensure_member(
        &self,
        lb: &LoadBalancerInfo,
        pool: &PoolInfo,
        subnet_id: &str,
        ip: &str,
        port: u16,
        target_namespace: &str,
        target_name: &str,
        listener_port: Option<u16>,
    ) -> Result<MemberInfo> {
        let lb_id = Self::lb_id(lb)?;
        let request = MemberInfo {
            id: None,
            name: format!("{}/{}:{}", target_namespace, target_name, port),
            project_id: lb.project_id.clone(),
            pool_id: pool.id.clone().unwrap_or_default(),
            subnet_id: subnet_id.to_string(),
            ip: ip.to_string(),
            port,
        };
        let member = self
            .ensure_provisioned(
                lb_id,
                &format!("member {}", request.name),
                || self.create_member(&request),
                || self.find_member(&request),
                FAST_INTERVAL,
            )
            .await?;

        let policy_enforced = self.config.kubernetes.handler_enabled("policy")
            && self.config.enforces_service_policies();
        if let (true, Some(listener_port)) = (policy_enforced, listener_port) {
            self.apply_members_security_groups(
                lb,
                listener_port,
                Some(port),
                &pool.protocol,
                &pool.name,
                None,
            )
            .await?;
        }
        Ok(member)
    }

    async fn release_member(&self, lb: &LoadBalancerInfo, member: &MemberInfo) -> Result<()> {
        let lb_id = Self::lb_id(lb)?;
        let Some(id) = member.id.as_deref() else {
            return Ok(());
        };
        self.release(lb_id, &format!("member {}", member.name), || {
            self.lbaas.delete_member(&member.pool_id, id)
        })
        .await?;
        record("member", "delete");
        Ok(())
    }

    async fn update_lbaas_sg(&self, service: &Service, security_groups: &[String]) -> Result<()> {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        debug!("Setting security groups of load balancer {}/{}", namespace, name);

        let klb = match self.cluster.get_kuryr_load_balancer(&namespace, &name).await {
            Ok(klb) => klb,
            Err(e) if e.is_not_found() => {
                debug!("Service {}/{} has no KuryrLoadBalancer", namespace, name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut status = klb.status.unwrap_or_default();
        let Some(lb) = status.loadbalancer.as_mut() else {
            return Err(Error::ResourceNotReady(format!(
                "load balancer of {}/{} is still being created",
                namespace, name
            )));
        };
        lb.security_groups = security_groups.to_vec();
        let lb = lb.clone();
        self.cluster
            .patch_klb_status(&namespace, &name, &status)
            .await?;

        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.clone())
            .unwrap_or_default();
        for svc_port in ports {
            let Ok(port) = u16::try_from(svc_port.port) else {
                continue;
            };
            let protocol = svc_port.protocol.as_deref().unwrap_or("TCP");
            let target_port = match svc_port.target_port {
                Some(IntOrString::Int(p)) => u16::try_from(p).ok(),
                Some(IntOrString::String(_)) => None,
                None => Some(port),
            };
            let sg_rule_name = format!("{}/{}:{}:{}", namespace, name, protocol, port);
            self.apply_members_security_groups(
                &lb,
                port,
                target_port,
                protocol,
                &sg_rule_name,
                Some(security_groups),
            )
            .await?;
        }
        Ok(())
    }
}
