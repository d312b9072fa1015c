//! KuryrNetworkPolicy controller
//!
//! Owns the Neutron security group of one NetworkPolicy. A pass creates the
//! group when the status has none, brings its rules in line with `spec`,
//! then pushes the new group membership to the ports of the affected pods
//! and, when Services enforce policies, to their load balancers. Finalizing
//! reverses all of it and releases the NetworkPolicy.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::drivers::security_groups::service_selector;
use super::sg_reconciler::RuleLedger;
use super::{object_key, selector, Context, ControllerState, EventType};
use crate::crd::{
    KuryrNetworkPolicy, KuryrNetworkPolicyStatus, SecurityGroupRule, NETWORK_POLICY_FINALIZER,
};
use crate::error::{Error, Result};
use crate::openstack::NewSecurityGroup;

const CONTROLLER: &str = "kuryrnetworkpolicy";

pub async fn run(state: Arc<ControllerState>) -> Result<()> {
    let knps: Api<KuryrNetworkPolicy> = Api::all(state.client.clone());

    if let Err(e) = knps.list(&ListParams::default().limit(1)).await {
        error!(
            "KuryrNetworkPolicy CRD not found. Please install the CRD first: {:?}",
            e
        );
        return Err(Error::ConfigError(
            "KuryrNetworkPolicy CRD not installed".to_string(),
        ));
    }
    info!("Starting KuryrNetworkPolicy controller");

    Controller::new(knps, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled KuryrNetworkPolicy {}", obj),
                Err(e) => warn!("KuryrNetworkPolicy reconcile failed: {}", e),
            }
        })
        .await;
    Ok(())
}

#[instrument(skip(state), fields(name = %knp.name_any(), namespace = knp.namespace()))]
async fn reconcile(knp: Arc<KuryrNetworkPolicy>, state: Arc<ControllerState>) -> Result<Action> {
    let key = object_key(knp.as_ref());
    if let Some(action) = state.standby(CONTROLLER, &key) {
        return Ok(action);
    }
    let started = Instant::now();
    let namespace = knp.namespace().unwrap_or_default();
    let api: Api<KuryrNetworkPolicy> = Api::namespaced(state.client.clone(), &namespace);
    let ctx = &state.ctx;

    let result = finalizer(&api, NETWORK_POLICY_FINALIZER, knp, |event| async move {
        let pass = match event {
            FinalizerEvent::Apply(knp) => on_present(ctx, &knp).await,
            FinalizerEvent::Cleanup(knp) => on_finalize(ctx, &knp).await,
        };
        pass.map(|()| Action::await_change())
    })
    .await
    .map_err(Error::from);

    state.finish(CONTROLLER, &key, started, result.map(|_| ()))
}

fn error_policy(knp: Arc<KuryrNetworkPolicy>, error: &Error, state: Arc<ControllerState>) -> Action {
    state.error_action(CONTROLLER, &object_key(knp.as_ref()), error)
}

/// Namespace and name of the NetworkPolicy behind `knp`
fn policy_name(knp: &KuryrNetworkPolicy) -> (String, String) {
    knp.network_policy_link()
        .and_then(|link| link.split_once('/'))
        .map(|(ns, name)| (ns.to_string(), name.to_string()))
        .unwrap_or_else(|| (knp.namespace().unwrap_or_default(), knp.name_any()))
}

/// Events about a KuryrNetworkPolicy are attached to its NetworkPolicy
fn policy_reference(knp: &KuryrNetworkPolicy) -> ObjectReference {
    let (namespace, name) = policy_name(knp);
    ObjectReference {
        api_version: Some("networking.k8s.io/v1".to_string()),
        kind: Some("NetworkPolicy".to_string()),
        namespace: Some(namespace),
        name: Some(name),
        ..Default::default()
    }
}

async fn get_policy(ctx: &Context, knp: &KuryrNetworkPolicy) -> Result<Option<NetworkPolicy>> {
    let (namespace, name) = policy_name(knp);
    match ctx.cluster.get_network_policy(&namespace, &name).await {
        Ok(np) => Ok(Some(np)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write `status`. A vanished resource is not an error; any other failure
/// is reported on the NetworkPolicy.
async fn patch_status(
    ctx: &Context,
    knp: &KuryrNetworkPolicy,
    status: &KuryrNetworkPolicyStatus,
) -> Result<()> {
    let namespace = knp.namespace().unwrap_or_default();
    let name = knp.name_any();
    match ctx.cluster.patch_knp_status(&namespace, &name, status).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!("KuryrNetworkPolicy {}/{} not found", namespace, name);
            Ok(())
        }
        Err(e) => {
            error!("Error updating KuryrNetworkPolicy {}/{}: {}", namespace, name, e);
            ctx.emit_event(
                &policy_reference(knp),
                EventType::Warning,
                "FailedToPatchKuryrNetworkPolicy",
                &format!("Failed to update KuryrNetworkPolicy: {}", e),
            )
            .await;
            Err(e)
        }
    }
}

/// Persists the rule list to the status after every cloud mutation
struct StatusLedger<'a> {
    ctx: &'a Context,
    knp: &'a KuryrNetworkPolicy,
    status: &'a mut KuryrNetworkPolicyStatus,
}

#[async_trait]
impl RuleLedger for StatusLedger<'_> {
    async fn persist(&mut self, rules: &[SecurityGroupRule]) -> Result<()> {
        self.status.security_group_rules = rules.to_vec();
        patch_status(self.ctx, self.knp, self.status).await
    }
}

async fn create_security_group(
    ctx: &Context,
    knp: &KuryrNetworkPolicy,
    project_id: &str,
) -> Result<String> {
    let namespace = knp.namespace().unwrap_or_default();
    let name = knp.name_any();
    let sg = ctx
        .network
        .create_security_group(&NewSecurityGroup {
            name: format!("sg-{}-{}", namespace, name),
            project_id: project_id.to_string(),
            description: format!(
                "Kuryr-Kubernetes Network Policy {}/{} SG",
                namespace, name
            ),
        })
        .await?;

    let tags = &ctx.config.neutron_defaults.resource_tags;
    if !tags.is_empty() {
        if let Err(e) = ctx.network.add_tags("security-groups", &sg.id, tags).await {
            rollback_security_group(ctx, &sg.id).await;
            return Err(e);
        }
    }
    Ok(sg.id)
}

async fn rollback_security_group(ctx: &Context, sg_id: &str) {
    if let Err(e) = ctx.network.delete_security_group(sg_id).await {
        if !e.is_not_found() {
            error!("Failed to roll back security group {}: {}", sg_id, e);
        }
    }
}

fn is_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false)
}

fn is_scheduled(pod: &Pod) -> bool {
    pod.spec.as_ref().and_then(|s| s.node_name.as_ref()).is_some()
}

/// Pods whose ports carry Neutron security groups
fn has_managed_port(pod: &Pod) -> bool {
    !is_host_network(pod) && is_scheduled(pod)
}

async fn selected_pods(ctx: &Context, namespace: &str, sel: &LabelSelector) -> Result<Vec<Pod>> {
    ctx.cluster.list_pods(Some(namespace), Some(sel)).await
}

fn push_unique_pods(pods: &mut Vec<Pod>, seen: &mut BTreeSet<String>, more: Vec<Pod>) {
    for pod in more {
        if seen.insert(object_key(&pod)) {
            pods.push(pod);
        }
    }
}

/// Pods whose group membership may have changed in this pass
async fn pods_to_update(
    ctx: &Context,
    knp: &KuryrNetworkPolicy,
    previous: Option<&LabelSelector>,
) -> Result<Vec<Pod>> {
    let namespace = knp.namespace().unwrap_or_default();
    let current = &knp.spec.pod_selector;
    let mut pods = Vec::new();
    let mut seen = BTreeSet::new();

    match previous {
        // never applied: every pod of the namespace
        None => {
            let all = ctx.cluster.list_pods(Some(&namespace), None).await?;
            push_unique_pods(&mut pods, &mut seen, all);
        }
        Some(prev) if prev != current || selector::is_empty(prev) => {
            let old = selected_pods(ctx, &namespace, prev).await?;
            push_unique_pods(&mut pods, &mut seen, old);
        }
        Some(_) => {}
    }
    let matched = selected_pods(ctx, &namespace, current).await?;
    push_unique_pods(&mut pods, &mut seen, matched);
    Ok(pods)
}

async fn update_pod_sgs(ctx: &Context, pod: &Pod, security_groups: &[String]) -> Result<()> {
    match ctx.drivers.vif_pool.update_vif_sgs(pod, security_groups).await {
        // the pod went away in the meantime
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn default_pod_sgs(ctx: &Context) -> Result<Vec<String>> {
    let defaults = &ctx.config.neutron_defaults.pod_security_groups;
    if defaults.is_empty() {
        return Err(Error::ConfigError(
            "neutron_defaults.pod_security_groups is not set".to_string(),
        ));
    }
    Ok(defaults.clone())
}

/// Re-apply the policy groups of every Service in `namespace` selecting one
/// of `pods`. With `removed_sg`, that group is dropped from the result.
async fn update_services(
    ctx: &Context,
    namespace: &str,
    project_id: &str,
    pods: &[Pod],
    removed_sg: Option<&str>,
) -> Result<()> {
    let affected: BTreeSet<String> = pods.iter().map(object_key).collect();
    for service in ctx.cluster.list_services(Some(namespace)).await? {
        if service.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(sel) = service_selector(&service) else {
            continue;
        };
        let backing = selected_pods(ctx, namespace, &sel).await?;
        if !backing.iter().any(|p| affected.contains(&object_key(p))) {
            continue;
        }

        let mut sgs = ctx
            .drivers
            .service_sg
            .get_security_groups(&service, project_id)
            .await?;
        if let Some(removed) = removed_sg {
            sgs.retain(|sg| sg != removed);
        }
        match ctx.drivers.lbaas.update_lbaas_sg(&service, &sgs).await {
            Err(Error::ResourceNotReady(reason)) => {
                // picked up when its members are created
                debug!("Skipping Service {}: {}", service.name_any(), reason);
            }
            other => other?,
        }
    }
    Ok(())
}

fn policy_applies_to_services(ctx: &Context, policy: Option<&NetworkPolicy>) -> bool {
    let egress_only = policy
        .and_then(|np| np.spec.as_ref())
        .is_some_and(selector::is_egress_only);
    ctx.config.enforces_service_policies() && !egress_only
}

#[instrument(skip(ctx, knp), fields(name = %knp.name_any(), namespace = knp.namespace()))]
pub async fn on_present(ctx: &Context, knp: &KuryrNetworkPolicy) -> Result<()> {
    let namespace = knp.namespace().unwrap_or_default();
    let key = object_key(knp);
    let project_id = ctx.drivers.project.get_project(&namespace).await?;
    let mut status = knp.status.clone().unwrap_or_default();

    let sg_id = match status.security_group_id.clone() {
        Some(id) => id,
        None => {
            debug!("Creating security group for {}", key);
            let id = create_security_group(ctx, knp, &project_id).await?;
            status.security_group_id = Some(id.clone());
            if let Err(e) = patch_status(ctx, knp, &status).await {
                rollback_security_group(ctx, &id).await;
                return Err(e);
            }
            info!("Created security group {} for {}", id, key);
            id
        }
    };

    let desired: Vec<SecurityGroupRule> = knp.spec.sg_rules().cloned().collect();
    let current = std::mem::take(&mut status.security_group_rules);
    let previous_selector = status.pod_selector.clone();
    let mut ledger = StatusLedger {
        ctx,
        knp,
        status: &mut status,
    };
    let applied = match ctx
        .sg_reconciler
        .reconcile(&sg_id, current, &desired, &mut ledger)
        .await
    {
        Ok(applied) => applied,
        Err(e) => {
            ctx.emit_event(
                &policy_reference(knp),
                EventType::Warning,
                "FailedToUpdateSecurityGroupRules",
                &format!("Updating rules of security group {} failed: {}", sg_id, e),
            )
            .await;
            return Err(e);
        }
    };
    status.security_group_rules = applied;

    let pods = pods_to_update(ctx, knp, previous_selector.as_ref()).await?;
    for pod in pods.iter().filter(|p| has_managed_port(p)) {
        let sgs = ctx
            .drivers
            .pod_sg
            .get_security_groups(pod, &project_id)
            .await?;
        update_pod_sgs(ctx, pod, &sgs).await?;
    }

    if !pods.is_empty() {
        let policy = get_policy(ctx, knp).await?;
        if policy_applies_to_services(ctx, policy.as_ref()) {
            update_services(ctx, &namespace, &project_id, &pods, None).await?;
        }
    }

    status.pod_selector = Some(knp.spec.pod_selector.clone());
    patch_status(ctx, knp, &status).await
}

#[instrument(skip(ctx, knp), fields(name = %knp.name_any(), namespace = knp.namespace()))]
pub async fn on_finalize(ctx: &Context, knp: &KuryrNetworkPolicy) -> Result<()> {
    let namespace = knp.namespace().unwrap_or_default();
    let key = object_key(knp);
    debug!("Finalizing KuryrNetworkPolicy {}", key);
    let project_id = ctx.drivers.project.get_project(&namespace).await?;
    let policy = get_policy(ctx, knp).await?;

    if let Some(sg_id) = knp.security_group_id() {
        let pods = selected_pods(ctx, &namespace, &knp.spec.pod_selector).await?;
        for pod in pods.iter().filter(|p| has_managed_port(p)) {
            let mut sgs = ctx
                .drivers
                .pod_sg
                .get_security_groups(pod, &project_id)
                .await?;
            sgs.retain(|sg| sg != sg_id);
            if sgs.is_empty() {
                sgs = default_pod_sgs(ctx)?;
            }
            update_pod_sgs(ctx, pod, &sgs).await?;
        }

        match ctx.cluster.get_kuryr_network(&namespace).await {
            Ok(network) => {
                if let Some(net_id) = network.status.and_then(|s| s.net_id) {
                    ctx.drivers
                        .vif_pool
                        .remove_sg_from_pools(sg_id, &net_id)
                        .await?;
                }
            }
            Err(e) if e.is_not_found() => {
                debug!("KuryrNetwork of {} already removed", namespace)
            }
            Err(e) => return Err(e),
        }

        let rules = knp
            .status
            .as_ref()
            .map(|s| s.security_group_rules.as_slice())
            .unwrap_or_default();
        for id in rules.iter().filter_map(|r| r.id.as_deref()) {
            ctx.sg_reconciler.delete_rule(id).await?;
        }

        match ctx.network.delete_security_group(sg_id).await {
            Ok(()) => info!("Deleted security group {} of {}", sg_id, key),
            Err(e) if e.is_not_found() => debug!("Security group {} already deleted", sg_id),
            Err(e) if e.is_conflict() => {
                return Err(Error::ResourceNotReady(format!(
                    "security group {} is still in use",
                    sg_id
                )))
            }
            Err(e) => {
                ctx.emit_event(
                    &policy_reference(knp),
                    EventType::Warning,
                    "FailedToRemoveSecurityGroup",
                    &format!(
                        "Deleting security group for corresponding Network Policy has failed: {}",
                        e
                    ),
                )
                .await;
                return Err(e);
            }
        }

        if policy.is_some() && policy_applies_to_services(ctx, policy.as_ref()) {
            update_services(ctx, &namespace, &project_id, &pods, Some(sg_id)).await?;
        }
    }

    if policy.is_some() {
        let (np_namespace, np_name) = policy_name(knp);
        debug!("Releasing NetworkPolicy {}/{}", np_namespace, np_name);
        match ctx
            .cluster
            .remove_network_policy_finalizer(&np_namespace, &np_name)
            .await
        {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }
    }
    Ok(())
}
