//! NetworkPolicy controller
//!
//! Translates each NetworkPolicy into a same-named KuryrNetworkPolicy and
//! links the two through annotations. The security group itself is owned by
//! the KuryrNetworkPolicy controller; deleting a policy only deletes the
//! derived resource, whose finalization releases the policy.
//!
//! Pod and Namespace changes re-trigger the policies whose peers may select
//! them, since the translated rules embed pod IPs and namespace CIDRs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPeer};
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::{finalizers, object_key, Context, ControllerState};
use crate::crd::{
    KuryrNetworkPolicy, KNP_LINK_ANNOTATION, NETWORK_POLICY_FINALIZER,
    NETWORK_POLICY_LINK_ANNOTATION,
};
use crate::error::{Error, Result};

const CONTROLLER: &str = "policy";

pub async fn run(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let policies: Api<NetworkPolicy> = Api::all(client.clone());

    if let Err(e) = policies.list(&ListParams::default().limit(1)).await {
        error!("Cannot list NetworkPolicies: {:?}", e);
        return Err(Error::KubeError(e));
    }
    info!("Starting NetworkPolicy controller");

    let controller = Controller::new(policies, watcher::Config::default());
    let pod_store = controller.store();
    let namespace_store = controller.store();

    controller
        .watches(
            Api::<Pod>::all(client.clone()),
            watcher::Config::default(),
            move |pod: Pod| {
                let namespace = pod.namespace().unwrap_or_default();
                policies_selecting(&pod_store, Some(&namespace))
            },
        )
        .watches(
            Api::<Namespace>::all(client),
            watcher::Config::default(),
            move |_: Namespace| policies_selecting(&namespace_store, None),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled NetworkPolicy {}", obj),
                Err(e) => warn!("NetworkPolicy reconcile failed: {}", e),
            }
        })
        .await;
    Ok(())
}

fn has_namespace_peer(policy: &NetworkPolicy) -> bool {
    let Some(spec) = &policy.spec else {
        return false;
    };
    let uses_selector = |peers: Option<&Vec<NetworkPolicyPeer>>| {
        peers
            .into_iter()
            .flatten()
            .any(|p| p.namespace_selector.is_some())
    };
    spec.ingress
        .iter()
        .flatten()
        .any(|rule| uses_selector(rule.from.as_ref()))
        || spec
            .egress
            .iter()
            .flatten()
            .any(|rule| uses_selector(rule.to.as_ref()))
}

/// Policies that may select objects of `namespace`: those living in it and
/// those with a namespaceSelector peer. `None` keeps only the latter.
fn policies_selecting(
    store: &Store<NetworkPolicy>,
    namespace: Option<&str>,
) -> Vec<ObjectRef<NetworkPolicy>> {
    store
        .state()
        .iter()
        .filter(|np| {
            namespace.is_some_and(|ns| np.namespace().as_deref() == Some(ns))
                || has_namespace_peer(np)
        })
        .map(|np| ObjectRef::from_obj(np.as_ref()))
        .collect()
}

#[instrument(skip(state), fields(name = %np.name_any(), namespace = np.namespace()))]
async fn reconcile(np: Arc<NetworkPolicy>, state: Arc<ControllerState>) -> Result<Action> {
    let key = object_key(np.as_ref());
    if let Some(action) = state.standby(CONTROLLER, &key) {
        return Ok(action);
    }
    let started = Instant::now();
    let namespace = np.namespace().unwrap_or_default();
    let api: Api<NetworkPolicy> = Api::namespaced(state.client.clone(), &namespace);

    let result = if finalizers::is_being_deleted(np.as_ref()) {
        on_deleted(&state.ctx, &np).await
    } else {
        match finalizers::add_finalizer(&api, np.as_ref(), NETWORK_POLICY_FINALIZER).await {
            Ok(()) => on_present(&state.ctx, &np).await,
            Err(e) => Err(e),
        }
    };
    state.finish(CONTROLLER, &key, started, result)
}

fn error_policy(np: Arc<NetworkPolicy>, error: &Error, state: Arc<ControllerState>) -> Action {
    state.error_action(CONTROLLER, &object_key(np.as_ref()), error)
}

fn annotation(key: &str, value: String) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value)])
}

/// Create or refresh the KuryrNetworkPolicy of `np`
pub async fn on_present(ctx: &Context, np: &NetworkPolicy) -> Result<()> {
    let namespace = np.namespace().unwrap_or_default();
    let name = np.name_any();
    let key = object_key(np);

    let spec = ctx.translator.knp_spec(np).await?;
    let existing = match ctx.cluster.get_kuryr_network_policy(&namespace, &name).await {
        Ok(knp) => Some(knp),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };

    let unchanged = match &existing {
        Some(knp) => serde_json::to_value(&knp.spec)? == serde_json::to_value(&spec)?,
        None => false,
    };
    if unchanged {
        debug!("KuryrNetworkPolicy {} is up to date", key);
    } else {
        let mut knp = KuryrNetworkPolicy::new(&name, spec);
        knp.metadata.namespace = Some(namespace.clone());
        knp.metadata.finalizers = Some(vec![NETWORK_POLICY_FINALIZER.to_string()]);
        knp.metadata.annotations = Some(annotation(NETWORK_POLICY_LINK_ANNOTATION, key.clone()));
        ctx.cluster.apply_kuryr_network_policy(&knp).await?;
        if existing.is_some() {
            info!("Updated KuryrNetworkPolicy {}", key);
        } else {
            info!("Created KuryrNetworkPolicy {}", key);
        }
    }

    if np.annotations().get(KNP_LINK_ANNOTATION) != Some(&key) {
        ctx.cluster
            .annotate_network_policy(&namespace, &name, &annotation(KNP_LINK_ANNOTATION, key))
            .await?;
    }
    Ok(())
}

/// Delete the derived resource and wait for it to be finalized. The policy
/// finalizer is released here only when no derived resource is left to do it.
pub async fn on_deleted(ctx: &Context, np: &NetworkPolicy) -> Result<()> {
    let namespace = np.namespace().unwrap_or_default();
    let name = np.name_any();

    match ctx.cluster.delete_kuryr_network_policy(&namespace, &name).await {
        Ok(()) => {
            debug!("Waiting for KuryrNetworkPolicy {}/{} to be finalized", namespace, name);
            Err(Error::ResourceNotReady(format!(
                "KuryrNetworkPolicy {}/{} is being finalized",
                namespace, name
            )))
        }
        Err(e) if e.is_not_found() => {
            if !finalizers::has_finalizer(np, NETWORK_POLICY_FINALIZER) {
                return Ok(());
            }
            match ctx.cluster.remove_network_policy_finalizer(&namespace, &name).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        }
        Err(e) => Err(e),
    }
}
