//! Periodic load balancer resync
//!
//! Octavia resources can vanish without the controller noticing, e.g. when an
//! operator deletes a pool by hand. Every `reconcile_interval` the sweeper
//! compares the ids recorded in each KuryrLoadBalancer status with what
//! Octavia lists. For the first level found missing it drops that level and
//! everything below it from the status; the status write wakes the load
//! balancer controller, which rebuilds from there.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::load_balancer::service_reference;
use super::{object_key, Context, ControllerState, EventType};
use crate::crd::{KuryrLoadBalancer, KuryrLoadBalancerStatus};
use crate::error::Result;

/// First level of a load balancer graph that is gone from Octavia, with the
/// ids recorded for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    LoadBalancer(String),
    Listeners(BTreeSet<String>),
    Pools(BTreeSet<String>),
    Members(BTreeSet<String>),
}

impl Drift {
    fn describe(&self) -> String {
        let join = |ids: &BTreeSet<String>| ids.iter().cloned().collect::<Vec<_>>().join(", ");
        match self {
            Drift::LoadBalancer(id) => format!("load balancer {}", id),
            Drift::Listeners(ids) => format!("listeners {}", join(ids)),
            Drift::Pools(ids) => format!("pools {}", join(ids)),
            Drift::Members(ids) => format!("members {}", join(ids)),
        }
    }

    /// Forget the missing resources and whatever hangs below them
    pub fn prune(&self, status: &mut KuryrLoadBalancerStatus) {
        match self {
            Drift::LoadBalancer(_) => *status = KuryrLoadBalancerStatus::default(),
            Drift::Listeners(ids) => {
                status.listeners.retain(|l| !recorded_in(l.id.as_deref(), ids));
                let pools: BTreeSet<String> = status
                    .pools
                    .iter()
                    .filter(|p| ids.contains(&p.listener_id))
                    .filter_map(|p| p.id.clone())
                    .collect();
                status.pools.retain(|p| !ids.contains(&p.listener_id));
                status.members.retain(|m| !pools.contains(&m.pool_id));
            }
            Drift::Pools(ids) => {
                status.pools.retain(|p| !recorded_in(p.id.as_deref(), ids));
                status.members.retain(|m| !ids.contains(&m.pool_id));
            }
            Drift::Members(ids) => {
                status.members.retain(|m| !recorded_in(m.id.as_deref(), ids));
            }
        }
    }
}

fn recorded_in(id: Option<&str>, ids: &BTreeSet<String>) -> bool {
    id.is_some_and(|id| ids.contains(id))
}

/// Ids of the load balancers, listeners and pools Octavia knows about
struct Inventory {
    load_balancers: HashSet<String>,
    listeners: HashSet<String>,
    pools: HashSet<String>,
}

pub async fn run(state: Arc<ControllerState>) -> Result<()> {
    let period = state.ctx.config.reconcile_interval();
    info!("Starting load balancer sweeper, every {}s", period.as_secs());

    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately, the controllers handle startup
    interval.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping load balancer sweeper");
                return Ok(());
            }
            _ = interval.tick() => {}
        }
        if !state.is_leader() {
            debug!("Not leading, skipping load balancer sweep");
            continue;
        }
        if state.dry_run {
            info!("[dry-run] skipping load balancer sweep");
            continue;
        }
        match sweep(&state.ctx).await {
            Ok(0) => debug!("Load balancers are in sync with Octavia"),
            Ok(n) => info!("Triggered resync of {} load balancers", n),
            Err(e) => warn!("Load balancer sweep failed: {}", e),
        }
    }
}

/// One pass over every KuryrLoadBalancer. Returns how many were resynced.
pub async fn sweep(ctx: &Context) -> Result<usize> {
    let klbs = ctx.cluster.list_kuryr_load_balancers().await?;
    if klbs.iter().all(|klb| klb.status.as_ref().map_or(true, |s| s.lb_id().is_none())) {
        return Ok(0);
    }
    let inventory = inventory(ctx).await?;

    let mut resynced = 0;
    for klb in &klbs {
        let Some(status) = &klb.status else {
            continue;
        };
        let Some(drift) = drift(ctx, status, &inventory).await? else {
            continue;
        };
        match resync(ctx, klb, status, &drift).await {
            Ok(()) => resynced += 1,
            Err(e) if e.is_not_found() => debug!("{} is gone", object_key(klb)),
            Err(e) => warn!("Failed to resync {}: {}", object_key(klb), e),
        }
    }
    Ok(resynced)
}

fn tag_filter(ctx: &Context) -> String {
    ctx.config.neutron_defaults.resource_tags.join(",")
}

async fn inventory(ctx: &Context) -> Result<Inventory> {
    let tags = tag_filter(ctx);
    let filters: Vec<(&str, &str)> = if tags.is_empty() {
        Vec::new()
    } else {
        vec![("tags", tags.as_str())]
    };
    let load_balancers = ctx.lbaas.list_load_balancers(&filters).await?;
    let listeners = ctx.lbaas.list_listeners(&filters).await?;
    let pools = ctx.lbaas.list_pools(&filters).await?;
    Ok(Inventory {
        load_balancers: load_balancers.into_iter().map(|lb| lb.id).collect(),
        listeners: listeners.into_iter().map(|l| l.id).collect(),
        pools: pools.into_iter().map(|p| p.id).collect(),
    })
}

fn missing<'a>(
    ids: impl Iterator<Item = Option<&'a String>>,
    known: &HashSet<String>,
) -> BTreeSet<String> {
    ids.flatten().filter(|id| !known.contains(*id)).cloned().collect()
}

/// The highest level of `status` that Octavia no longer has. Lower levels
/// cannot exist without it, so they are not looked at.
async fn drift(
    ctx: &Context,
    status: &KuryrLoadBalancerStatus,
    inventory: &Inventory,
) -> Result<Option<Drift>> {
    let Some(lb_id) = status.lb_id() else {
        return Ok(None);
    };
    if !inventory.load_balancers.contains(lb_id) {
        return Ok(Some(Drift::LoadBalancer(lb_id.to_string())));
    }

    let listeners = missing(status.listeners.iter().map(|l| l.id.as_ref()), &inventory.listeners);
    if !listeners.is_empty() {
        return Ok(Some(Drift::Listeners(listeners)));
    }
    let pools = missing(status.pools.iter().map(|p| p.id.as_ref()), &inventory.pools);
    if !pools.is_empty() {
        return Ok(Some(Drift::Pools(pools)));
    }

    let mut known = HashSet::new();
    for pool_id in status.pools.iter().filter_map(|p| p.id.as_deref()) {
        match ctx.lbaas.list_members(pool_id, &[]).await {
            Ok(members) => known.extend(members.into_iter().map(|m| m.id)),
            // removed since the inventory was taken, caught next round
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    let members = missing(status.members.iter().map(|m| m.id.as_ref()), &known);
    Ok((!members.is_empty()).then_some(Drift::Members(members)))
}

async fn resync(
    ctx: &Context,
    klb: &KuryrLoadBalancer,
    status: &KuryrLoadBalancerStatus,
    drift: &Drift,
) -> Result<()> {
    let key = object_key(klb);
    warn!("{} of {} vanished from Octavia, resyncing", drift.describe(), key);
    ctx.emit_event(
        &service_reference(klb),
        EventType::Warning,
        "KuryrLBResync",
        &format!("{} not found in Octavia, recreating", drift.describe()),
    )
    .await;

    let mut status = status.clone();
    if matches!(drift, Drift::LoadBalancer(_)) {
        // the floating IP pointed at the old VIP port
        if let Some(info) = status.service_pub_ip_info.take() {
            if let Err(e) = ctx.drivers.pub_ip.disassociate_pub_ip(&info).await {
                debug!("Floating IP {} of {} already detached: {}", info.ip_addr, key, e);
            }
            ctx.drivers.pub_ip.release_pub_ip(&info).await;
        }
    }
    drift.prune(&mut status);

    ctx.cluster
        .patch_klb_status(&klb.namespace().unwrap_or_default(), &klb.name_any(), &status)
        .await?;
    #[cfg(feature = "metrics")]
    super::metrics::inc_sweeper_resync();
    Ok(())
}
