//! Prometheus metrics for the Kuryr controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `kuryr_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `kuryr_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `kuryr_sg_rule_operations_total` (counter): security group rule creates and deletes.
//! - `kuryr_lbaas_operations_total` (counter): Octavia resource operations by resource and action.
//! - `kuryr_sweeper_resyncs_total` (counter): load balancers forced to resync by the sweeper.
//! - `kuryr_leader` (gauge): 1 while this replica holds the leader lease.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "kuryrloadbalancer"
    pub controller: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::kind`
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RuleOperationLabels {
    /// "create" or "delete"
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LbaasLabels {
    /// loadbalancer, listener, pool or member
    pub resource: String,
    /// "create" or "delete"
    pub operation: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static SG_RULE_OPERATIONS_TOTAL: Lazy<Family<RuleOperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static LBAAS_OPERATIONS_TOTAL: Lazy<Family<LbaasLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static SWEEPER_RESYNCS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static LEADER: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    // Counters get their `_total` suffix from the encoder
    registry.register(
        "kuryr_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "kuryr_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "kuryr_sg_rule_operations",
        "Security group rules created or deleted in Neutron",
        SG_RULE_OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "kuryr_lbaas_operations",
        "Octavia resources ensured or released",
        LBAAS_OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "kuryr_sweeper_resyncs",
        "Load balancers whose status was reset because cloud resources went missing",
        SWEEPER_RESYNCS_TOTAL.clone(),
    );
    registry.register(
        "kuryr_leader",
        "Whether this replica currently holds the leader lease",
        LEADER.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_sg_rule_operation(operation: &str) {
    let labels = RuleOperationLabels {
        operation: operation.to_string(),
    };
    SG_RULE_OPERATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_lbaas_operation(resource: &str, operation: &str) {
    let labels = LbaasLabels {
        resource: resource.to_string(),
        operation: operation.to_string(),
    };
    LBAAS_OPERATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_sweeper_resync() {
    SWEEPER_RESYNCS_TOTAL.inc();
}

pub fn set_leader(is_leader: bool) {
    LEADER.set(i64::from(is_leader));
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_exports_kuryr_families() {
        inc_reconcile_error("kuryrnetworkpolicy", "openstack");
        inc_sg_rule_operation("create");
        inc_lbaas_operation("listener", "ensure");
        observe_reconcile_duration_seconds("kuryrloadbalancer", 0.25);
        set_leader(true);

        let mut out = String::new();
        encode(&mut out, &REGISTRY).unwrap();
        assert!(out.contains("kuryr_reconcile_errors_total"));
        assert!(out.contains("kuryr_sg_rule_operations_total"));
        assert!(out.contains("resource=\"listener\""));
        assert!(out.contains("kuryr_leader 1"));
    }
}
