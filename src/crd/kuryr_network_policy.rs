//! KuryrNetworkPolicy Custom Resource Definition
//!
//! Derived 1:1 from a NetworkPolicy. The spec holds the translated security
//! group rules; the status is the ledger of what actually exists in Neutron.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{RuleSpec, SecurityGroupRule};

/// Finalizer placed on the KuryrNetworkPolicy and on its NetworkPolicy
pub const NETWORK_POLICY_FINALIZER: &str = "kuryr.openstack.org/networkpolicy-finalizer";

/// Annotation on a KuryrNetworkPolicy pointing back at its NetworkPolicy
pub const NETWORK_POLICY_LINK_ANNOTATION: &str = "openstack.org/kuryr-networkpolicy-link";

/// Annotation on a NetworkPolicy pointing at its KuryrNetworkPolicy
pub const KNP_LINK_ANNOTATION: &str = "openstack.org/kuryr-knp-link";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "openstack.org",
    version = "v1",
    kind = "KuryrNetworkPolicy",
    plural = "kuryrnetworkpolicies",
    namespaced,
    status = "KuryrNetworkPolicyStatus",
    shortname = "knp",
    printcolumn = r#"{"name":"SG-ID","type":"string","jsonPath":".status.securityGroupId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KuryrNetworkPolicySpec {
    #[serde(default)]
    pub ingress_sg_rules: Vec<RuleSpec>,

    #[serde(default)]
    pub egress_sg_rules: Vec<RuleSpec>,

    /// Copy of the NetworkPolicy pod selector
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub pod_selector: LabelSelector,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_types: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KuryrNetworkPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_id: Option<String>,

    /// Rules created in the security group, with their Neutron ids
    #[serde(default)]
    pub security_group_rules: Vec<SecurityGroupRule>,

    /// Pod selector the rules were last applied for. `None` until the first
    /// successful pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub pod_selector: Option<LabelSelector>,
}

impl KuryrNetworkPolicySpec {
    /// All desired rules, ingress first
    pub fn sg_rules(&self) -> impl Iterator<Item = &SecurityGroupRule> {
        self.ingress_sg_rules
            .iter()
            .chain(self.egress_sg_rules.iter())
            .map(|r| &r.sg_rule)
    }
}

impl KuryrNetworkPolicy {
    pub fn security_group_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.security_group_id.as_deref())
    }

    /// `namespace/name` of the originating NetworkPolicy, if the link
    /// annotation is present
    pub fn network_policy_link(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NETWORK_POLICY_LINK_ANNOTATION))
            .map(String::as_str)
    }
}
