//! Shared types for the Kuryr custom resources
//!
//! - [`SecurityGroupRule`] - one Neutron security group rule as stored on a
//!   [`KuryrNetworkPolicy`](super::KuryrNetworkPolicy)
//! - [`RuleSpec`] - a desired rule plus the informational peer metadata that
//!   produced it

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Traffic direction of a security group rule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Ingress,
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "ingress"),
            Direction::Egress => write!(f, "egress"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum EtherType {
    #[default]
    IPv4,
    IPv6,
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherType::IPv4 => write!(f, "IPv4"),
            EtherType::IPv6 => write!(f, "IPv6"),
        }
    }
}

/// A Neutron security group rule.
///
/// Field names follow the Neutron API so the same value is sent to the cloud
/// and persisted on the custom resource. Equality only looks at the fields
/// that define which traffic the rule admits: the cloud id, the owning group
/// and the description are ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct SecurityGroupRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub direction: Direction,
    #[serde(default)]
    pub ethertype: EtherType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_min: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_max: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PartialEq for SecurityGroupRule {
    fn eq(&self, other: &Self) -> bool {
        self.direction == other.direction
            && self.ethertype == other.ethertype
            && self.protocol == other.protocol
            && self.port_range_min == other.port_range_min
            && self.port_range_max == other.port_range_max
            && self.remote_ip_prefix == other.remote_ip_prefix
    }
}

impl Eq for SecurityGroupRule {}

impl fmt::Display for SecurityGroupRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.direction,
            self.ethertype,
            self.protocol.as_deref().unwrap_or("any")
        )?;
        match (self.port_range_min, self.port_range_max) {
            (Some(min), Some(max)) if min != max => write!(f, " {}-{}", min, max)?,
            (Some(min), _) => write!(f, " {}", min)?,
            _ => {}
        }
        if let Some(prefix) = &self.remote_ip_prefix {
            write!(f, " {}", prefix)?;
        }
        Ok(())
    }
}

/// Pod that contributed a remote prefix to a rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AffectedPod {
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    pub pod_namespace: String,
}

/// Desired rule stored in a KuryrNetworkPolicy spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub sg_rule: SecurityGroupRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_pods: Vec<AffectedPod>,
}

impl PartialEq for RuleSpec {
    fn eq(&self, other: &Self) -> bool {
        self.sg_rule == other.sg_rule
    }
}
