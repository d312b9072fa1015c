//! Builders for security group rule descriptions

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::crd::{AffectedPod, Direction, EtherType, RuleSpec, SecurityGroupRule};

pub const RULE_DESCRIPTION: &str = "Kuryr-Kubernetes NetPolicy SG rule";

/// Ethertype implied by an address or CIDR; IPv4 when absent or unparsable
pub fn ethertype_for(cidr: Option<&str>) -> EtherType {
    let Some(cidr) = cidr else {
        return EtherType::IPv4;
    };
    let is_v6 = cidr
        .parse::<IpNetwork>()
        .map(|n| n.is_ipv6())
        .or_else(|_| cidr.parse::<IpAddr>().map(|a| a.is_ipv6()))
        .unwrap_or(false);
    if is_v6 {
        EtherType::IPv6
    } else {
        EtherType::IPv4
    }
}

/// Normalize a bare address into a host CIDR
pub fn host_cidr(ip: &str) -> String {
    if ip.contains('/') {
        return ip.to_string();
    }
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("{}/128", ip),
        _ => format!("{}/32", ip),
    }
}

/// Build a rule. The protocol is lowercased, a missing `port_range_max`
/// defaults to the minimum, and the ethertype follows the remote prefix.
pub fn build_rule(
    direction: Direction,
    port_range_min: Option<u16>,
    port_range_max: Option<u16>,
    protocol: Option<&str>,
    remote_ip_prefix: Option<&str>,
) -> SecurityGroupRule {
    SecurityGroupRule {
        id: None,
        direction,
        ethertype: ethertype_for(remote_ip_prefix),
        protocol: protocol.map(str::to_lowercase),
        port_range_min,
        port_range_max: port_range_max.or(port_range_min),
        remote_ip_prefix: remote_ip_prefix.map(str::to_string),
        security_group_id: None,
        description: Some(RULE_DESCRIPTION.to_string()),
    }
}

/// Wrap a rule with the namespace and pods it was derived from
pub fn rule_spec(
    rule: SecurityGroupRule,
    namespace: Option<&str>,
    affected_pods: Vec<AffectedPod>,
) -> RuleSpec {
    RuleSpec {
        sg_rule: rule,
        namespace: namespace.map(str::to_string),
        affected_pods,
    }
}

/// The catch-all rule admitting any traffic in `direction`
pub fn allow_all(direction: Direction) -> RuleSpec {
    rule_spec(build_rule(direction, None, None, None, None), None, Vec::new())
}

/// Copy of `rule` bound to a security group, ready to be sent to Neutron
pub fn for_group(rule: &SecurityGroupRule, security_group_id: &str) -> SecurityGroupRule {
    SecurityGroupRule {
        id: None,
        security_group_id: Some(security_group_id.to_string()),
        ..rule.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rule_normalizes() {
        let rule = build_rule(
            Direction::Ingress,
            Some(8080),
            None,
            Some("TCP"),
            Some("10.0.0.5/32"),
        );
        assert_eq!(rule.protocol.as_deref(), Some("tcp"));
        assert_eq!(rule.port_range_max, Some(8080));
        assert_eq!(rule.ethertype, EtherType::IPv4);
    }

    #[test]
    fn test_ethertype_from_prefix() {
        assert_eq!(ethertype_for(Some("fd00::/64")), EtherType::IPv6);
        assert_eq!(ethertype_for(Some("fd00::1")), EtherType::IPv6);
        assert_eq!(ethertype_for(Some("10.0.0.0/8")), EtherType::IPv4);
        assert_eq!(ethertype_for(None), EtherType::IPv4);
    }

    #[test]
    fn test_host_cidr() {
        assert_eq!(host_cidr("10.0.0.1"), "10.0.0.1/32");
        assert_eq!(host_cidr("fd00::1"), "fd00::1/128");
        assert_eq!(host_cidr("10.0.0.0/24"), "10.0.0.0/24");
    }

    #[test]
    fn test_allow_all_and_group_binding() {
        let rule = allow_all(Direction::Egress).sg_rule;
        assert!(rule.protocol.is_none() && rule.remote_ip_prefix.is_none());
        assert!(rule.port_range_min.is_none());

        let bound = for_group(&rule, "sg-1");
        assert_eq!(bound.security_group_id.as_deref(), Some("sg-1"));
        assert_eq!(bound, rule);
    }
}
