//! Label selector matching
//!
//! `matches` evaluates a selector locally against an object's labels; the
//! list helpers turn a selector into API list parameters so the resolution
//! of a selector to pods or namespaces happens server side.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::NetworkPolicySpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::api::ListParams;
use kube::core::Selector;

use crate::error::{Error, Result};

/// Direction a NetworkPolicy restricts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyType {
    Ingress,
    Egress,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Ingress => "Ingress",
            PolicyType::Egress => "Egress",
        }
    }
}

/// Whether `labels` satisfy `selector`.
///
/// An absent selector and an empty selector both match everything. All
/// `matchLabels` entries must be present with the same value and every
/// expression must hold.
pub fn matches(selector: Option<&LabelSelector>, labels: Option<&BTreeMap<String, String>>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);

    let labels_match = selector
        .match_labels
        .as_ref()
        .map_or(true, |required| {
            required.iter().all(|(k, v)| labels.get(k) == Some(v))
        });

    let expressions_match = selector
        .match_expressions
        .as_ref()
        .map_or(true, |exprs| exprs.iter().all(|e| expression_matches(e, labels)));

    labels_match && expressions_match
}

fn expression_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&expr.key);
    let values = expr.values.as_deref().unwrap_or_default();
    match expr.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.map_or(true, |v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

/// A selector with neither labels nor expressions
pub fn is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().map_or(true, |m| m.is_empty())
        && selector
            .match_expressions
            .as_ref()
            .map_or(true, |e| e.is_empty())
}

/// List parameters restricting results to objects matching `selector`.
/// `None` or an empty selector lists everything in scope.
pub fn list_params(selector: Option<&LabelSelector>) -> Result<ListParams> {
    match selector {
        Some(selector) if !is_empty(selector) => {
            let selector = Selector::try_from(selector.clone()).map_err(|e| {
                Error::IntegrityError(format!("invalid label selector: {}", e))
            })?;
            Ok(ListParams::default().labels_from(&selector))
        }
        _ => Ok(ListParams::default()),
    }
}

/// Directions a policy restricts. Without `policyTypes`, Ingress always
/// applies and Egress applies only when egress rules are present.
pub fn policy_types(spec: &NetworkPolicySpec) -> Vec<PolicyType> {
    match &spec.policy_types {
        Some(types) => types
            .iter()
            .filter_map(|t| match t.as_str() {
                "Ingress" => Some(PolicyType::Ingress),
                "Egress" => Some(PolicyType::Egress),
                _ => None,
            })
            .collect(),
        None => {
            let mut types = vec![PolicyType::Ingress];
            if spec.egress.is_some() {
                types.push(PolicyType::Egress);
            }
            types
        }
    }
}

/// A policy only restricting egress. Both forms are treated as egress-only:
/// `policyTypes: [Egress]`, or egress rules without ingress rules. Empty
/// rule lists count as no rules.
pub fn is_egress_only(spec: &NetworkPolicySpec) -> bool {
    let declared = spec
        .policy_types
        .as_ref()
        .is_some_and(|t| t.len() == 1 && t[0] == "Egress");
    let has_egress = spec.egress.as_ref().is_some_and(|r| !r.is_empty());
    let has_ingress = spec.ingress.as_ref().is_some_and(|r| !r.is_empty());
    declared || (has_egress && !has_ingress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{NetworkPolicyEgressRule, NetworkPolicyIngressRule};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn req(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_absent_and_empty_selector_match_all() {
        let l = labels(&[("app", "web")]);
        assert!(matches(None, Some(&l)));
        assert!(matches(Some(&LabelSelector::default()), Some(&l)));
        assert!(matches(Some(&LabelSelector::default()), None));
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web"), ("tier", "front")])),
            ..Default::default()
        };
        assert!(matches(
            Some(&selector),
            Some(&labels(&[("app", "web"), ("tier", "front"), ("x", "y")]))
        ));
        assert!(!matches(Some(&selector), Some(&labels(&[("app", "web")]))));
        assert!(!matches(Some(&selector), None));
    }

    #[test]
    fn test_match_expressions() {
        let l = labels(&[("env", "prod")]);
        let check = |r: LabelSelectorRequirement| {
            matches(
                Some(&LabelSelector {
                    match_expressions: Some(vec![r]),
                    ..Default::default()
                }),
                Some(&l),
            )
        };
        assert!(check(req("env", "In", &["prod", "stage"])));
        assert!(!check(req("env", "In", &["dev"])));
        assert!(!check(req("missing", "In", &["prod"])));
        assert!(check(req("missing", "NotIn", &["prod"])));
        assert!(!check(req("env", "NotIn", &["prod"])));
        assert!(check(req("env", "Exists", &[])));
        assert!(check(req("missing", "DoesNotExist", &[])));
        assert!(!check(req("env", "Bogus", &[])));
    }

    #[test]
    fn test_labels_and_expressions_are_anded() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: Some(vec![req("env", "In", &["prod"])]),
        };
        assert!(matches(
            Some(&selector),
            Some(&labels(&[("app", "web"), ("env", "prod")]))
        ));
        assert!(!matches(
            Some(&selector),
            Some(&labels(&[("app", "web"), ("env", "dev")]))
        ));
    }

    #[test]
    fn test_list_params() {
        assert!(list_params(None).unwrap().label_selector.is_none());
        assert!(list_params(Some(&LabelSelector::default()))
            .unwrap()
            .label_selector
            .is_none());

        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            ..Default::default()
        };
        assert_eq!(
            list_params(Some(&selector)).unwrap().label_selector.as_deref(),
            Some("app=web")
        );
    }

    #[test]
    fn test_policy_types_defaults() {
        let spec = NetworkPolicySpec::default();
        assert_eq!(policy_types(&spec), vec![PolicyType::Ingress]);

        let spec = NetworkPolicySpec {
            egress: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(
            policy_types(&spec),
            vec![PolicyType::Ingress, PolicyType::Egress]
        );

        let spec = NetworkPolicySpec {
            policy_types: Some(vec!["Egress".to_string()]),
            ..Default::default()
        };
        assert_eq!(policy_types(&spec), vec![PolicyType::Egress]);
    }

    #[test]
    fn test_egress_only() {
        let declared = NetworkPolicySpec {
            policy_types: Some(vec!["Egress".to_string()]),
            ..Default::default()
        };
        assert!(is_egress_only(&declared));

        let implied = NetworkPolicySpec {
            egress: Some(vec![NetworkPolicyEgressRule::default()]),
            ..Default::default()
        };
        assert!(is_egress_only(&implied));

        let empty_ingress = NetworkPolicySpec {
            ingress: Some(vec![]),
            egress: Some(vec![NetworkPolicyEgressRule::default()]),
            ..Default::default()
        };
        assert!(is_egress_only(&empty_ingress));

        let empty_egress = NetworkPolicySpec {
            egress: Some(vec![]),
            ..Default::default()
        };
        assert!(!is_egress_only(&empty_egress));

        let both = NetworkPolicySpec {
            ingress: Some(vec![NetworkPolicyIngressRule::default()]),
            egress: Some(vec![NetworkPolicyEgressRule::default()]),
            ..Default::default()
        };
        assert!(!is_egress_only(&both));
    }
}
