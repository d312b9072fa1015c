//! Diff-based security group rule reconciliation
//!
//! Rules are compared by value (see [`SecurityGroupRule`]'s `PartialEq`), so
//! a rule present on both sides keeps its Neutron id and is never recreated.
//! The ledger is persisted after every single create or delete so a failure
//! part way leaves a status that matches the cloud.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::sg_rules::for_group;
use crate::crd::SecurityGroupRule;
use crate::error::{Error, Result};
use crate::openstack::NetworkApi;

/// Where the applied rule list is recorded
#[async_trait]
pub trait RuleLedger: Send {
    async fn persist(&mut self, rules: &[SecurityGroupRule]) -> Result<()>;
}

/// Changes needed to turn `previous` into `desired`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub to_add: Vec<SecurityGroupRule>,
    /// Indexes into `previous`, highest first
    pub to_remove: Vec<usize>,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

pub fn diff_rules(previous: &[SecurityGroupRule], desired: &[SecurityGroupRule]) -> RuleDiff {
    let to_add = desired
        .iter()
        .filter(|d| !previous.contains(d))
        .cloned()
        .collect();
    let mut to_remove: Vec<usize> = previous
        .iter()
        .enumerate()
        .filter(|(_, p)| !desired.contains(p))
        .map(|(i, _)| i)
        .collect();
    to_remove.reverse();
    RuleDiff { to_add, to_remove }
}

/// Id of the existing rule named in a Neutron "already exists" conflict
pub fn existing_rule_id(message: &str) -> Option<String> {
    let (_, rest) = message.split_once("Rule id is")?;
    let token = rest.split_whitespace().next()?;
    let id = token.trim_end_matches('.');
    (!id.is_empty()).then(|| id.to_string())
}

pub struct SecurityGroupReconciler {
    network: Arc<dyn NetworkApi>,
}

impl SecurityGroupReconciler {
    pub fn new(network: Arc<dyn NetworkApi>) -> Self {
        Self { network }
    }

    /// Create `rule` in `security_group_id`. A duplicate resolves to the
    /// existing rule; an exhausted quota is returned as an error.
    pub async fn create_rule(
        &self,
        security_group_id: &str,
        rule: &SecurityGroupRule,
    ) -> Result<SecurityGroupRule> {
        let body = for_group(rule, security_group_id);
        match self.network.create_security_group_rule(&body).await {
            Ok(created) => {
                debug!("Created rule {} in {}", created, security_group_id);
                #[cfg(feature = "metrics")]
                super::metrics::inc_sg_rule_operation("create");
                Ok(SecurityGroupRule {
                    id: created.id,
                    ..body
                })
            }
            Err(e) if e.is_quota_exceeded() => {
                warn!("Quota exceeded creating rule in {}: {}", security_group_id, e);
                Err(e)
            }
            Err(Error::OpenStack { status: 409, message }) => {
                match existing_rule_id(&message) {
                    Some(id) => {
                        debug!("Rule {} already exists in {}", id, security_group_id);
                        Ok(SecurityGroupRule {
                            id: Some(id),
                            ..body
                        })
                    }
                    None => Err(Error::openstack(409, message)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a rule; an already deleted rule counts as success
    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        match self.network.delete_security_group_rule(rule_id).await {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                super::metrics::inc_sg_rule_operation("delete");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Rule {} was already deleted", rule_id);
                Ok(())
            }
            other => other,
        }
    }

    /// Bring the rules of `security_group_id` from `current` to `desired`.
    ///
    /// Additions come first, then removals in reverse index order. The
    /// ledger is written after each step. Returns the final rule list.
    pub async fn reconcile(
        &self,
        security_group_id: &str,
        mut current: Vec<SecurityGroupRule>,
        desired: &[SecurityGroupRule],
        ledger: &mut dyn RuleLedger,
    ) -> Result<Vec<SecurityGroupRule>> {
        let diff = diff_rules(&current, desired);
        if diff.is_empty() {
            return Ok(current);
        }
        info!(
            "Security group {}: adding {} rule(s), removing {}",
            security_group_id,
            diff.to_add.len(),
            diff.to_remove.len()
        );

        for rule in &diff.to_add {
            let created = self.create_rule(security_group_id, rule).await?;
            current.push(created);
            ledger.persist(&current).await?;
        }

        for index in diff.to_remove {
            if let Some(id) = current[index].id.clone() {
                self.delete_rule(&id).await?;
            }
            current.remove(index);
            ledger.persist(&current).await?;
        }

        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::sg_rules::build_rule;
    use crate::crd::Direction;
    use crate::openstack::fake::FakeCloud;

    #[derive(Default)]
    struct Snapshots(Vec<Vec<SecurityGroupRule>>);

    #[async_trait]
    impl RuleLedger for Snapshots {
        async fn persist(&mut self, rules: &[SecurityGroupRule]) -> Result<()> {
            self.0.push(rules.to_vec());
            Ok(())
        }
    }

    fn tcp(port: u16, prefix: &str) -> SecurityGroupRule {
        build_rule(Direction::Ingress, Some(port), None, Some("tcp"), Some(prefix))
    }

    #[test]
    fn test_diff_keeps_common_rules() {
        let mut kept = tcp(80, "10.0.0.1/32");
        kept.id = Some("r1".to_string());
        let mut stale = tcp(80, "10.0.0.2/32");
        stale.id = Some("r2".to_string());
        let mut stale2 = tcp(443, "10.0.0.1/32");
        stale2.id = Some("r3".to_string());

        let previous = vec![kept.clone(), stale, stale2];
        let desired = vec![tcp(80, "10.0.0.1/32"), tcp(80, "10.0.0.3/32")];

        let diff = diff_rules(&previous, &desired);
        assert_eq!(diff.to_add, vec![tcp(80, "10.0.0.3/32")]);
        assert_eq!(diff.to_remove, vec![2, 1]);
    }

    #[test]
    fn test_diff_identical_lists() {
        let rules = vec![tcp(80, "10.0.0.1/32"), tcp(81, "10.0.0.1/32")];
        assert!(diff_rules(&rules, &rules).is_empty());
    }

    #[test]
    fn test_existing_rule_id() {
        assert_eq!(
            existing_rule_id("Security group rule already exists. Rule id is 4b1e-77.").as_deref(),
            Some("4b1e-77")
        );
        assert_eq!(existing_rule_id("Rule id is"), None);
        assert_eq!(existing_rule_id("something else"), None);
    }

    #[tokio::test]
    async fn test_reconcile_adds_then_removes_and_persists_each_step() {
        let cloud = Arc::new(FakeCloud::new());
        let reconciler = SecurityGroupReconciler::new(cloud.clone());

        let mut ledger = Snapshots::default();
        let first = reconciler
            .reconcile(
                "sg-1",
                Vec::new(),
                &[tcp(80, "10.0.0.1/32"), tcp(80, "10.0.0.2/32")],
                &mut ledger,
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(ledger.0.len(), 2);
        let kept_id = first[0].id.clone();

        let second = reconciler
            .reconcile(
                "sg-1",
                first,
                &[tcp(80, "10.0.0.1/32"), tcp(8080, "10.0.0.9/32")],
                &mut ledger,
            )
            .await
            .unwrap();
        assert_eq!(second, vec![tcp(80, "10.0.0.1/32"), tcp(8080, "10.0.0.9/32")]);
        assert_eq!(second[0].id, kept_id);
        assert_eq!(ledger.0.len(), 4);
        assert_eq!(cloud.with(|s| s.rules_of("sg-1").len()), 2);
    }

    #[tokio::test]
    async fn test_duplicate_rule_recovers_existing_id() {
        let cloud = Arc::new(FakeCloud::new());
        let reconciler = SecurityGroupReconciler::new(cloud.clone());

        let existing = reconciler
            .create_rule("sg-1", &tcp(53, "10.0.0.0/24"))
            .await
            .unwrap();
        let again = reconciler
            .create_rule("sg-1", &tcp(53, "10.0.0.0/24"))
            .await
            .unwrap();
        assert_eq!(again.id, existing.id);
    }

    #[tokio::test]
    async fn test_quota_conflict_is_raised() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_once(
            "create_security_group_rule",
            409,
            "Quota exceeded for resources: ['security_group_rule'].",
        );
        let reconciler = SecurityGroupReconciler::new(cloud);
        let err = reconciler
            .create_rule("sg-1", &tcp(53, "10.0.0.0/24"))
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());
    }

    #[tokio::test]
    async fn test_delete_missing_rule_is_success() {
        let cloud = Arc::new(FakeCloud::new());
        let reconciler = SecurityGroupReconciler::new(cloud);
        reconciler.delete_rule("gone").await.unwrap();
    }
}
