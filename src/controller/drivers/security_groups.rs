//! Security groups for pod ports and load balancer VIPs
//!
//! The `default` drivers hand out `[neutron_defaults] pod_security_groups`.
//! The `policy` drivers derive the groups from the KuryrNetworkPolicies whose
//! pod selector matches, falling back to the defaults for unselected pods.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::cluster::ClusterApi;
use crate::controller::selector;
use crate::error::{Error, Result};

#[async_trait]
pub trait PodSecurityGroupsDriver: Send + Sync {
    async fn get_security_groups(&self, pod: &Pod, project_id: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait ServiceSecurityGroupsDriver: Send + Sync {
    async fn get_security_groups(&self, service: &Service, project_id: &str)
        -> Result<Vec<String>>;
}

fn required_defaults(defaults: &[String]) -> Result<Vec<String>> {
    if defaults.is_empty() {
        return Err(Error::ConfigError(
            "neutron_defaults.pod_security_groups is not set".to_string(),
        ));
    }
    Ok(defaults.to_vec())
}

/// Label selector equivalent of a Service's `spec.selector`
pub fn service_selector(service: &Service) -> Option<LabelSelector> {
    let labels = service.spec.as_ref()?.selector.clone()?;
    if labels.is_empty() {
        return None;
    }
    Some(LabelSelector {
        match_labels: Some(labels),
        match_expressions: None,
    })
}

pub struct DefaultPodSecurityGroupsDriver {
    defaults: Vec<String>,
}

impl DefaultPodSecurityGroupsDriver {
    pub fn new(defaults: Vec<String>) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl PodSecurityGroupsDriver for DefaultPodSecurityGroupsDriver {
    async fn get_security_groups(&self, _pod: &Pod, _project_id: &str) -> Result<Vec<String>> {
        required_defaults(&self.defaults)
    }
}

pub struct DefaultServiceSecurityGroupsDriver {
    defaults: Vec<String>,
}

impl DefaultServiceSecurityGroupsDriver {
    pub fn new(defaults: Vec<String>) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl ServiceSecurityGroupsDriver for DefaultServiceSecurityGroupsDriver {
    async fn get_security_groups(
        &self,
        _service: &Service,
        _project_id: &str,
    ) -> Result<Vec<String>> {
        required_defaults(&self.defaults)
    }
}

/// Security groups of the policies selecting `pod`
async fn pod_policy_sgs(
    cluster: &dyn ClusterApi,
    pod: &Pod,
    defaults: &[String],
) -> Result<Vec<String>> {
    let namespace = pod.namespace().unwrap_or_default();
    let labels: BTreeMap<String, String> = pod.labels().clone();

    let mut sgs = Vec::new();
    for knp in cluster.list_kuryr_network_policies(&namespace).await? {
        if !selector::matches(Some(&knp.spec.pod_selector), Some(&labels)) {
            continue;
        }
        match knp.security_group_id() {
            Some(id) => {
                debug!("Pod {}/{} selected by {}", namespace, pod.name_any(), knp.name_any());
                sgs.push(id.to_string());
            }
            None => {
                warn!(
                    "Security group for policy {}/{} not created yet, will retry",
                    namespace,
                    knp.name_any()
                );
                return Err(Error::ResourceNotReady(format!(
                    "pod {}/{} waits for policy {}",
                    namespace,
                    pod.name_any(),
                    knp.name_any()
                )));
            }
        }
    }

    if sgs.is_empty() {
        return required_defaults(defaults);
    }
    Ok(sgs)
}

pub struct PolicyPodSecurityGroupsDriver {
    cluster: Arc<dyn ClusterApi>,
    defaults: Vec<String>,
}

impl PolicyPodSecurityGroupsDriver {
    pub fn new(cluster: Arc<dyn ClusterApi>, defaults: Vec<String>) -> Self {
        Self { cluster, defaults }
    }
}

#[async_trait]
impl PodSecurityGroupsDriver for PolicyPodSecurityGroupsDriver {
    async fn get_security_groups(&self, pod: &Pod, _project_id: &str) -> Result<Vec<String>> {
        pod_policy_sgs(self.cluster.as_ref(), pod, &self.defaults).await
    }
}

/// All pods behind a Service are assumed to carry the same labels, so the
/// groups of the first selected pod apply to the whole Service.
pub struct PolicyServiceSecurityGroupsDriver {
    cluster: Arc<dyn ClusterApi>,
    defaults: Vec<String>,
}

impl PolicyServiceSecurityGroupsDriver {
    pub fn new(cluster: Arc<dyn ClusterApi>, defaults: Vec<String>) -> Self {
        Self { cluster, defaults }
    }
}

#[async_trait]
impl ServiceSecurityGroupsDriver for PolicyServiceSecurityGroupsDriver {
    async fn get_security_groups(
        &self,
        service: &Service,
        _project_id: &str,
    ) -> Result<Vec<String>> {
        let Some(sel) = service_selector(service) else {
            return Ok(Vec::new());
        };
        let namespace = service.namespace().unwrap_or_default();
        let pods = self.cluster.list_pods(Some(&namespace), Some(&sel)).await?;
        match pods.first() {
            Some(pod) => pod_policy_sgs(self.cluster.as_ref(), pod, &self.defaults).await,
            None => Ok(Vec::new()),
        }
    }
}
