//! Subnet lookup for pods and services
//!
//! Subnet details rarely change, so they are cached for the lifetime of the
//! process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::controller::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::openstack::{NetworkApi, Subnet};

#[async_trait]
pub trait PodSubnetsDriver: Send + Sync {
    async fn get_subnets(&self, pod: &Pod, project_id: &str) -> Result<Vec<Subnet>>;
}

#[async_trait]
pub trait ServiceSubnetsDriver: Send + Sync {
    async fn get_subnets(&self, service: &Service, project_id: &str) -> Result<Vec<Subnet>>;
}

/// Memoized `GET /subnets/{id}`
pub struct SubnetCache {
    network: Arc<dyn NetworkApi>,
    subnets: RwLock<HashMap<String, Subnet>>,
}

impl SubnetCache {
    pub fn new(network: Arc<dyn NetworkApi>) -> Self {
        Self {
            network,
            subnets: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Subnet> {
        if let Some(subnet) = self.subnets.read().await.get(id) {
            return Ok(subnet.clone());
        }
        let subnet = self.network.get_subnet(id).await?;
        debug!("Caching subnet {} ({})", id, subnet.cidr);
        self.subnets
            .write()
            .await
            .insert(id.to_string(), subnet.clone());
        Ok(subnet)
    }
}

fn required(option: &Option<String>, name: &str) -> Result<String> {
    option
        .clone()
        .ok_or_else(|| Error::ConfigError(format!("neutron_defaults.{} is not set", name)))
}

/// Every pod lives on `[neutron_defaults] pod_subnet`
pub struct DefaultPodSubnetDriver {
    subnet_id: Option<String>,
    cache: Arc<SubnetCache>,
}

impl DefaultPodSubnetDriver {
    pub fn new(subnet_id: Option<String>, cache: Arc<SubnetCache>) -> Self {
        Self { subnet_id, cache }
    }
}

#[async_trait]
impl PodSubnetsDriver for DefaultPodSubnetDriver {
    async fn get_subnets(&self, _pod: &Pod, _project_id: &str) -> Result<Vec<Subnet>> {
        let id = required(&self.subnet_id, "pod_subnet")?;
        Ok(vec![self.cache.get(&id).await?])
    }
}

/// Each namespace has its own subnet, recorded on its KuryrNetwork
pub struct NamespacePodSubnetDriver {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<SubnetCache>,
}

impl NamespacePodSubnetDriver {
    pub fn new(cluster: Arc<dyn ClusterApi>, cache: Arc<SubnetCache>) -> Self {
        Self { cluster, cache }
    }
}

#[async_trait]
impl PodSubnetsDriver for NamespacePodSubnetDriver {
    async fn get_subnets(&self, pod: &Pod, _project_id: &str) -> Result<Vec<Subnet>> {
        let namespace = pod.namespace().unwrap_or_default();
        let kn = match self.cluster.get_kuryr_network(&namespace).await {
            Ok(kn) => kn,
            Err(e) if e.is_not_found() => {
                return Err(Error::ResourceNotReady(format!(
                    "KuryrNetwork for namespace {}",
                    namespace
                )))
            }
            Err(e) => return Err(e),
        };
        let subnet_id = kn.status.and_then(|s| s.subnet_id).ok_or_else(|| {
            Error::ResourceNotReady(format!("subnet of namespace {}", namespace))
        })?;
        Ok(vec![self.cache.get(&subnet_id).await?])
    }
}

/// Load balancer VIPs live on `[neutron_defaults] service_subnet`
pub struct DefaultServiceSubnetDriver {
    subnet_id: Option<String>,
    cache: Arc<SubnetCache>,
}

impl DefaultServiceSubnetDriver {
    pub fn new(subnet_id: Option<String>, cache: Arc<SubnetCache>) -> Self {
        Self { subnet_id, cache }
    }
}

#[async_trait]
impl ServiceSubnetsDriver for DefaultServiceSubnetDriver {
    async fn get_subnets(&self, _service: &Service, _project_id: &str) -> Result<Vec<Subnet>> {
        let id = required(&self.subnet_id, "service_subnet")?;
        Ok(vec![self.cache.get(&id).await?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::cluster::fake::FakeCluster;
    use crate::crd::{KuryrNetwork, KuryrNetworkSpec, KuryrNetworkStatus};
    use crate::openstack::fake::FakeCloud;
    use kube::api::ObjectMeta;

    fn pod_in(namespace: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cache_hits_cloud_once() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_subnet("pods", "10.0.0.0/16");
        let cache = Arc::new(SubnetCache::new(cloud.clone()));

        assert_eq!(cache.get("pods").await.unwrap().cidr, "10.0.0.0/16");
        cloud.with(|s| s.subnets.clear());
        assert_eq!(cache.get("pods").await.unwrap().cidr, "10.0.0.0/16");
    }

    #[tokio::test]
    async fn test_namespace_driver_reads_kuryr_network() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_subnet("ns-subnet", "10.1.0.0/24");
        let cluster = Arc::new(FakeCluster::new());
        let driver =
            NamespacePodSubnetDriver::new(cluster.clone(), Arc::new(SubnetCache::new(cloud)));

        let err = driver.get_subnets(&pod_in("team-a"), "p1").await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotReady(_)));

        let mut kn = KuryrNetwork::new(
            "team-a",
            KuryrNetworkSpec {
                ns_name: "team-a".to_string(),
                project_id: "p1".to_string(),
                ..Default::default()
            },
        );
        kn.metadata = ObjectMeta {
            name: Some("team-a".to_string()),
            namespace: Some("team-a".to_string()),
            ..Default::default()
        };
        kn.status = Some(KuryrNetworkStatus {
            subnet_id: Some("ns-subnet".to_string()),
            ..Default::default()
        });
        cluster.with(|s| s.kuryr_networks.push(kn));

        let subnets = driver.get_subnets(&pod_in("team-a"), "p1").await.unwrap();
        assert_eq!(subnets[0].id, "ns-subnet");
    }

    #[tokio::test]
    async fn test_default_service_subnet_requires_option() {
        let cloud = Arc::new(FakeCloud::new());
        let driver = DefaultServiceSubnetDriver::new(None, Arc::new(SubnetCache::new(cloud)));
        let err = driver
            .get_subnets(&Service::default(), "p1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
