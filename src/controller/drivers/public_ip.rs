//! Floating IPs for LoadBalancer Services
//!
//! A Service of type `LoadBalancer` gets a floating IP bound to its VIP port.
//! If `spec.loadBalancerIP` is set the user owns the address and it must
//! already exist unbound; otherwise one is allocated from
//! `[neutron_defaults] external_svc_net` and released with the Service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::NeutronDefaults;
use crate::crd::{AllocMethod, PubIpInfo};
use crate::error::{Error, Result};
use crate::openstack::{NetworkApi, NewFloatingIp};

/// Description set on allocated floating IPs
pub const FIP_DESCRIPTION: &str = "kuryr_lb";

#[async_trait]
pub trait ServicePubIpDriver: Send + Sync {
    /// `None` when the Service needs no public IP or none could be obtained
    async fn acquire_service_pub_ip_info(
        &self,
        spec_type: Option<&str>,
        lb_ip: Option<&str>,
        project_id: &str,
        port_id: Option<&str>,
    ) -> Result<Option<PubIpInfo>>;

    async fn associate_pub_ip(&self, info: &PubIpInfo, vip_port_id: &str) -> Result<()>;

    async fn disassociate_pub_ip(&self, info: &PubIpInfo) -> Result<()>;

    /// Returns false if a pool-allocated IP could not be freed
    async fn release_pub_ip(&self, info: &PubIpInfo) -> bool;
}

pub struct FloatingIpDriver {
    network: Arc<dyn NetworkApi>,
    defaults: NeutronDefaults,
}

impl FloatingIpDriver {
    pub fn new(network: Arc<dyn NetworkApi>, defaults: NeutronDefaults) -> Self {
        Self { network, defaults }
    }

    /// Id of `ip` if it is unbound or already bound to `port_id`
    async fn available_ip(&self, ip: &str, port_id: Option<&str>) -> Result<Option<String>> {
        let fips = self
            .network
            .list_floating_ips(&[("floating_ip_address", ip)])
            .await?;
        let available = fips.into_iter().find(|fip| {
            fip.floating_ip_address == ip
                && match fip.port_id.as_deref() {
                    None | Some("") => true,
                    Some(bound) => port_id == Some(bound),
                }
        });
        Ok(available.map(|fip| fip.id))
    }

    async fn allocate_ip(
        &self,
        network_id: &str,
        project_id: &str,
        port_id: Option<&str>,
    ) -> Result<(String, String)> {
        if let Some(port) = port_id {
            let attached = self.network.list_floating_ips(&[("port_id", port)]).await?;
            if let Some(fip) = attached
                .into_iter()
                .find(|f| !f.floating_ip_address.is_empty())
            {
                debug!(
                    "Floating IP {} already allocated to port {}",
                    fip.floating_ip_address, port
                );
                return Ok((fip.id, fip.floating_ip_address));
            }
        }

        let fip = self
            .network
            .create_floating_ip(&NewFloatingIp {
                floating_network_id: network_id.to_string(),
                subnet_id: self.defaults.external_svc_subnet.clone(),
                project_id: project_id.to_string(),
                port_id: None,
                description: FIP_DESCRIPTION.to_string(),
            })
            .await?;
        if !self.defaults.resource_tags.is_empty() {
            self.network
                .add_tags("floatingips", &fip.id, &self.defaults.resource_tags)
                .await?;
        }
        Ok((fip.id, fip.floating_ip_address))
    }

    async fn update(&self, fip_id: &str, port_id: Option<&str>) -> Result<()> {
        match self.network.update_floating_ip_port(fip_id, port_id).await {
            Err(e) if e.is_conflict() => {
                warn!(
                    "Conflict assigning floating IP {}, checking whether it is already bound",
                    fip_id
                );
                let Some(port) = port_id else {
                    return Err(e);
                };
                let bound = self.network.list_floating_ips(&[("port_id", port)]).await?;
                if bound.iter().any(|f| f.id == fip_id) {
                    debug!("Floating IP {} already assigned to {}", fip_id, port);
                    Ok(())
                } else {
                    error!("Floating IP {} is bound to another port", fip_id);
                    Err(e)
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl ServicePubIpDriver for FloatingIpDriver {
    async fn acquire_service_pub_ip_info(
        &self,
        spec_type: Option<&str>,
        lb_ip: Option<&str>,
        project_id: &str,
        port_id: Option<&str>,
    ) -> Result<Option<PubIpInfo>> {
        if spec_type != Some("LoadBalancer") {
            return Ok(None);
        }

        if let Some(ip) = lb_ip.filter(|ip| !ip.is_empty()) {
            return match self.available_ip(ip, port_id).await? {
                Some(id) => Ok(Some(PubIpInfo {
                    ip_id: id,
                    ip_addr: ip.to_string(),
                    alloc_method: AllocMethod::User,
                })),
                None => {
                    error!("Floating IP {} is not available", ip);
                    Ok(None)
                }
            };
        }

        debug!("Allocating a public IP from the pool");
        let network_id = self.defaults.external_svc_net.as_deref().ok_or_else(|| {
            Error::ConfigError("neutron_defaults.external_svc_net is not set".to_string())
        })?;
        match self.allocate_ip(network_id, project_id, port_id).await {
            Ok((ip_id, ip_addr)) => Ok(Some(PubIpInfo {
                ip_id,
                ip_addr,
                alloc_method: AllocMethod::Pool,
            })),
            Err(e) => {
                error!("Failed to allocate a public IP on {}: {}", network_id, e);
                Ok(None)
            }
        }
    }

    async fn associate_pub_ip(&self, info: &PubIpInfo, vip_port_id: &str) -> Result<()> {
        if info.ip_id.is_empty() || vip_port_id.is_empty() {
            return Ok(());
        }
        self.update(&info.ip_id, Some(vip_port_id)).await
    }

    async fn disassociate_pub_ip(&self, info: &PubIpInfo) -> Result<()> {
        if info.ip_id.is_empty() {
            return Ok(());
        }
        match self.update(&info.ip_id, None).await {
            Err(e) if e.is_not_found() => {
                debug!("Floating IP {} is already gone", info.ip_id);
                Ok(())
            }
            other => other,
        }
    }

    async fn release_pub_ip(&self, info: &PubIpInfo) -> bool {
        if info.alloc_method != AllocMethod::Pool {
            return true;
        }
        match self.network.delete_floating_ip(&info.ip_id).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                error!("Failed to delete floating IP {}: {}", info.ip_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openstack::fake::FakeCloud;
    use crate::openstack::FloatingIp;

    fn driver(cloud: Arc<FakeCloud>) -> FloatingIpDriver {
        FloatingIpDriver::new(
            cloud,
            NeutronDefaults {
                external_svc_net: Some("public".to_string()),
                ..Default::default()
            },
        )
    }

    fn fip(id: &str, addr: &str, port: Option<&str>) -> FloatingIp {
        FloatingIp {
            id: id.to_string(),
            floating_ip_address: addr.to_string(),
            floating_network_id: "public".to_string(),
            port_id: port.map(str::to_string),
            project_id: "p1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_cluster_ip_service_gets_nothing() {
        let cloud = Arc::new(FakeCloud::new());
        let info = driver(cloud.clone())
            .acquire_service_pub_ip_info(Some("ClusterIP"), None, "p1", Some("vip"))
            .await
            .unwrap();
        assert!(info.is_none());
        assert!(cloud.with(|s| s.calls.is_empty()));
    }

    #[tokio::test]
    async fn test_user_ip_must_be_free() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.with(|s| {
            s.floating_ips
                .insert("f1".into(), fip("f1", "172.24.4.100", None));
            s.floating_ips
                .insert("f2".into(), fip("f2", "172.24.4.101", Some("other")));
        });
        let drv = driver(cloud);

        let info = drv
            .acquire_service_pub_ip_info(Some("LoadBalancer"), Some("172.24.4.100"), "p1", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.ip_id, "f1");
        assert_eq!(info.alloc_method, AllocMethod::User);

        let taken = drv
            .acquire_service_pub_ip_info(Some("LoadBalancer"), Some("172.24.4.101"), "p1", None)
            .await
            .unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn test_pool_allocation_and_release() {
        let cloud = Arc::new(FakeCloud::new());
        let drv = driver(cloud.clone());

        let info = drv
            .acquire_service_pub_ip_info(Some("LoadBalancer"), None, "p1", Some("vip-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.alloc_method, AllocMethod::Pool);

        drv.associate_pub_ip(&info, "vip-1").await.unwrap();
        assert_eq!(
            cloud.with(|s| s.floating_ips[&info.ip_id].port_id.clone()),
            Some("vip-1".to_string())
        );

        // a second acquire for the same port reuses the bound IP
        let again = drv
            .acquire_service_pub_ip_info(Some("LoadBalancer"), None, "p1", Some("vip-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.ip_id, info.ip_id);
        assert_eq!(cloud.with(|s| s.calls_to("create_floating_ip").len()), 1);

        assert!(drv.release_pub_ip(&info).await);
        assert!(cloud.with(|s| s.floating_ips.is_empty()));
    }

    #[tokio::test]
    async fn test_user_ip_is_never_freed() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.with(|s| {
            s.floating_ips
                .insert("f1".into(), fip("f1", "172.24.4.100", None))
        });
        let info = PubIpInfo {
            ip_id: "f1".to_string(),
            ip_addr: "172.24.4.100".to_string(),
            alloc_method: AllocMethod::User,
        };
        assert!(driver(cloud.clone()).release_pub_ip(&info).await);
        assert_eq!(cloud.with(|s| s.floating_ips.len()), 1);
    }

    #[tokio::test]
    async fn test_releasing_a_vanished_ip_succeeds() {
        let cloud = Arc::new(FakeCloud::new());
        let info = PubIpInfo {
            ip_id: "f1".to_string(),
            ip_addr: "172.24.4.100".to_string(),
            alloc_method: AllocMethod::Pool,
        };
        let drv = driver(cloud);
        drv.disassociate_pub_ip(&info).await.unwrap();
        assert!(drv.release_pub_ip(&info).await);
    }

    #[tokio::test]
    async fn test_associate_conflict_on_same_port_is_ok() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.with(|s| {
            s.floating_ips
                .insert("f1".into(), fip("f1", "172.24.4.100", Some("vip-1")))
        });
        cloud.fail_once("update_floating_ip_port", 409, "Floating IP f1 is in use");
        let info = PubIpInfo {
            ip_id: "f1".to_string(),
            ip_addr: "172.24.4.100".to_string(),
            alloc_method: AllocMethod::Pool,
        };
        driver(cloud).associate_pub_ip(&info, "vip-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_external_network_is_config_error() {
        let cloud = Arc::new(FakeCloud::new());
        let drv = FloatingIpDriver::new(cloud, NeutronDefaults::default());
        let err = drv
            .acquire_service_pub_ip_info(Some("LoadBalancer"), None, "p1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
