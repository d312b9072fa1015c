use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::error::Result;
use crate::openstack::{NetworkApi, PortQuery};

/// Device owner of ports created for pods
pub const KURYR_DEVICE_OWNER: &str = "compute:kuryr";

/// Access to the Neutron ports backing pods
#[async_trait]
pub trait VifPoolDriver: Send + Sync {
    /// Replace the security groups of every port bound to `pod`
    async fn update_vif_sgs(&self, pod: &Pod, security_groups: &[String]) -> Result<()>;

    /// Strip `sg_id` from the unbound pool ports of `net_id`
    async fn remove_sg_from_pools(&self, sg_id: &str, net_id: &str) -> Result<()>;
}

pub struct NeutronVifPool {
    network: Arc<dyn NetworkApi>,
}

impl NeutronVifPool {
    pub fn new(network: Arc<dyn NetworkApi>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl VifPoolDriver for NeutronVifPool {
    async fn update_vif_sgs(&self, pod: &Pod, security_groups: &[String]) -> Result<()> {
        let Some(uid) = pod.uid() else {
            debug!("Pod {} has no uid yet", pod.name_any());
            return Ok(());
        };
        let ports = self
            .network
            .list_ports(&PortQuery {
                device_id: Some(uid),
                ..Default::default()
            })
            .await?;
        if ports.is_empty() {
            debug!("No ports bound to pod {}", pod.name_any());
        }
        for port in ports {
            if port.security_groups == security_groups {
                continue;
            }
            debug!(
                "Setting security groups {:?} on port {} of pod {}",
                security_groups,
                port.id,
                pod.name_any()
            );
            self.network
                .update_port_security_groups(&port.id, security_groups)
                .await?;
        }
        Ok(())
    }

    async fn remove_sg_from_pools(&self, sg_id: &str, net_id: &str) -> Result<()> {
        let ports = self
            .network
            .list_ports(&PortQuery {
                device_owner: Some(KURYR_DEVICE_OWNER.to_string()),
                network_id: Some(net_id.to_string()),
                ..Default::default()
            })
            .await?;
        for port in ports
            .iter()
            .filter(|p| p.device_id.is_empty())
            .filter(|p| p.security_groups.iter().any(|sg| sg == sg_id))
        {
            info!("Clearing security groups of pooled port {}", port.id);
            self.network.update_port_security_groups(&port.id, &[]).await?;
        }
        Ok(())
    }
}
