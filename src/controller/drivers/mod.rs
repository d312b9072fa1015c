//! Pluggable drivers selected by name in the configuration
//!
//! Each concern (project, security groups, subnets, ports, public IPs, load
//! balancers) sits behind a trait; [`Drivers::from_config`] picks the
//! implementation named in `[kubernetes]`.

pub mod lbaas;
pub mod project;
pub mod public_ip;
pub mod security_groups;
pub mod subnets;
pub mod vif_pool;

use std::sync::Arc;

use crate::config::Config;
use crate::controller::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::openstack::{LoadBalancerApi, NetworkApi};

pub use lbaas::{LbaasDriver, OctaviaDriver};
pub use project::{DefaultProjectDriver, ProjectDriver};
pub use public_ip::{FloatingIpDriver, ServicePubIpDriver};
pub use security_groups::{
    DefaultPodSecurityGroupsDriver, DefaultServiceSecurityGroupsDriver,
    PodSecurityGroupsDriver, PolicyPodSecurityGroupsDriver, PolicyServiceSecurityGroupsDriver,
    ServiceSecurityGroupsDriver,
};
pub use subnets::{
    DefaultPodSubnetDriver, DefaultServiceSubnetDriver, NamespacePodSubnetDriver,
    PodSubnetsDriver, ServiceSubnetsDriver, SubnetCache,
};
pub use vif_pool::{NeutronVifPool, VifPoolDriver};

#[derive(Clone)]
pub struct Drivers {
    pub project: Arc<dyn ProjectDriver>,
    pub pod_sg: Arc<dyn PodSecurityGroupsDriver>,
    pub service_sg: Arc<dyn ServiceSecurityGroupsDriver>,
    pub pod_subnets: Arc<dyn PodSubnetsDriver>,
    pub service_subnets: Arc<dyn ServiceSubnetsDriver>,
    pub vif_pool: Arc<dyn VifPoolDriver>,
    pub pub_ip: Arc<dyn ServicePubIpDriver>,
    pub lbaas: Arc<dyn LbaasDriver>,
}

fn unknown(option: &str, value: &str) -> Error {
    Error::ConfigError(format!("unknown {} '{}'", option, value))
}

impl Drivers {
    pub fn from_config(
        config: Arc<Config>,
        cluster: Arc<dyn ClusterApi>,
        network: Arc<dyn NetworkApi>,
        lb: Arc<dyn LoadBalancerApi>,
    ) -> Result<Self> {
        let k8s = &config.kubernetes;
        let defaults = config.neutron_defaults.pod_security_groups.clone();
        let cache = Arc::new(SubnetCache::new(network.clone()));

        let pod_sg: Arc<dyn PodSecurityGroupsDriver> =
            match k8s.pod_security_groups_driver.as_str() {
                "default" => Arc::new(DefaultPodSecurityGroupsDriver::new(defaults.clone())),
                "policy" => Arc::new(PolicyPodSecurityGroupsDriver::new(
                    cluster.clone(),
                    defaults.clone(),
                )),
                other => return Err(unknown("pod_security_groups_driver", other)),
            };
        let service_sg: Arc<dyn ServiceSecurityGroupsDriver> =
            match k8s.service_security_groups_driver.as_str() {
                "default" => Arc::new(DefaultServiceSecurityGroupsDriver::new(defaults.clone())),
                "policy" => Arc::new(PolicyServiceSecurityGroupsDriver::new(
                    cluster.clone(),
                    defaults,
                )),
                other => return Err(unknown("service_security_groups_driver", other)),
            };
        let pod_subnets: Arc<dyn PodSubnetsDriver> = match k8s.pod_subnets_driver.as_str() {
            "default" => Arc::new(DefaultPodSubnetDriver::new(
                config.neutron_defaults.pod_subnet.clone(),
                cache.clone(),
            )),
            "namespace" => Arc::new(NamespacePodSubnetDriver::new(cluster.clone(), cache.clone())),
            other => return Err(unknown("pod_subnets_driver", other)),
        };

        Ok(Self {
            project: Arc::new(DefaultProjectDriver::new(
                config.neutron_defaults.project.clone(),
            )),
            pod_sg,
            service_sg,
            pod_subnets,
            service_subnets: Arc::new(DefaultServiceSubnetDriver::new(
                config.neutron_defaults.service_subnet.clone(),
                cache,
            )),
            vif_pool: Arc::new(NeutronVifPool::new(network.clone())),
            pub_ip: Arc::new(FloatingIpDriver::new(
                network.clone(),
                config.neutron_defaults.clone(),
            )),
            lbaas: Arc::new(OctaviaDriver::new(lb, network, cluster, config)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::cluster::fake::FakeCluster;
    use crate::openstack::fake::FakeCloud;

    fn build(config: Config) -> Result<Drivers> {
        let cloud = Arc::new(FakeCloud::new());
        Drivers::from_config(
            Arc::new(config),
            Arc::new(FakeCluster::new()),
            cloud.clone(),
            cloud,
        )
    }

    #[test]
    fn test_default_configuration_builds() {
        assert!(build(Config::default()).is_ok());
    }

    #[test]
    fn test_unknown_driver_is_rejected() {
        let mut config = Config::default();
        config.kubernetes.pod_subnets_driver = "multi_vif".to_string();
        match build(config) {
            Err(Error::ConfigError(msg)) => assert!(msg.contains("pod_subnets_driver")),
            _ => panic!("expected a configuration error"),
        }
    }
}
