//! Controller configuration
//!
//! Loaded from a TOML file whose sections mirror the option groups the
//! controller has always used (`[kubernetes]`, `[neutron_defaults]`,
//! `[octavia_defaults]`, `[pod_vif_nested]`, `[openstack]`). Every field has a
//! default so an empty file is a valid, if not very useful, configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Load balancer provider names that belong to the Amphora family
pub const OCTAVIA_DEFAULT_PROVIDERS: &[&str] = &["octavia", "amphora"];

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub kubernetes: KubernetesConfig,
    pub neutron_defaults: NeutronDefaults,
    pub octavia_defaults: OctaviaDefaults,
    pub pod_vif_nested: PodVifNested,
    pub openstack: OpenStackConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Handlers to run: any of `policy`, `kuryrnetworkpolicy`, `service`,
    /// `kuryrloadbalancer`
    pub enabled_handlers: Vec<String>,
    pub pod_security_groups_driver: String,
    pub service_security_groups_driver: String,
    pub pod_subnets_driver: String,
    /// `default` keeps the `amphora` provider
    pub endpoints_driver_octavia_provider: String,
    /// Seconds spent retrying a load balancer release before giving up
    pub watch_retry_timeout: u64,
    pub controller_ha: bool,
    /// Seconds between two reconciliation sweeps
    pub reconcile_interval: u64,
    pub max_fatal_retries: u32,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled_handlers: vec![
                "policy".to_string(),
                "kuryrnetworkpolicy".to_string(),
                "service".to_string(),
                "kuryrloadbalancer".to_string(),
            ],
            pod_security_groups_driver: "default".to_string(),
            service_security_groups_driver: "default".to_string(),
            pod_subnets_driver: "default".to_string(),
            endpoints_driver_octavia_provider: "default".to_string(),
            watch_retry_timeout: 60,
            controller_ha: false,
            reconcile_interval: 600,
            max_fatal_retries: 5,
        }
    }
}

impl KubernetesConfig {
    pub fn handler_enabled(&self, name: &str) -> bool {
        self.enabled_handlers.iter().any(|h| h == name)
    }

    /// Provider requested for new load balancers
    pub fn lb_provider(&self) -> String {
        if self.endpoints_driver_octavia_provider == "default" {
            "amphora".to_string()
        } else {
            self.endpoints_driver_octavia_provider.clone()
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NeutronDefaults {
    pub project: Option<String>,
    pub pod_subnet: Option<String>,
    pub pod_security_groups: Vec<String>,
    pub service_subnet: Option<String>,
    pub external_svc_net: Option<String>,
    pub external_svc_subnet: Option<String>,
    pub resource_tags: Vec<String>,
    /// Seconds to wait for a load balancer to become ACTIVE
    pub lbaas_activation_timeout: u64,
}

impl Default for NeutronDefaults {
    fn default() -> Self {
        Self {
            project: None,
            pod_subnet: None,
            pod_security_groups: Vec::new(),
            service_subnet: None,
            external_svc_net: None,
            external_svc_subnet: None,
            resource_tags: Vec::new(),
            lbaas_activation_timeout: 300,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum MemberMode {
    #[default]
    L3,
    L2,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SgMode {
    #[default]
    Allocate,
    Create,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OctaviaDefaults {
    pub member_mode: MemberMode,
    pub sg_mode: SgMode,
    pub enforce_sg_rules: bool,
    pub double_listeners_supported: bool,
    pub sctp_supported: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PodVifNested {
    pub worker_nodes_subnet: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OpenStackConfig {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain_name: String,
    pub project_name: String,
    pub project_domain_name: String,
    pub region_name: Option<String>,
    /// Catalog interface to use (`public`, `internal`, `admin`)
    pub interface: String,
    pub network_endpoint: Option<String>,
    pub load_balancer_endpoint: Option<String>,
    /// HTTP request timeout in seconds
    pub timeout: u64,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://127.0.0.1/identity".to_string(),
            username: "kuryr".to_string(),
            password: String::new(),
            user_domain_name: "Default".to_string(),
            project_name: "service".to_string(),
            project_domain_name: "Default".to_string(),
            region_name: None,
            interface: "public".to_string(),
            network_endpoint: None,
            load_balancer_endpoint: None,
            timeout: 30,
        }
    }
}

impl Config {
    /// Read and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| Error::ConfigError(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let k8s = &self.kubernetes;
        let uses_policy = k8s.pod_security_groups_driver == "policy"
            || k8s.service_security_groups_driver == "policy";
        if uses_policy && self.neutron_defaults.pod_security_groups.is_empty() {
            return Err(Error::ConfigError(
                "neutron_defaults.pod_security_groups is required by the policy security group drivers"
                    .to_string(),
            ));
        }
        if k8s.reconcile_interval == 0 {
            return Err(Error::ConfigError(
                "kubernetes.reconcile_interval must be greater than zero".to_string(),
            ));
        }
        if self.octavia_defaults.member_mode == MemberMode::L2
            && self.neutron_defaults.pod_subnet.is_none()
            && k8s.pod_subnets_driver == "default"
        {
            return Err(Error::ConfigError(
                "neutron_defaults.pod_subnet is required for L2 member mode".to_string(),
            ));
        }
        Ok(())
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.neutron_defaults.lbaas_activation_timeout)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.kubernetes.reconcile_interval)
    }

    pub fn watch_retry_timeout(&self) -> Duration {
        Duration::from_secs(self.kubernetes.watch_retry_timeout)
    }

    /// Network policies are reflected onto load balancers only when the
    /// policy service driver is in use
    pub fn enforces_service_policies(&self) -> bool {
        self.octavia_defaults.enforce_sg_rules
            && self.kubernetes.service_security_groups_driver == "policy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.kubernetes.reconcile_interval, 600);
        assert_eq!(config.kubernetes.lb_provider(), "amphora");
        assert_eq!(config.octavia_defaults.member_mode, MemberMode::L3);
        assert!(config.kubernetes.handler_enabled("kuryrloadbalancer"));
        // the built-in defaults must pass their own validation
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[kubernetes]
endpoints_driver_octavia_provider = "ovn"
service_security_groups_driver = "policy"
reconcile_interval = 120

[neutron_defaults]
project = "p1"
pod_security_groups = ["sg-default"]
service_subnet = "svc-subnet"
pod_subnet = "pod-subnet"
resource_tags = ["k8s"]

[octavia_defaults]
member_mode = "L2"
sg_mode = "create"
enforce_sg_rules = true

[pod_vif_nested]
worker_nodes_subnet = "workers"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.kubernetes.lb_provider(), "ovn");
        assert_eq!(config.reconcile_interval(), Duration::from_secs(120));
        assert_eq!(config.neutron_defaults.project.as_deref(), Some("p1"));
        assert_eq!(config.octavia_defaults.sg_mode, SgMode::Create);
        assert_eq!(config.octavia_defaults.member_mode, MemberMode::L2);
        assert!(config.enforces_service_policies());
        assert_eq!(
            config.pod_vif_nested.worker_nodes_subnet.as_deref(),
            Some("workers")
        );
    }

    #[test]
    fn test_policy_driver_requires_default_groups() {
        let err = Config::from_toml("[kubernetes]\npod_security_groups_driver = \"policy\"\n")
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));

        let ok = Config::from_toml(
            "[kubernetes]\npod_security_groups_driver = \"default\"\nservice_security_groups_driver = \"default\"\n",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_l2_members_need_a_pod_subnet() {
        let err = Config::from_toml("[octavia_defaults]\nmember_mode = \"L2\"\n").unwrap_err();
        assert!(err.to_string().contains("pod_subnet"));

        let ok = Config::from_toml(
            "[kubernetes]\npod_subnets_driver = \"namespace\"\n\n[octavia_defaults]\nmember_mode = \"L2\"\n",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/kuryr.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
