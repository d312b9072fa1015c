//! OpenStack cloud access
//!
//! The controllers talk to Neutron and Octavia only through [`NetworkApi`]
//! and [`LoadBalancerApi`]. [`OpenStackClient`] implements both over HTTP;
//! tests use the in-memory cloud in [`fake`].

mod client;
#[cfg(test)]
pub mod fake;
pub mod types;

use async_trait::async_trait;

use crate::crd::SecurityGroupRule;
use crate::error::Result;

pub use client::OpenStackClient;
pub use types::*;

/// Neutron operations
#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn create_security_group(&self, req: &NewSecurityGroup) -> Result<SecurityGroup>;
    async fn delete_security_group(&self, id: &str) -> Result<()>;
    async fn list_security_groups(&self, filters: &[(&str, &str)]) -> Result<Vec<SecurityGroup>>;

    /// Returns the created rule with its id. A duplicate rule fails with a
    /// 409 whose message names the existing rule id.
    async fn create_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<SecurityGroupRule>;
    async fn delete_security_group_rule(&self, id: &str) -> Result<()>;
    async fn list_security_group_rules(&self, security_group_id: &str)
        -> Result<Vec<SecurityGroupRule>>;

    async fn get_port(&self, id: &str) -> Result<Port>;
    async fn list_ports(&self, query: &PortQuery) -> Result<Vec<Port>>;
    async fn update_port_security_groups(
        &self,
        port_id: &str,
        security_groups: &[String],
    ) -> Result<()>;

    async fn get_subnet(&self, id: &str) -> Result<Subnet>;

    async fn list_floating_ips(&self, filters: &[(&str, &str)]) -> Result<Vec<FloatingIp>>;
    async fn create_floating_ip(&self, req: &NewFloatingIp) -> Result<FloatingIp>;
    /// Bind the floating IP to a port, or unbind it with `None`
    async fn update_floating_ip_port(&self, id: &str, port_id: Option<&str>) -> Result<()>;
    async fn delete_floating_ip(&self, id: &str) -> Result<()>;

    /// Add tags to a taggable resource collection such as `security-groups`
    async fn add_tags(&self, resource: &str, id: &str, tags: &[String]) -> Result<()>;
}

/// Octavia operations
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    async fn create_load_balancer(&self, req: &NewLoadBalancer) -> Result<LoadBalancer>;
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer>;
    async fn list_load_balancers(&self, filters: &[(&str, &str)]) -> Result<Vec<LoadBalancer>>;
    async fn delete_load_balancer(&self, id: &str, cascade: bool) -> Result<()>;

    async fn create_listener(&self, req: &NewListener) -> Result<Listener>;
    async fn list_listeners(&self, filters: &[(&str, &str)]) -> Result<Vec<Listener>>;
    async fn delete_listener(&self, id: &str) -> Result<()>;

    async fn create_pool(&self, req: &NewPool) -> Result<Pool>;
    async fn list_pools(&self, filters: &[(&str, &str)]) -> Result<Vec<Pool>>;
    async fn delete_pool(&self, id: &str) -> Result<()>;

    async fn create_member(&self, pool_id: &str, req: &NewMember) -> Result<Member>;
    async fn list_members(&self, pool_id: &str, filters: &[(&str, &str)]) -> Result<Vec<Member>>;
    async fn delete_member(&self, pool_id: &str, id: &str) -> Result<()>;
}
