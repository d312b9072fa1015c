//! In-memory Neutron and Octavia used by the reconciler tests

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::*;
use super::{LoadBalancerApi, NetworkApi};
use crate::crd::SecurityGroupRule;
use crate::error::{Error, Result};

#[derive(Default)]
pub struct CloudState {
    next_id: u64,
    pub security_groups: BTreeMap<String, SecurityGroup>,
    pub rules: BTreeMap<String, SecurityGroupRule>,
    pub ports: Vec<Port>,
    pub subnets: BTreeMap<String, Subnet>,
    pub floating_ips: BTreeMap<String, FloatingIp>,
    pub load_balancers: BTreeMap<String, LoadBalancer>,
    pub listeners: BTreeMap<String, Listener>,
    pub pools: BTreeMap<String, Pool>,
    /// member id -> (pool id, member)
    pub members: BTreeMap<String, (String, Member)>,
    /// Operation log, e.g. `create_member:10.0.0.5`
    pub calls: Vec<String>,
    /// Operations that fail once with the given status and message
    pub failures: Vec<(String, u16, String)>,
    /// Operations whose next response body cannot be decoded
    pub garbled: Vec<String>,
}

impl CloudState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn record(&mut self, op: &str, arg: &str) -> Result<()> {
        self.calls.push(format!("{}:{}", op, arg));
        if let Some(pos) = self.failures.iter().position(|(name, _, _)| name == op) {
            let (_, status, message) = self.failures.remove(pos);
            return Err(Error::openstack(status, message));
        }
        if let Some(pos) = self.garbled.iter().position(|name| name == op) {
            self.garbled.remove(pos);
            let bad = serde_json::from_str::<serde_json::Value>("<html>").unwrap_err();
            return Err(Error::SerializationError(bad));
        }
        Ok(())
    }

    pub fn rules_of(&self, sg_id: &str) -> Vec<&SecurityGroupRule> {
        self.rules
            .values()
            .filter(|r| r.security_group_id.as_deref() == Some(sg_id))
            .collect()
    }

    pub fn calls_to(&self, op: &str) -> Vec<String> {
        let prefix = format!("{}:", op);
        self.calls
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

#[derive(Default)]
pub struct FakeCloud {
    pub state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut CloudState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn fail_once(&self, op: &str, status: u16, message: &str) {
        self.with(|s| {
            s.failures
                .push((op.to_string(), status, message.to_string()))
        });
    }

    pub fn garble_once(&self, op: &str) {
        self.with(|s| s.garbled.push(op.to_string()));
    }

    pub fn add_subnet(&self, id: &str, cidr: &str) {
        self.with(|s| {
            s.subnets.insert(
                id.to_string(),
                Subnet {
                    id: id.to_string(),
                    name: id.to_string(),
                    network_id: format!("net-{}", id),
                    cidr: cidr.to_string(),
                    ip_version: if cidr.contains(':') { 6 } else { 4 },
                },
            );
        });
    }

    pub fn add_port(&self, port: Port) {
        self.with(|s| s.ports.push(port));
    }
}

fn not_found(what: &str, id: &str) -> Error {
    Error::openstack(404, format!("{} {} could not be found.", what, id))
}

fn matches_filters(filters: &[(&str, &str)], field: impl Fn(&str) -> Option<String>) -> bool {
    filters
        .iter()
        .all(|(key, value)| match field(key) {
            Some(actual) => actual == *value,
            None => true,
        })
}

#[async_trait]
impl NetworkApi for FakeCloud {
    async fn create_security_group(&self, req: &NewSecurityGroup) -> Result<SecurityGroup> {
        self.with(|s| {
            s.record("create_security_group", &req.name)?;
            let sg = SecurityGroup {
                id: s.id("sg"),
                name: req.name.clone(),
                project_id: req.project_id.clone(),
                description: req.description.clone(),
                tags: Vec::new(),
            };
            s.security_groups.insert(sg.id.clone(), sg.clone());
            Ok(sg)
        })
    }

    async fn delete_security_group(&self, id: &str) -> Result<()> {
        self.with(|s| {
            s.record("delete_security_group", id)?;
            s.security_groups
                .remove(id)
                .ok_or_else(|| not_found("Security group", id))?;
            s.rules
                .retain(|_, r| r.security_group_id.as_deref() != Some(id));
            Ok(())
        })
    }

    async fn list_security_groups(&self, filters: &[(&str, &str)]) -> Result<Vec<SecurityGroup>> {
        self.with(|s| {
            Ok(s.security_groups
                .values()
                .filter(|sg| {
                    matches_filters(filters, |key| match key {
                        "name" => Some(sg.name.clone()),
                        "project_id" => Some(sg.project_id.clone()),
                        _ => None,
                    })
                })
                .cloned()
                .collect())
        })
    }

    async fn create_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<SecurityGroupRule> {
        self.with(|s| {
            s.record("create_security_group_rule", &rule.to_string())?;
            let existing = s.rules.iter().find(|(_, r)| {
                *r == rule && r.security_group_id == rule.security_group_id
            });
            if let Some((id, _)) = existing {
                return Err(Error::openstack(
                    409,
                    format!("Security group rule already exists. Rule id is {}.", id),
                ));
            }
            let mut created = rule.clone();
            created.id = Some(s.id("rule"));
            s.rules
                .insert(created.id.clone().unwrap_or_default(), created.clone());
            Ok(created)
        })
    }

    async fn delete_security_group_rule(&self, id: &str) -> Result<()> {
        self.with(|s| {
            s.record("delete_security_group_rule", id)?;
            s.rules
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| not_found("Security group rule", id))
        })
    }

    async fn list_security_group_rules(
        &self,
        security_group_id: &str,
    ) -> Result<Vec<SecurityGroupRule>> {
        self.with(|s| Ok(s.rules_of(security_group_id).into_iter().cloned().collect()))
    }

    async fn get_port(&self, id: &str) -> Result<Port> {
        self.with(|s| {
            s.ports
                .iter()
                .find(|p| p.id == id)
                .cloned()
                .ok_or_else(|| not_found("Port", id))
        })
    }

    async fn list_ports(&self, query: &PortQuery) -> Result<Vec<Port>> {
        self.with(|s| {
            Ok(s.ports
                .iter()
                .filter(|p| {
                    query.device_id.as_ref().map_or(true, |v| &p.device_id == v)
                        && query
                            .device_owner
                            .as_ref()
                            .map_or(true, |v| &p.device_owner == v)
                        && query.network_id.as_ref().map_or(true, |v| &p.network_id == v)
                        && query.tags.iter().all(|t| p.tags.contains(t))
                })
                .cloned()
                .collect())
        })
    }

    async fn update_port_security_groups(
        &self,
        port_id: &str,
        security_groups: &[String],
    ) -> Result<()> {
        self.with(|s| {
            s.record("update_port_security_groups", port_id)?;
            let port = s
                .ports
                .iter_mut()
                .find(|p| p.id == port_id)
                .ok_or_else(|| not_found("Port", port_id))?;
            port.security_groups = security_groups.to_vec();
            Ok(())
        })
    }

    async fn get_subnet(&self, id: &str) -> Result<Subnet> {
        self.with(|s| {
            s.subnets
                .get(id)
                .cloned()
                .ok_or_else(|| not_found("Subnet", id))
        })
    }

    async fn list_floating_ips(&self, filters: &[(&str, &str)]) -> Result<Vec<FloatingIp>> {
        self.with(|s| {
            Ok(s.floating_ips
                .values()
                .filter(|f| {
                    matches_filters(filters, |key| match key {
                        "floating_ip_address" => Some(f.floating_ip_address.clone()),
                        "port_id" => Some(f.port_id.clone().unwrap_or_default()),
                        "floating_network_id" => Some(f.floating_network_id.clone()),
                        _ => None,
                    })
                })
                .cloned()
                .collect())
        })
    }

    async fn create_floating_ip(&self, req: &NewFloatingIp) -> Result<FloatingIp> {
        self.with(|s| {
            s.record("create_floating_ip", &req.floating_network_id)?;
            let n = s.floating_ips.len() + 10;
            let fip = FloatingIp {
                id: s.id("fip"),
                floating_ip_address: format!("172.24.4.{}", n),
                floating_network_id: req.floating_network_id.clone(),
                port_id: req.port_id.clone(),
                project_id: req.project_id.clone(),
            };
            s.floating_ips.insert(fip.id.clone(), fip.clone());
            Ok(fip)
        })
    }

    async fn update_floating_ip_port(&self, id: &str, port_id: Option<&str>) -> Result<()> {
        self.with(|s| {
            s.record("update_floating_ip_port", id)?;
            let fip = s
                .floating_ips
                .get_mut(id)
                .ok_or_else(|| not_found("Floating IP", id))?;
            fip.port_id = port_id.map(str::to_string);
            Ok(())
        })
    }

    async fn delete_floating_ip(&self, id: &str) -> Result<()> {
        self.with(|s| {
            s.record("delete_floating_ip", id)?;
            s.floating_ips
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| not_found("Floating IP", id))
        })
    }

    async fn add_tags(&self, resource: &str, id: &str, tags: &[String]) -> Result<()> {
        self.with(|s| {
            s.record("add_tags", &format!("{}/{}", resource, id))?;
            if resource == "security-groups" {
                if let Some(sg) = s.security_groups.get_mut(id) {
                    sg.tags.extend(tags.iter().cloned());
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl LoadBalancerApi for FakeCloud {
    async fn create_load_balancer(&self, req: &NewLoadBalancer) -> Result<LoadBalancer> {
        self.with(|s| {
            s.record("create_load_balancer", &req.name)?;
            let id = s.id("lb");
            let lb = LoadBalancer {
                vip_port_id: Some(format!("vip-{}", id)),
                id,
                name: req.name.clone(),
                project_id: req.project_id.clone(),
                vip_address: req.vip_address.clone(),
                vip_subnet_id: req.vip_subnet_id.clone(),
                provider: req.provider.clone(),
                provisioning_status: provisioning::ACTIVE.to_string(),
                tags: req.tags.clone(),
            };
            s.ports.push(Port {
                id: lb.vip_port_id.clone().unwrap_or_default(),
                name: format!("octavia-lb-{}", lb.id),
                device_owner: "Octavia".to_string(),
                fixed_ips: vec![FixedIp {
                    subnet_id: req.vip_subnet_id.clone(),
                    ip_address: req.vip_address.clone(),
                }],
                ..Default::default()
            });
            s.load_balancers.insert(lb.id.clone(), lb.clone());
            Ok(lb)
        })
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        self.with(|s| {
            s.load_balancers
                .get(id)
                .cloned()
                .ok_or_else(|| not_found("Load Balancer", id))
        })
    }

    async fn list_load_balancers(&self, filters: &[(&str, &str)]) -> Result<Vec<LoadBalancer>> {
        self.with(|s| {
            Ok(s.load_balancers
                .values()
                .filter(|lb| {
                    matches_filters(filters, |key| match key {
                        "name" => Some(lb.name.clone()),
                        "project_id" => Some(lb.project_id.clone()),
                        "vip_address" => Some(lb.vip_address.clone()),
                        "vip_subnet_id" => Some(lb.vip_subnet_id.clone()),
                        "tags" if lb.tags.is_empty() => Some(String::new()),
                        "tags" => Some(lb.tags.join(",")),
                        _ => None,
                    })
                })
                .cloned()
                .collect())
        })
    }

    async fn delete_load_balancer(&self, id: &str, cascade: bool) -> Result<()> {
        self.with(|s| {
            s.record("delete_load_balancer", id)?;
            s.load_balancers
                .remove(id)
                .ok_or_else(|| not_found("Load Balancer", id))?;
            if cascade {
                let listeners: Vec<String> = s
                    .listeners
                    .iter()
                    .filter(|(_, l)| l.loadbalancers.iter().any(|r| r.id == id))
                    .map(|(k, _)| k.clone())
                    .collect();
                let pools: Vec<String> = s
                    .pools
                    .iter()
                    .filter(|(_, p)| p.loadbalancers.iter().any(|r| r.id == id))
                    .map(|(k, _)| k.clone())
                    .collect();
                for l in listeners {
                    s.listeners.remove(&l);
                }
                s.members.retain(|_, (pool_id, _)| !pools.contains(pool_id));
                for p in pools {
                    s.pools.remove(&p);
                }
            }
            Ok(())
        })
    }

    async fn create_listener(&self, req: &NewListener) -> Result<Listener> {
        self.with(|s| {
            s.record("create_listener", &req.name)?;
            let listener = Listener {
                id: s.id("listener"),
                name: req.name.clone(),
                project_id: req.project_id.clone(),
                protocol: req.protocol.clone(),
                protocol_port: req.protocol_port,
                loadbalancers: vec![IdRef {
                    id: req.loadbalancer_id.clone(),
                }],
                tags: req.tags.clone(),
            };
            s.listeners.insert(listener.id.clone(), listener.clone());
            Ok(listener)
        })
    }

    async fn list_listeners(&self, filters: &[(&str, &str)]) -> Result<Vec<Listener>> {
        self.with(|s| {
            Ok(s.listeners
                .values()
                .filter(|l| {
                    matches_filters(filters, |key| match key {
                        "name" => Some(l.name.clone()),
                        "protocol" => Some(l.protocol.clone()),
                        "protocol_port" => Some(l.protocol_port.to_string()),
                        "loadbalancer_id" => {
                            Some(l.loadbalancers.first().map(|r| r.id.clone()).unwrap_or_default())
                        }
                        _ => None,
                    })
                })
                .cloned()
                .collect())
        })
    }

    async fn delete_listener(&self, id: &str) -> Result<()> {
        self.with(|s| {
            s.record("delete_listener", id)?;
            s.listeners
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| not_found("Listener", id))
        })
    }

    async fn create_pool(&self, req: &NewPool) -> Result<Pool> {
        self.with(|s| {
            s.record("create_pool", &req.name)?;
            let lb_id = s
                .listeners
                .get(&req.listener_id)
                .and_then(|l| l.loadbalancers.first().cloned())
                .ok_or_else(|| not_found("Listener", &req.listener_id))?;
            let pool = Pool {
                id: s.id("pool"),
                name: req.name.clone(),
                project_id: req.project_id.clone(),
                protocol: req.protocol.clone(),
                lb_algorithm: req.lb_algorithm.clone(),
                listeners: vec![IdRef {
                    id: req.listener_id.clone(),
                }],
                loadbalancers: vec![lb_id],
                members: Vec::new(),
                tags: req.tags.clone(),
            };
            s.pools.insert(pool.id.clone(), pool.clone());
            Ok(pool)
        })
    }

    async fn list_pools(&self, filters: &[(&str, &str)]) -> Result<Vec<Pool>> {
        self.with(|s| {
            Ok(s.pools
                .values()
                .filter(|p| {
                    matches_filters(filters, |key| match key {
                        "name" => Some(p.name.clone()),
                        "protocol" => Some(p.protocol.clone()),
                        "listener_id" => {
                            Some(p.listeners.first().map(|r| r.id.clone()).unwrap_or_default())
                        }
                        "loadbalancer_id" => {
                            Some(p.loadbalancers.first().map(|r| r.id.clone()).unwrap_or_default())
                        }
                        _ => None,
                    })
                })
                .cloned()
                .collect())
        })
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        self.with(|s| {
            s.record("delete_pool", id)?;
            s.pools.remove(id).ok_or_else(|| not_found("Pool", id))?;
            s.members.retain(|_, (pool_id, _)| pool_id != id);
            Ok(())
        })
    }

    async fn create_member(&self, pool_id: &str, req: &NewMember) -> Result<Member> {
        self.with(|s| {
            s.record("create_member", &format!("{}:{}", req.address, req.protocol_port))?;
            if !s.pools.contains_key(pool_id) {
                return Err(not_found("Pool", pool_id));
            }
            let member = Member {
                id: s.id("member"),
                name: req.name.clone(),
                project_id: req.project_id.clone(),
                address: req.address.clone(),
                protocol_port: req.protocol_port,
                subnet_id: Some(req.subnet_id.clone()),
                tags: req.tags.clone(),
            };
            s.members
                .insert(member.id.clone(), (pool_id.to_string(), member.clone()));
            Ok(member)
        })
    }

    async fn list_members(&self, pool_id: &str, filters: &[(&str, &str)]) -> Result<Vec<Member>> {
        self.with(|s| {
            if !s.pools.contains_key(pool_id) {
                return Err(not_found("Pool", pool_id));
            }
            Ok(s.members
                .values()
                .filter(|(p, m)| {
                    p == pool_id
                        && matches_filters(filters, |key| match key {
                            "name" => Some(m.name.clone()),
                            "address" => Some(m.address.clone()),
                            "protocol_port" => Some(m.protocol_port.to_string()),
                            _ => None,
                        })
                })
                .map(|(_, m)| m.clone())
                .collect())
        })
    }

    async fn delete_member(&self, pool_id: &str, id: &str) -> Result<()> {
        self.with(|s| {
            s.record("delete_member", id)?;
            match s.members.get(id) {
                Some((p, _)) if p == pool_id => {
                    s.members.remove(id);
                    Ok(())
                }
                _ => Err(not_found("Member", id)),
            }
        })
    }
}
