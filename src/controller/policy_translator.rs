//! NetworkPolicy to security group rule translation
//!
//! Produces the ordered ingress and egress rule lists for one policy.
//! Selectors are resolved against the cluster at translation time, so the
//! result changes whenever the selected pods, namespaces or services do.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::cidr;
use super::cluster::ClusterApi;
use super::selector::{self, PolicyType};
use super::sg_rules::{allow_all, build_rule, host_cidr, rule_spec};
use crate::config::Config;
use crate::crd::{AffectedPod, Direction, KuryrNetworkPolicySpec, RuleSpec};
use crate::error::Result;
use crate::openstack::NetworkApi;

/// A resolved policy peer
#[derive(Clone, Debug)]
enum Peer {
    Pod(Pod),
    /// Every pod of a namespace
    Namespace(String),
    Cidr(String),
}

#[derive(Debug, Default)]
struct ResolvedPeers {
    peers: Vec<Peer>,
    allow_all: bool,
}

/// One remote prefix and the metadata recorded with rules targeting it
struct Remote {
    cidr: String,
    namespace: Option<String>,
    pods: Vec<AffectedPod>,
}

/// Port and protocol of one `ports` entry; `None` port means every port
#[derive(Clone, Debug)]
enum PortSpec {
    All,
    Numeric {
        min: Option<u16>,
        max: Option<u16>,
        protocol: String,
    },
    Named {
        name: String,
        protocol: String,
    },
}

fn affected(pod: &Pod) -> Option<AffectedPod> {
    let ip = pod.status.as_ref()?.pod_ip.clone()?;
    Some(AffectedPod {
        pod_ip: ip,
        pod_namespace: pod.namespace().unwrap_or_default(),
    })
}

fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

fn port_spec(port: &NetworkPolicyPort) -> PortSpec {
    let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
    match &port.port {
        None => PortSpec::Numeric {
            min: None,
            max: None,
            protocol,
        },
        Some(IntOrString::Int(n)) => {
            let min = u16::try_from(*n).ok();
            let max = port.end_port.and_then(|e| u16::try_from(e).ok()).or(min);
            PortSpec::Numeric { min, max, protocol }
        }
        Some(IntOrString::String(name)) => PortSpec::Named {
            name: name.clone(),
            protocol,
        },
    }
}

/// Container ports of `pod` named `name` with a matching protocol
pub fn named_container_ports(pod: &Pod, name: &str, protocol: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .filter(|p| p.name.as_deref() == Some(name))
        .filter(|p| p.protocol.as_deref().unwrap_or("TCP").eq_ignore_ascii_case(protocol))
        .filter_map(|p| u16::try_from(p.container_port).ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn push_unique(rules: &mut Vec<RuleSpec>, rule: RuleSpec) {
    if !rules.contains(&rule) {
        rules.push(rule);
    }
}

pub struct PolicyTranslator {
    cluster: Arc<dyn ClusterApi>,
    network: Arc<dyn NetworkApi>,
    config: Arc<Config>,
}

impl PolicyTranslator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        network: Arc<dyn NetworkApi>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cluster,
            network,
            config,
        }
    }

    /// Build the KuryrNetworkPolicy spec for `policy`
    pub async fn knp_spec(&self, policy: &NetworkPolicy) -> Result<KuryrNetworkPolicySpec> {
        let (ingress, egress) = self.translate(policy).await?;
        let spec = policy.spec.clone().unwrap_or_default();
        let policy_types = selector::policy_types(&spec)
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        Ok(KuryrNetworkPolicySpec {
            ingress_sg_rules: ingress,
            egress_sg_rules: egress,
            pod_selector: spec.pod_selector,
            policy_types,
        })
    }

    /// Translate `policy` into `(ingress, egress)` rule lists
    pub async fn translate(
        &self,
        policy: &NetworkPolicy,
    ) -> Result<(Vec<RuleSpec>, Vec<RuleSpec>)> {
        let spec = policy.spec.clone().unwrap_or_default();
        let namespace = policy.namespace().unwrap_or_default();
        let types = selector::policy_types(&spec);

        let mut ingress = Vec::new();
        match &spec.ingress {
            None if !types.contains(&PolicyType::Ingress) => {
                debug!("Policy {}/{} does not restrict ingress", namespace, policy.name_any());
                ingress.push(allow_all(Direction::Ingress));
            }
            None => {}
            Some(blocks) => {
                for block in blocks {
                    self.translate_block(
                        Direction::Ingress,
                        block.from.as_ref(),
                        block.ports.as_ref(),
                        policy,
                        &mut ingress,
                    )
                    .await?;
                }
            }
        }

        let mut egress = Vec::new();
        match &spec.egress {
            None if !types.contains(&PolicyType::Egress) => {
                debug!("Policy {}/{} does not restrict egress", namespace, policy.name_any());
                egress.push(allow_all(Direction::Egress));
            }
            None => {}
            Some(blocks) => {
                for block in blocks {
                    self.translate_block(
                        Direction::Egress,
                        block.to.as_ref(),
                        block.ports.as_ref(),
                        policy,
                        &mut egress,
                    )
                    .await?;
                }
            }
        }

        for rule in self.default_ingress_rules().await? {
            push_unique(&mut ingress, rule);
        }

        Ok((ingress, egress))
    }

    /// Ingress from the service subnet and from the worker nodes
    async fn default_ingress_rules(&self) -> Result<Vec<RuleSpec>> {
        let subnets = [
            self.config.neutron_defaults.service_subnet.as_deref(),
            self.config.pod_vif_nested.worker_nodes_subnet.as_deref(),
        ];
        let mut rules = Vec::new();
        for subnet_id in subnets.into_iter().flatten() {
            let subnet = self.network.get_subnet(subnet_id).await?;
            rules.push(rule_spec(
                build_rule(Direction::Ingress, None, None, None, Some(&subnet.cidr)),
                None,
                Vec::new(),
            ));
        }
        Ok(rules)
    }

    async fn resolve_peers(
        &self,
        peers: Option<&Vec<NetworkPolicyPeer>>,
        namespace: &str,
    ) -> Result<ResolvedPeers> {
        let mut resolved = ResolvedPeers::default();
        let peers = match peers {
            Some(peers) if !peers.is_empty() => peers,
            _ => {
                resolved.allow_all = true;
                return Ok(resolved);
            }
        };

        for peer in peers {
            if let Some(block) = &peer.ip_block {
                let except = block.except.clone().unwrap_or_default();
                for net in cidr::resolve_ip_block(&block.cidr, &except)? {
                    resolved.peers.push(Peer::Cidr(net.to_string()));
                }
                continue;
            }

            let pod_selector = peer
                .pod_selector
                .as_ref()
                .filter(|s| !selector::is_empty(s));
            match (&peer.namespace_selector, &peer.pod_selector) {
                (Some(ns_sel), _) if selector::is_empty(ns_sel) => match pod_selector {
                    Some(pod_sel) => {
                        let pods = self.cluster.list_pods(None, Some(pod_sel)).await?;
                        resolved.peers.extend(pods.into_iter().map(Peer::Pod));
                    }
                    None => resolved.allow_all = true,
                },
                (Some(ns_sel), _) => {
                    let namespaces = self.cluster.list_namespaces(Some(ns_sel)).await?;
                    for ns in namespaces {
                        let name = ns.name_any();
                        match pod_selector {
                            Some(pod_sel) => {
                                let pods = self.cluster.list_pods(Some(&name), Some(pod_sel)).await?;
                                resolved.peers.extend(pods.into_iter().map(Peer::Pod));
                            }
                            None => resolved.peers.push(Peer::Namespace(name)),
                        }
                    }
                }
                (None, Some(_)) if pod_selector.is_some() => {
                    let pods = self.cluster.list_pods(Some(namespace), pod_selector).await?;
                    resolved.peers.extend(pods.into_iter().map(Peer::Pod));
                }
                (None, _) => resolved.peers.push(Peer::Namespace(namespace.to_string())),
            }
        }
        Ok(resolved)
    }

    /// Remote prefixes of a peer. Pods without an IP yield nothing.
    async fn remotes(&self, peer: &Peer) -> Result<Vec<Remote>> {
        match peer {
            Peer::Pod(pod) => Ok(affected(pod)
                .map(|a| Remote {
                    cidr: host_cidr(&a.pod_ip),
                    namespace: pod.namespace(),
                    pods: vec![a],
                })
                .into_iter()
                .collect()),
            Peer::Cidr(cidr) => Ok(vec![Remote {
                cidr: cidr.clone(),
                namespace: None,
                pods: Vec::new(),
            }]),
            Peer::Namespace(name) => {
                let subnet_cidr = match self.cluster.get_kuryr_network(name).await {
                    Ok(kn) => kn.status.and_then(|s| s.subnet_cidr),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                };
                if let Some(cidr) = subnet_cidr {
                    return Ok(vec![Remote {
                        cidr,
                        namespace: Some(name.clone()),
                        pods: Vec::new(),
                    }]);
                }
                debug!("No subnet recorded for namespace {}, using its pod IPs", name);
                let pods = self.cluster.list_pods(Some(name), None).await?;
                Ok(pods
                    .iter()
                    .filter_map(affected)
                    .map(|a| Remote {
                        cidr: host_cidr(&a.pod_ip),
                        namespace: Some(name.clone()),
                        pods: vec![a],
                    })
                    .collect())
            }
        }
    }

    async fn translate_block(
        &self,
        direction: Direction,
        peers: Option<&Vec<NetworkPolicyPeer>>,
        ports: Option<&Vec<NetworkPolicyPort>>,
        policy: &NetworkPolicy,
        rules: &mut Vec<RuleSpec>,
    ) -> Result<()> {
        let namespace = policy.namespace().unwrap_or_default();
        let resolved = self.resolve_peers(peers, &namespace).await?;

        let mut remotes = Vec::new();
        for peer in &resolved.peers {
            remotes.extend(self.remotes(peer).await?);
        }

        let port_specs: Vec<PortSpec> = match ports {
            Some(ports) if !ports.is_empty() => ports.iter().map(port_spec).collect(),
            _ => vec![PortSpec::All],
        };

        for port in port_specs {
            match &port {
                PortSpec::All => {
                    if resolved.allow_all {
                        push_unique(rules, allow_all(direction));
                    }
                    for remote in &remotes {
                        push_unique(
                            rules,
                            rule_spec(
                                build_rule(direction, None, None, None, Some(&remote.cidr)),
                                remote.namespace.as_deref(),
                                remote.pods.clone(),
                            ),
                        );
                    }
                    self.service_egress_rules(direction, &resolved, None, None, None, rules)
                        .await?;
                }
                PortSpec::Numeric { min, max, protocol } => {
                    if resolved.allow_all {
                        push_unique(
                            rules,
                            rule_spec(
                                build_rule(direction, *min, *max, Some(protocol), None),
                                None,
                                Vec::new(),
                            ),
                        );
                    }
                    for remote in &remotes {
                        push_unique(
                            rules,
                            rule_spec(
                                build_rule(direction, *min, *max, Some(protocol), Some(&remote.cidr)),
                                remote.namespace.as_deref(),
                                remote.pods.clone(),
                            ),
                        );
                    }
                    self.service_egress_rules(direction, &resolved, *min, *max, Some(protocol), rules)
                        .await?;
                }
                PortSpec::Named { name, protocol } => match direction {
                    Direction::Ingress => {
                        self.named_port_ingress(policy, &resolved, &remotes, name, protocol, rules)
                            .await?
                    }
                    Direction::Egress => {
                        self.named_port_egress(&resolved, name, protocol, rules).await?
                    }
                },
            }
        }
        Ok(())
    }

    /// Named ports on ingress resolve against the pods the policy selects
    async fn named_port_ingress(
        &self,
        policy: &NetworkPolicy,
        resolved: &ResolvedPeers,
        remotes: &[Remote],
        name: &str,
        protocol: &str,
        rules: &mut Vec<RuleSpec>,
    ) -> Result<()> {
        let namespace = policy.namespace().unwrap_or_default();
        let pod_selector = policy.spec.as_ref().map(|s| &s.pod_selector);
        let own_pods = self.cluster.list_pods(Some(&namespace), pod_selector).await?;

        let mut by_port: BTreeMap<u16, Vec<AffectedPod>> = BTreeMap::new();
        for pod in &own_pods {
            for port in named_container_ports(pod, name, protocol) {
                let entry = by_port.entry(port).or_default();
                entry.extend(affected(pod));
            }
        }
        if by_port.is_empty() {
            debug!("No pod in {} exposes a port named {}", namespace, name);
        }

        for (port, pods) in by_port {
            if resolved.allow_all {
                push_unique(
                    rules,
                    rule_spec(
                        build_rule(Direction::Ingress, Some(port), Some(port), Some(protocol), None),
                        Some(&namespace),
                        pods.clone(),
                    ),
                );
            }
            for remote in remotes {
                push_unique(
                    rules,
                    rule_spec(
                        build_rule(
                            Direction::Ingress,
                            Some(port),
                            Some(port),
                            Some(protocol),
                            Some(&remote.cidr),
                        ),
                        Some(&namespace),
                        pods.clone(),
                    ),
                );
            }
        }
        Ok(())
    }

    /// Named ports on egress resolve against the peer pods
    async fn named_port_egress(
        &self,
        resolved: &ResolvedPeers,
        name: &str,
        protocol: &str,
        rules: &mut Vec<RuleSpec>,
    ) -> Result<()> {
        if resolved.allow_all {
            let mut ports: Vec<u16> = self
                .cluster
                .list_pods(None, None)
                .await?
                .iter()
                .flat_map(|pod| named_container_ports(pod, name, protocol))
                .collect();
            ports.sort_unstable();
            ports.dedup();
            for port in ports {
                push_unique(
                    rules,
                    rule_spec(
                        build_rule(Direction::Egress, Some(port), Some(port), Some(protocol), None),
                        None,
                        Vec::new(),
                    ),
                );
            }
        }

        let mut peer_pods = Vec::new();
        for peer in &resolved.peers {
            match peer {
                Peer::Pod(pod) => peer_pods.push(pod.clone()),
                Peer::Namespace(ns) => peer_pods.extend(self.cluster.list_pods(Some(ns), None).await?),
                Peer::Cidr(cidr) => {
                    warn!("Named port {} cannot be resolved for ipBlock {}", name, cidr)
                }
            }
        }

        for pod in &peer_pods {
            let Some(ip) = pod_ip(pod) else {
                continue;
            };
            let ports = named_container_ports(pod, name, protocol);
            for &port in &ports {
                push_unique(
                    rules,
                    rule_spec(
                        build_rule(
                            Direction::Egress,
                            Some(port),
                            Some(port),
                            Some(protocol),
                            Some(&host_cidr(ip)),
                        ),
                        pod.namespace().as_deref(),
                        affected(pod).into_iter().collect(),
                    ),
                );
            }
            if self.config.octavia_defaults.enforce_sg_rules {
                let peer = Peer::Pod(pod.clone());
                for &port in &ports {
                    self.push_service_rules_for(&peer, Some(port), Some(port), Some(protocol), rules)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Egress to the ClusterIPs fronting the peers, and to the whole service
    /// subnet when no pod or namespace peer was resolved
    async fn service_egress_rules(
        &self,
        direction: Direction,
        resolved: &ResolvedPeers,
        min: Option<u16>,
        max: Option<u16>,
        protocol: Option<&str>,
        rules: &mut Vec<RuleSpec>,
    ) -> Result<()> {
        if direction != Direction::Egress || !self.config.octavia_defaults.enforce_sg_rules {
            return Ok(());
        }

        let mut any_resource = false;
        for peer in &resolved.peers {
            if matches!(peer, Peer::Pod(_) | Peer::Namespace(_)) {
                any_resource = true;
                self.push_service_rules_for(peer, min, max, protocol, rules)
                    .await?;
            }
        }

        if resolved.allow_all || !any_resource {
            if let Some(subnet_id) = self.config.neutron_defaults.service_subnet.as_deref() {
                let subnet = self.network.get_subnet(subnet_id).await?;
                push_unique(
                    rules,
                    rule_spec(
                        build_rule(Direction::Egress, min, max, protocol, Some(&subnet.cidr)),
                        None,
                        Vec::new(),
                    ),
                );
            }
        }
        Ok(())
    }

    async fn push_service_rules_for(
        &self,
        peer: &Peer,
        min: Option<u16>,
        max: Option<u16>,
        protocol: Option<&str>,
        rules: &mut Vec<RuleSpec>,
    ) -> Result<()> {
        let namespace = match peer {
            Peer::Pod(pod) => pod.namespace().unwrap_or_default(),
            Peer::Namespace(ns) => ns.clone(),
            Peer::Cidr(_) => return Ok(()),
        };
        for service in self.cluster.list_services(Some(&namespace)).await? {
            let Some(spec) = &service.spec else {
                continue;
            };
            if let Peer::Pod(pod) = peer {
                let Some(svc_selector) = spec.selector.as_ref().filter(|s| !s.is_empty()) else {
                    continue;
                };
                let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
                if !svc_selector.iter().all(|(k, v)| pod_labels.get(k) == Some(v)) {
                    continue;
                }
            }
            let cluster_ip = spec
                .cluster_ip
                .as_deref()
                .filter(|ip| *ip != "None" && !ip.is_empty());
            let Some(cluster_ip) = cluster_ip else {
                continue;
            };
            push_unique(
                rules,
                rule_spec(
                    build_rule(Direction::Egress, min, max, protocol, Some(&host_cidr(cluster_ip))),
                    Some(&namespace),
                    Vec::new(),
                ),
            );
        }
        Ok(())
    }
}
