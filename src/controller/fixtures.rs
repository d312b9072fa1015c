//! Object builders shared by the controller tests

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Namespace, Pod, PodSpec, PodStatus, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use super::cluster::fake::FakeCluster;
use super::Context;
use crate::config::Config;
use crate::openstack::fake::FakeCloud;
use crate::openstack::Port;

pub const SERVICE_SUBNET_CIDR: &str = "10.0.0.0/16";
pub const NODE_SUBNET_CIDR: &str = "192.168.0.0/24";
pub const POD_SUBNET_CIDR: &str = "10.1.0.0/16";

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels(pairs)),
        match_expressions: None,
    }
}

/// A running pod scheduled on `node-1` with uid `uid-<name>`
pub fn pod(namespace: &str, name: &str, pod_labels: &[(&str, &str)], ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-1".to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
    }
}

pub fn namespace(name: &str, ns_labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(ns_labels)),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn network_policy(namespace: &str, name: &str, spec: NetworkPolicySpec) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(spec),
    }
}

/// Service with `(name, protocol, port, target port)` entries
pub fn service(
    namespace: &str,
    name: &str,
    type_: &str,
    cluster_ip: &str,
    ports: &[(&str, &str, i32, i32)],
    pod_selector: &[(&str, &str)],
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            cluster_ip: Some(cluster_ip.to_string()),
            selector: Some(labels(pod_selector)),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, protocol, port, target)| ServicePort {
                        name: Some(port_name.to_string()),
                        protocol: Some(protocol.to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*target)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

/// Neutron port bound to `pod`
pub fn pod_port(pod: &Pod, security_groups: &[&str]) -> Port {
    let name = pod.metadata.name.clone().unwrap_or_default();
    Port {
        id: format!("port-{}", name),
        name: name.clone(),
        network_id: "net-pod-subnet".to_string(),
        device_id: format!("uid-{}", name),
        device_owner: "compute:kuryr".to_string(),
        security_groups: security_groups.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.kubernetes.pod_security_groups_driver = "policy".to_string();
    config.kubernetes.service_security_groups_driver = "policy".to_string();
    config.neutron_defaults.project = Some("project-1".to_string());
    config.neutron_defaults.pod_security_groups = vec!["sg-default".to_string()];
    config.neutron_defaults.pod_subnet = Some("pod-subnet".to_string());
    config.neutron_defaults.service_subnet = Some("svc-subnet".to_string());
    config.neutron_defaults.external_svc_net = Some("public".to_string());
    config.pod_vif_nested.worker_nodes_subnet = Some("node-subnet".to_string());
    config
}

pub fn cloud() -> Arc<FakeCloud> {
    let cloud = Arc::new(FakeCloud::new());
    cloud.add_subnet("svc-subnet", SERVICE_SUBNET_CIDR);
    cloud.add_subnet("node-subnet", NODE_SUBNET_CIDR);
    cloud.add_subnet("pod-subnet", POD_SUBNET_CIDR);
    cloud
}

pub fn context(cluster: &Arc<FakeCluster>, cloud: &Arc<FakeCloud>, config: Config) -> Context {
    Context::new(Arc::new(config), cluster.clone(), cloud.clone(), cloud.clone())
        .expect("test configuration is valid")
}
