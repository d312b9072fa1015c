//! KuryrLoadBalancer Custom Resource Definition
//!
//! Derived 1:1 from a Service. The spec is the desired load balancer (VIP,
//! ports, endpoint slices); the status is the graph of Octavia resources
//! created so far: loadbalancer, listeners, pools, members and the optional
//! floating IP. Each level is persisted as soon as it changes so that a
//! restarted controller resumes from the last completed step.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer placed on the KuryrLoadBalancer
pub const LOAD_BALANCER_FINALIZER: &str = "kuryr.openstack.org/kuryrloadbalancer-finalizers";

/// Finalizer placed on the Service
pub const SERVICE_FINALIZER: &str = "kuryr.openstack.org/service-finalizer";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "openstack.org",
    version = "v1",
    kind = "KuryrLoadBalancer",
    plural = "kuryrloadbalancers",
    namespaced,
    status = "KuryrLoadBalancerStatus",
    shortname = "klb",
    printcolumn = r#"{"name":"PROJECT-ID","type":"string","jsonPath":".spec.project_id"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct KuryrLoadBalancerSpec {
    /// Service cluster IP, used as the VIP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default)]
    pub ports: Vec<LoadBalancerPort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default)]
    pub security_groups_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,

    /// Service type (`ClusterIP` or `LoadBalancer`)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// User requested external IP (`spec.loadBalancerIP`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<LoadBalancerTimeouts>,

    #[serde(default, rename = "endpointSlices")]
    pub endpoint_slices: Vec<EndpointSliceInfo>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LoadBalancerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub protocol: String,
    pub port: u16,
    /// Target port as a string, either a number or a container port name
    #[serde(rename = "targetPort")]
    pub target_port: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LoadBalancerTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_client_data: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_member_data: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EndpointSliceInfo {
    #[serde(default)]
    pub endpoints: Vec<EndpointInfo>,
    #[serde(default)]
    pub ports: Vec<EndpointPortInfo>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EndpointInfo {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<EndpointConditionsInfo>,
    #[serde(default, rename = "targetRef", skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EndpointConditionsInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EndpointPortInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Optional fields serialize as `null` so that a merge patch of the whole
/// status clears what is no longer there.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct KuryrLoadBalancerStatus {
    #[serde(default)]
    pub loadbalancer: Option<LoadBalancerInfo>,
    #[serde(default)]
    pub listeners: Vec<ListenerInfo>,
    #[serde(default)]
    pub pools: Vec<PoolInfo>,
    #[serde(default)]
    pub members: Vec<MemberInfo>,
    #[serde(default)]
    pub service_pub_ip_info: Option<PubIpInfo>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LoadBalancerInfo {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub project_id: String,
    pub subnet_id: String,
    pub ip: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ListenerInfo {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub project_id: String,
    pub loadbalancer_id: String,
    pub protocol: String,
    pub port: u16,
    #[serde(default)]
    pub timeout_client_data: Option<u32>,
    #[serde(default)]
    pub timeout_member_data: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PoolInfo {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub project_id: String,
    pub loadbalancer_id: String,
    pub listener_id: String,
    pub protocol: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MemberInfo {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub project_id: String,
    pub pool_id: String,
    pub subnet_id: String,
    pub ip: String,
    pub port: u16,
}

impl MemberInfo {
    /// Pod name embedded in a member name of the form `namespace/pod:port`
    pub fn pod_name(&self) -> Option<&str> {
        let (_, rest) = self.name.split_once('/')?;
        let (pod, _) = rest.rsplit_once(':')?;
        Some(pod)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AllocMethod {
    User,
    #[default]
    Pool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PubIpInfo {
    pub ip_id: String,
    pub ip_addr: String,
    pub alloc_method: AllocMethod,
}

impl KuryrLoadBalancerStatus {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn lb_id(&self) -> Option<&str> {
        self.loadbalancer.as_ref().and_then(|lb| lb.id.as_deref())
    }
}

impl KuryrLoadBalancerSpec {
    pub fn is_load_balancer_type(&self) -> bool {
        self.type_.as_deref() == Some("LoadBalancer")
    }

    /// Whether any endpoint targets a Pod
    pub fn has_pod_endpoints(&self) -> bool {
        self.endpoint_slices.iter().any(|slice| {
            slice.endpoints.iter().any(|ep| {
                ep.target_ref
                    .as_ref()
                    .and_then(|t| t.kind.as_deref())
                    .is_some_and(|kind| kind == "Pod")
            })
        })
    }
}
