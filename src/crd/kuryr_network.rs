//! KuryrNetwork Custom Resource Definition
//!
//! Describes the Neutron network and subnet backing a namespace. This
//! controller only reads it: the namespace subnet driver and the pool cleanup
//! on policy deletion need `netId`, `subnetId` and `subnetCIDR`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "openstack.org",
    version = "v1",
    kind = "KuryrNetwork",
    plural = "kuryrnetworks",
    namespaced,
    status = "KuryrNetworkStatus",
    printcolumn = r#"{"name":"SUBNET-CIDR","type":"string","jsonPath":".status.subnetCIDR"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KuryrNetworkSpec {
    pub ns_name: String,
    pub project_id: String,
    #[serde(default)]
    pub ns_labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KuryrNetworkStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, rename = "subnetCIDR", skip_serializing_if = "Option::is_none")]
    pub subnet_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
    #[serde(default)]
    pub populated: bool,
}
