//! Kubernetes operations used by the reconcilers
//!
//! The reconcilers depend on [`ClusterApi`] rather than on `kube::Api`
//! directly so that their state machines can be exercised against an
//! in-memory cluster.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Namespace, ObjectReference, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::{finalizers, selector};
use crate::crd::{
    KuryrLoadBalancer, KuryrLoadBalancerStatus, KuryrNetwork, KuryrNetworkPolicy,
    KuryrNetworkPolicyStatus, NETWORK_POLICY_FINALIZER,
};
use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "kuryr-controller";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Pods matching `selector`, in one namespace or cluster wide
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Pod>>;
    async fn list_namespaces(&self, selector: Option<&LabelSelector>) -> Result<Vec<Namespace>>;
    async fn list_services(&self, namespace: Option<&str>) -> Result<Vec<Service>>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;
    async fn get_network_policy(&self, namespace: &str, name: &str) -> Result<NetworkPolicy>;
    /// The KuryrNetwork of a namespace, stored under the namespace's name
    async fn get_kuryr_network(&self, namespace: &str) -> Result<KuryrNetwork>;
    async fn list_kuryr_network_policies(&self, namespace: &str)
        -> Result<Vec<KuryrNetworkPolicy>>;
    async fn list_kuryr_load_balancers(&self) -> Result<Vec<KuryrLoadBalancer>>;
    async fn get_kuryr_load_balancer(&self, namespace: &str, name: &str)
        -> Result<KuryrLoadBalancer>;
    async fn get_kuryr_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KuryrNetworkPolicy>;
    /// EndpointSlices owned by a Service
    async fn list_endpoint_slices(&self, namespace: &str, service: &str)
        -> Result<Vec<EndpointSlice>>;

    /// Create or update metadata and spec, leaving the status alone
    async fn apply_kuryr_network_policy(&self, knp: &KuryrNetworkPolicy) -> Result<()>;
    async fn delete_kuryr_network_policy(&self, namespace: &str, name: &str) -> Result<()>;
    async fn apply_kuryr_load_balancer(&self, klb: &KuryrLoadBalancer) -> Result<()>;
    async fn delete_kuryr_load_balancer(&self, namespace: &str, name: &str) -> Result<()>;

    async fn annotate_network_policy(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;
    async fn remove_network_policy_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    async fn patch_knp_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KuryrNetworkPolicyStatus,
    ) -> Result<()>;
    async fn patch_klb_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KuryrLoadBalancerStatus,
    ) -> Result<()>;
    /// Publish the external address in `status.loadBalancer.ingress`
    async fn patch_service_ingress(&self, namespace: &str, name: &str, ip: &str) -> Result<()>;

    async fn publish_event(
        &self,
        object: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// [`ClusterApi`] backed by the API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn namespaced_or_all<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = self.namespaced_or_all(namespace);
        let params = selector::list_params(selector)?;
        Ok(api.list(&params).await?.items)
    }

    async fn list_namespaces(&self, selector: Option<&LabelSelector>) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let params = selector::list_params(selector)?;
        Ok(api.list(&params).await?.items)
    }

    async fn list_services(&self, namespace: Option<&str>) -> Result<Vec<Service>> {
        let api: Api<Service> = self.namespaced_or_all(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_network_policy(&self, namespace: &str, name: &str) -> Result<NetworkPolicy> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_kuryr_network(&self, namespace: &str) -> Result<KuryrNetwork> {
        let api: Api<KuryrNetwork> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(namespace).await?)
    }

    async fn list_kuryr_network_policies(
        &self,
        namespace: &str,
    ) -> Result<Vec<KuryrNetworkPolicy>> {
        let api: Api<KuryrNetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_kuryr_load_balancers(&self) -> Result<Vec<KuryrLoadBalancer>> {
        let api: Api<KuryrLoadBalancer> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_kuryr_load_balancer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KuryrLoadBalancer> {
        let api: Api<KuryrLoadBalancer> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_kuryr_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KuryrNetworkPolicy> {
        let api: Api<KuryrNetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let params =
            ListParams::default().labels(&format!("kubernetes.io/service-name={}", service));
        Ok(api.list(&params).await?.items)
    }

    async fn apply_kuryr_network_policy(&self, knp: &KuryrNetworkPolicy) -> Result<()> {
        let namespace = knp.namespace().unwrap_or_default();
        let api: Api<KuryrNetworkPolicy> = Api::namespaced(self.client.clone(), &namespace);
        let mut body = knp.clone();
        body.status = None;
        body.metadata.managed_fields = None;
        body.metadata.resource_version = None;
        api.patch(
            &knp.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_kuryr_network_policy(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<KuryrNetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn apply_kuryr_load_balancer(&self, klb: &KuryrLoadBalancer) -> Result<()> {
        let namespace = klb.namespace().unwrap_or_default();
        let api: Api<KuryrLoadBalancer> = Api::namespaced(self.client.clone(), &namespace);
        let mut body = klb.clone();
        body.status = None;
        body.metadata.managed_fields = None;
        body.metadata.resource_version = None;
        api.patch(
            &klb.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_kuryr_load_balancer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<KuryrLoadBalancer> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn annotate_network_policy(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_network_policy_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let np = api.get(name).await?;
        finalizers::remove_finalizer(&api, &np, NETWORK_POLICY_FINALIZER).await
    }

    async fn patch_knp_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KuryrNetworkPolicyStatus,
    ) -> Result<()> {
        let api: Api<KuryrNetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_klb_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KuryrLoadBalancerStatus,
    ) -> Result<()> {
        let api: Api<KuryrLoadBalancer> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_service_ingress(&self, namespace: &str, name: &str, ip: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "status": {"loadBalancer": {"ingress": [{"ip": ip}]}}
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                kube::Error::Api(resp) if resp.code == 409 => Error::ResourceNotReady(format!(
                    "conflict updating Service {}/{} status",
                    namespace, name
                )),
                other => Error::KubeError(other),
            })?;
        Ok(())
    }

    async fn publish_event(
        &self,
        object: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = object.namespace.as_deref().unwrap_or("default");
        let name = object.name.as_deref().unwrap_or("kuryr");
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-event-", name)),
                ..Default::default()
            },
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: object.clone(),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        debug!("Event {} on {}/{}: {}", reason, namespace, name, message);
        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}
