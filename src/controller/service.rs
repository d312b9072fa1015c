//! Service controller
//!
//! Keeps one KuryrLoadBalancer per supported Service. The spec carries the
//! VIP, ports, project, security groups, VIP subnet and the Service's
//! EndpointSlices; everything Octavia-side is left to the load balancer
//! controller. EndpointSlice changes are mapped back to their Service.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::{finalizers, object_key, Context, ControllerState, EventType};
use crate::crd::{
    EndpointConditionsInfo, EndpointInfo, EndpointPortInfo, EndpointSliceInfo, KuryrLoadBalancer,
    KuryrLoadBalancerSpec, LoadBalancerPort, LoadBalancerTimeouts, TargetRef,
    LOAD_BALANCER_FINALIZER, SERVICE_FINALIZER,
};
use crate::error::{Error, Result};

const CONTROLLER: &str = "service";

const SUPPORTED_SERVICE_TYPES: &[&str] = &["ClusterIP", "LoadBalancer"];

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Listener client data timeout in milliseconds
pub const TIMEOUT_CLIENT_DATA_ANNOTATION: &str = "openstack.org/kuryr-timeout-client-data";
/// Listener member data timeout in milliseconds
pub const TIMEOUT_MEMBER_DATA_ANNOTATION: &str = "openstack.org/kuryr-timeout-member-data";

pub async fn run(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let services: Api<Service> = Api::all(client.clone());

    if let Err(e) = services.list(&ListParams::default().limit(1)).await {
        error!("Cannot list Services: {:?}", e);
        return Err(Error::KubeError(e));
    }
    info!("Starting Service controller");

    Controller::new(services, watcher::Config::default())
        .watches(
            Api::<EndpointSlice>::all(client),
            watcher::Config::default().labels(SERVICE_NAME_LABEL),
            |slice: EndpointSlice| owning_service(&slice),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled Service {}", obj),
                Err(e) => warn!("Service reconcile failed: {}", e),
            }
        })
        .await;
    Ok(())
}

fn owning_service(slice: &EndpointSlice) -> Option<ObjectRef<Service>> {
    let name = slice.labels().get(SERVICE_NAME_LABEL)?;
    let namespace = slice.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Why a Service gets no load balancer, if it does not
pub fn ignore_reason(service: &Service) -> Option<&'static str> {
    let spec = service.spec.as_ref()?;
    match spec.cluster_ip.as_deref() {
        None | Some("") | Some("None") => return Some("headless"),
        _ => {}
    }
    let type_ = spec.type_.as_deref().unwrap_or("ClusterIP");
    if !SUPPORTED_SERVICE_TYPES.contains(&type_) {
        return Some("of unsupported type");
    }
    if service.namespace().as_deref() == Some("default") && service.name_any() == "kubernetes" {
        return Some("the default API service");
    }
    None
}

#[instrument(skip(state), fields(name = %service.name_any(), namespace = service.namespace()))]
async fn reconcile(service: Arc<Service>, state: Arc<ControllerState>) -> Result<Action> {
    let key = object_key(service.as_ref());
    if let Some(action) = state.standby(CONTROLLER, &key) {
        return Ok(action);
    }
    let ignored = ignore_reason(service.as_ref());
    if let Some(reason) = ignored {
        if !finalizers::has_finalizer(service.as_ref(), SERVICE_FINALIZER) {
            debug!("Skipping Service {}: {}", key, reason);
            return Ok(Action::await_change());
        }
    }

    let started = Instant::now();
    let namespace = service.namespace().unwrap_or_default();
    let api: Api<Service> = Api::namespaced(state.client.clone(), &namespace);
    let ctx = &state.ctx;

    let result = finalizer(&api, SERVICE_FINALIZER, service, |event| async move {
        let pass = match event {
            FinalizerEvent::Apply(_) if ignored.is_some() => Ok(()),
            FinalizerEvent::Apply(service) => on_present(ctx, &service).await,
            FinalizerEvent::Cleanup(service) => on_finalize(ctx, &service).await,
        };
        pass.map(|()| Action::await_change())
    })
    .await
    .map_err(Error::from);

    state.finish(CONTROLLER, &key, started, result.map(|_| ()))
}

fn error_policy(service: Arc<Service>, error: &Error, state: Arc<ControllerState>) -> Action {
    state.error_action(CONTROLLER, &object_key(service.as_ref()), error)
}

fn service_reference(service: &Service) -> ObjectReference {
    service.object_ref(&())
}

fn target_port(port: Option<&IntOrString>, fallback: i32) -> String {
    match port {
        Some(IntOrString::Int(n)) => n.to_string(),
        Some(IntOrString::String(name)) => name.clone(),
        None => fallback.to_string(),
    }
}

fn ports(service: &Service) -> Vec<LoadBalancerPort> {
    service
        .spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .filter_map(|p| {
            Some(LoadBalancerPort {
                name: p.name.clone(),
                protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                port: u16::try_from(p.port).ok()?,
                target_port: target_port(p.target_port.as_ref(), p.port),
            })
        })
        .collect()
}

fn timeouts(service: &Service) -> Option<LoadBalancerTimeouts> {
    let annotations = service.annotations();
    let parse = |key: &str| annotations.get(key).and_then(|v| v.parse::<u32>().ok());
    let timeouts = LoadBalancerTimeouts {
        timeout_client_data: parse(TIMEOUT_CLIENT_DATA_ANNOTATION),
        timeout_member_data: parse(TIMEOUT_MEMBER_DATA_ANNOTATION),
    };
    if timeouts == LoadBalancerTimeouts::default() {
        None
    } else {
        Some(timeouts)
    }
}

/// The part of an EndpointSlice the load balancer controller reads
pub fn endpoint_slice_info(slice: &EndpointSlice) -> EndpointSliceInfo {
    EndpointSliceInfo {
        endpoints: slice
            .endpoints
            .iter()
            .map(|ep| EndpointInfo {
                addresses: ep.addresses.clone(),
                conditions: ep.conditions.as_ref().map(|c| EndpointConditionsInfo {
                    ready: c.ready,
                }),
                target_ref: ep.target_ref.as_ref().map(|t| TargetRef {
                    kind: t.kind.clone(),
                    name: t.name.clone(),
                    namespace: t.namespace.clone(),
                }),
            })
            .collect(),
        ports: slice
            .ports
            .iter()
            .flatten()
            .filter_map(|p| {
                Some(EndpointPortInfo {
                    name: p.name.clone(),
                    port: u16::try_from(p.port?).ok()?,
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                })
            })
            .collect(),
    }
}

/// The single service subnet containing `ip`
async fn vip_subnet(ctx: &Context, service: &Service, project_id: &str, ip: &str) -> Result<String> {
    let addr: IpAddr = ip.parse().map_err(|_| {
        Error::IntegrityError(format!("Service {} has invalid IP {}", object_key(service), ip))
    })?;
    let subnets = ctx
        .drivers
        .service_subnets
        .get_subnets(service, project_id)
        .await?;
    let mut matching = Vec::new();
    for subnet in subnets {
        let cidr: IpNetwork = subnet.cidr.parse()?;
        if cidr.contains(addr) && !matching.contains(&subnet.id) {
            matching.push(subnet.id);
        }
    }
    match matching.as_slice() {
        [id] => Ok(id.clone()),
        _ => Err(Error::IntegrityError(format!(
            "Found {} subnets for service {} IP {}",
            matching.len(),
            object_key(service),
            ip
        ))),
    }
}

/// Desired KuryrLoadBalancer spec of a supported Service
pub async fn build_spec(ctx: &Context, service: &Service) -> Result<KuryrLoadBalancerSpec> {
    let namespace = service.namespace().unwrap_or_default();
    let spec = service.spec.clone().unwrap_or_default();
    let ip = spec.cluster_ip.clone().unwrap_or_default();

    let project_id = ctx.drivers.project.get_project(&namespace).await?;
    let security_groups_ids = ctx
        .drivers
        .service_sg
        .get_security_groups(service, &project_id)
        .await?;
    let subnet_id = vip_subnet(ctx, service, &project_id, &ip).await?;
    let endpoint_slices = ctx
        .cluster
        .list_endpoint_slices(&namespace, &service.name_any())
        .await?
        .iter()
        .map(endpoint_slice_info)
        .collect();

    Ok(KuryrLoadBalancerSpec {
        ip: Some(ip),
        ports: ports(service),
        project_id: Some(project_id),
        security_groups_ids,
        subnet_id: Some(subnet_id),
        type_: spec.type_.or_else(|| Some("ClusterIP".to_string())),
        lb_ip: spec.load_balancer_ip,
        provider: Some(ctx.config.kubernetes.lb_provider()),
        timeouts: timeouts(service),
        endpoint_slices,
    })
}

/// Create or update the KuryrLoadBalancer of `service`
pub async fn on_present(ctx: &Context, service: &Service) -> Result<()> {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();
    let key = object_key(service);

    let spec = match build_spec(ctx, service).await {
        Ok(spec) => spec,
        Err(e @ Error::IntegrityError(_)) => {
            ctx.emit_event(
                &service_reference(service),
                EventType::Warning,
                "KuryrServiceSkipped",
                &e.to_string(),
            )
            .await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let existing = match ctx.cluster.get_kuryr_load_balancer(&namespace, &name).await {
        Ok(klb) => Some(klb),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    if existing.as_ref().is_some_and(|klb| klb.spec == spec) {
        debug!("KuryrLoadBalancer {} is up to date", key);
        return Ok(());
    }

    let mut klb = KuryrLoadBalancer::new(&name, spec);
    klb.metadata.namespace = Some(namespace);
    klb.metadata.finalizers = Some(vec![LOAD_BALANCER_FINALIZER.to_string()]);
    ctx.cluster.apply_kuryr_load_balancer(&klb).await?;
    if existing.is_some() {
        info!("Updated KuryrLoadBalancer {}", key);
    } else {
        info!("Created KuryrLoadBalancer {}", key);
    }
    Ok(())
}

/// Delete the KuryrLoadBalancer and hold the Service until it is gone
pub async fn on_finalize(ctx: &Context, service: &Service) -> Result<()> {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();
    match ctx.cluster.delete_kuryr_load_balancer(&namespace, &name).await {
        Ok(()) => Err(Error::ResourceNotReady(format!(
            "KuryrLoadBalancer {}/{} is being released",
            namespace, name
        ))),
        Err(e) if e.is_not_found() => {
            debug!("KuryrLoadBalancer {}/{} is gone", namespace, name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
