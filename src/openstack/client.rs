//! HTTP client for Keystone, Neutron and Octavia
//!
//! Authenticates with a Keystone v3 password grant scoped to a project and
//! caches the token together with the service endpoints found in its
//! catalog. A 401 from a service drops the cached token and the request is
//! sent once more with a fresh one.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::types::*;
use super::{LoadBalancerApi, NetworkApi};
use crate::config::OpenStackConfig;
use crate::crd::SecurityGroupRule;
use crate::error::{Error, Result};

/// Tokens are refreshed this long before Keystone says they expire
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Service {
    Network,
    LoadBalancer,
}

#[derive(Clone, Debug)]
struct Session {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    network_url: String,
    load_balancer_url: String,
}

impl Session {
    fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(expires) => expires - ChronoDuration::seconds(TOKEN_EXPIRY_MARGIN_SECS) > Utc::now(),
            None => true,
        }
    }

    fn base_url(&self, service: Service) -> &str {
        match service {
            Service::Network => &self.network_url,
            Service::LoadBalancer => &self.load_balancer_url,
        }
    }
}

#[derive(Deserialize)]
struct TokenBody {
    token: TokenInfo,
}

#[derive(Deserialize)]
struct TokenInfo {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

/// Client for the OpenStack networking and load balancing APIs
pub struct OpenStackClient {
    http_client: Client,
    config: OpenStackConfig,
    session: RwLock<Option<Session>>,
}

impl OpenStackClient {
    pub fn new(config: OpenStackConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;
        Ok(Self {
            http_client,
            config,
            session: RwLock::new(None),
        })
    }

    async fn session(&self) -> Result<Session> {
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_valid() {
                return Ok(session.clone());
            }
        }
        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            if session.is_valid() {
                return Ok(session.clone());
            }
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate(&self) {
        *self.session.write().await = None;
    }

    async fn authenticate(&self) -> Result<Session> {
        let url = format!("{}/v3/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        debug!("Authenticating against {}", url);

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": {"name": self.config.user_domain_name},
                            "password": self.config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.config.project_name,
                        "domain": {"name": self.config.project_domain_name},
                    }
                }
            }
        });

        let response = self.http_client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::openstack(status.as_u16(), error_message(&text)));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::openstack(status.as_u16(), "missing X-Subject-Token header"))?;
        let info: TokenBody = response.json().await?;

        let network_url = match &self.config.network_endpoint {
            Some(url) => url.clone(),
            None => self.find_endpoint(&info.token.catalog, "network")?,
        };
        let load_balancer_url = match &self.config.load_balancer_endpoint {
            Some(url) => url.clone(),
            None => self.find_endpoint(&info.token.catalog, "load-balancer")?,
        };

        Ok(Session {
            token,
            expires_at: info.token.expires_at,
            network_url: network_url.trim_end_matches('/').to_string(),
            load_balancer_url: load_balancer_url.trim_end_matches('/').to_string(),
        })
    }

    fn find_endpoint(&self, catalog: &[CatalogEntry], service_type: &str) -> Result<String> {
        catalog
            .iter()
            .filter(|entry| entry.service_type == service_type)
            .flat_map(|entry| entry.endpoints.iter())
            .find(|ep| {
                ep.interface == self.config.interface
                    && match &self.config.region_name {
                        Some(region) => ep.region.as_deref() == Some(region.as_str()),
                        None => true,
                    }
            })
            .map(|ep| ep.url.clone())
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "no {} endpoint for interface {} in the service catalog",
                    service_type, self.config.interface
                ))
            })
    }

    /// Send a request, re-authenticating once on 401. Returns `None` for
    /// empty responses.
    async fn request(
        &self,
        service: Service,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let mut reauthenticated = false;
        loop {
            let session = self.session().await?;
            let url = format!("{}{}", session.base_url(service), path);
            let mut builder = self
                .http_client
                .request(method.clone(), &url)
                .header("X-Auth-Token", &session.token)
                .query(query);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                warn!("Token rejected by {}, re-authenticating", url);
                self.invalidate().await;
                reauthenticated = true;
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                debug!("{} {} failed with {}", method, url, status);
                return Err(Error::openstack(status.as_u16(), error_message(&text)));
            }
            if text.trim().is_empty() {
                return Ok(None);
            }
            return Ok(Some(serde_json::from_str(&text)?));
        }
    }

    async fn get_wrapped<T: DeserializeOwned>(
        &self,
        service: Service,
        path: &str,
        query: &[(&str, &str)],
        key: &str,
    ) -> Result<T> {
        let value = self
            .request(service, Method::GET, path, query, None)
            .await?
            .unwrap_or(Value::Null);
        unwrap_key(value, key)
    }

    async fn create_wrapped<T: DeserializeOwned>(
        &self,
        service: Service,
        path: &str,
        key: &str,
        body: Value,
    ) -> Result<T> {
        let payload = json!({ key: body });
        let value = self
            .request(service, Method::POST, path, &[], Some(&payload))
            .await?
            .unwrap_or(Value::Null);
        unwrap_key(value, key)
    }

    async fn delete(&self, service: Service, path: &str, query: &[(&str, &str)]) -> Result<()> {
        self.request(service, Method::DELETE, path, query, None)
            .await
            .map(|_| ())
    }
}

fn unwrap_key<T: DeserializeOwned>(mut value: Value, key: &str) -> Result<T> {
    let inner = value.get_mut(key).map(Value::take).unwrap_or(Value::Null);
    Ok(serde_json::from_value(inner)?)
}

/// Pull the human readable message out of a Neutron or Octavia error body
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    let candidates = [
        value.pointer("/NeutronError/message"),
        value.get("faultstring"),
        value.get("description"),
        value.pointer("/error/message"),
        value.get("message"),
    ];
    let message = candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());
    message
}

#[async_trait]
impl NetworkApi for OpenStackClient {
    async fn create_security_group(&self, req: &NewSecurityGroup) -> Result<SecurityGroup> {
        self.create_wrapped(
            Service::Network,
            "/v2.0/security-groups",
            "security_group",
            serde_json::to_value(req)?,
        )
        .await
    }

    async fn delete_security_group(&self, id: &str) -> Result<()> {
        self.delete(Service::Network, &format!("/v2.0/security-groups/{}", id), &[])
            .await
    }

    async fn list_security_groups(&self, filters: &[(&str, &str)]) -> Result<Vec<SecurityGroup>> {
        self.get_wrapped(
            Service::Network,
            "/v2.0/security-groups",
            filters,
            "security_groups",
        )
        .await
    }

    async fn create_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<SecurityGroupRule> {
        let mut body = serde_json::to_value(rule)?;
        if let Some(obj) = body.as_object_mut() {
            obj.remove("id");
        }
        self.create_wrapped(
            Service::Network,
            "/v2.0/security-group-rules",
            "security_group_rule",
            body,
        )
        .await
    }

    async fn delete_security_group_rule(&self, id: &str) -> Result<()> {
        self.delete(
            Service::Network,
            &format!("/v2.0/security-group-rules/{}", id),
            &[],
        )
        .await
    }

    async fn list_security_group_rules(
        &self,
        security_group_id: &str,
    ) -> Result<Vec<SecurityGroupRule>> {
        self.get_wrapped(
            Service::Network,
            "/v2.0/security-group-rules",
            &[("security_group_id", security_group_id)],
            "security_group_rules",
        )
        .await
    }

    async fn get_port(&self, id: &str) -> Result<Port> {
        self.get_wrapped(Service::Network, &format!("/v2.0/ports/{}", id), &[], "port")
            .await
    }

    async fn list_ports(&self, query: &PortQuery) -> Result<Vec<Port>> {
        let pairs = query.to_pairs();
        let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        self.get_wrapped(Service::Network, "/v2.0/ports", &borrowed, "ports")
            .await
    }

    async fn update_port_security_groups(
        &self,
        port_id: &str,
        security_groups: &[String],
    ) -> Result<()> {
        let body = json!({"port": {"security_groups": security_groups}});
        self.request(
            Service::Network,
            Method::PUT,
            &format!("/v2.0/ports/{}", port_id),
            &[],
            Some(&body),
        )
        .await
        .map(|_| ())
    }

    async fn get_subnet(&self, id: &str) -> Result<Subnet> {
        self.get_wrapped(
            Service::Network,
            &format!("/v2.0/subnets/{}", id),
            &[],
            "subnet",
        )
        .await
    }

    async fn list_floating_ips(&self, filters: &[(&str, &str)]) -> Result<Vec<FloatingIp>> {
        self.get_wrapped(Service::Network, "/v2.0/floatingips", filters, "floatingips")
            .await
    }

    async fn create_floating_ip(&self, req: &NewFloatingIp) -> Result<FloatingIp> {
        self.create_wrapped(
            Service::Network,
            "/v2.0/floatingips",
            "floatingip",
            serde_json::to_value(req)?,
        )
        .await
    }

    async fn update_floating_ip_port(&self, id: &str, port_id: Option<&str>) -> Result<()> {
        let body = json!({"floatingip": {"port_id": port_id}});
        self.request(
            Service::Network,
            Method::PUT,
            &format!("/v2.0/floatingips/{}", id),
            &[],
            Some(&body),
        )
        .await
        .map(|_| ())
    }

    async fn delete_floating_ip(&self, id: &str) -> Result<()> {
        self.delete(Service::Network, &format!("/v2.0/floatingips/{}", id), &[])
            .await
    }

    async fn add_tags(&self, resource: &str, id: &str, tags: &[String]) -> Result<()> {
        for tag in tags {
            self.request(
                Service::Network,
                Method::PUT,
                &format!("/v2.0/{}/{}/tags/{}", resource, id, tag),
                &[],
                None,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerApi for OpenStackClient {
    async fn create_load_balancer(&self, req: &NewLoadBalancer) -> Result<LoadBalancer> {
        self.create_wrapped(
            Service::LoadBalancer,
            "/v2/lbaas/loadbalancers",
            "loadbalancer",
            serde_json::to_value(req)?,
        )
        .await
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        self.get_wrapped(
            Service::LoadBalancer,
            &format!("/v2/lbaas/loadbalancers/{}", id),
            &[],
            "loadbalancer",
        )
        .await
    }

    async fn list_load_balancers(&self, filters: &[(&str, &str)]) -> Result<Vec<LoadBalancer>> {
        self.get_wrapped(
            Service::LoadBalancer,
            "/v2/lbaas/loadbalancers",
            filters,
            "loadbalancers",
        )
        .await
    }

    async fn delete_load_balancer(&self, id: &str, cascade: bool) -> Result<()> {
        let query: &[(&str, &str)] = if cascade { &[("cascade", "true")] } else { &[] };
        self.delete(
            Service::LoadBalancer,
            &format!("/v2/lbaas/loadbalancers/{}", id),
            query,
        )
        .await
    }

    async fn create_listener(&self, req: &NewListener) -> Result<Listener> {
        self.create_wrapped(
            Service::LoadBalancer,
            "/v2/lbaas/listeners",
            "listener",
            serde_json::to_value(req)?,
        )
        .await
    }

    async fn list_listeners(&self, filters: &[(&str, &str)]) -> Result<Vec<Listener>> {
        self.get_wrapped(Service::LoadBalancer, "/v2/lbaas/listeners", filters, "listeners")
            .await
    }

    async fn delete_listener(&self, id: &str) -> Result<()> {
        self.delete(
            Service::LoadBalancer,
            &format!("/v2/lbaas/listeners/{}", id),
            &[],
        )
        .await
    }

    async fn create_pool(&self, req: &NewPool) -> Result<Pool> {
        self.create_wrapped(
            Service::LoadBalancer,
            "/v2/lbaas/pools",
            "pool",
            serde_json::to_value(req)?,
        )
        .await
    }

    async fn list_pools(&self, filters: &[(&str, &str)]) -> Result<Vec<Pool>> {
        self.get_wrapped(Service::LoadBalancer, "/v2/lbaas/pools", filters, "pools")
            .await
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        self.delete(Service::LoadBalancer, &format!("/v2/lbaas/pools/{}", id), &[])
            .await
    }

    async fn create_member(&self, pool_id: &str, req: &NewMember) -> Result<Member> {
        self.create_wrapped(
            Service::LoadBalancer,
            &format!("/v2/lbaas/pools/{}/members", pool_id),
            "member",
            serde_json::to_value(req)?,
        )
        .await
    }

    async fn list_members(&self, pool_id: &str, filters: &[(&str, &str)]) -> Result<Vec<Member>> {
        self.get_wrapped(
            Service::LoadBalancer,
            &format!("/v2/lbaas/pools/{}/members", pool_id),
            filters,
            "members",
        )
        .await
    }

    async fn delete_member(&self, pool_id: &str, id: &str) -> Result<()> {
        self.delete(
            Service::LoadBalancer,
            &format!("/v2/lbaas/pools/{}/members/{}", pool_id, id),
            &[],
        )
        .await
    }
}
