//! Service registry client (Consul HTTP API).

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use ureq::Agent;

use crate::config::ConsulSettings;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// Registry connects to `target` (`host:port`) every `interval`.
    Tcp { target: String, interval: Duration },
    /// Registry runs `args` every `interval`; exit status 0 means healthy.
    Command { args: Vec<String>, interval: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub check: Option<HealthCheck>,
}

/// A catalog entry as returned by a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: String,
    pub name: String,
    pub node: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    /// Registry-wide index of the last change; higher is fresher.
    pub modify_index: u64,
}

pub trait ServiceRegistry: Send + Sync {
    fn register(&self, registration: &ServiceRegistration) -> Result<()>;
    /// Deregistering an unknown service is not an error.
    fn deregister(&self, service_id: &str) -> Result<()>;
    fn lookup(&self, name: &str) -> Result<Vec<ServiceEntry>>;
}

/// Picks the most recently modified entry when a name is registered more than once.
pub fn freshest(entries: &[ServiceEntry]) -> Option<&ServiceEntry> {
    entries.iter().max_by_key(|entry| entry.modify_index)
}

/// Service name under which a VM is advertised while it runs.
pub fn vm_service_name(vm: &str) -> String {
    format!("qemu-{vm}")
}

/// Service name under which a destination host advertises its incoming migration server.
pub fn inbound_service_name(vm: &str) -> String {
    format!("{vm}-migration-inbound")
}

pub struct Consul {
    base: String,
    token: Option<String>,
    agent: Agent,
}

impl Consul {
    pub fn new(settings: &ConsulSettings) -> Self {
        Self {
            base: settings.address.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
        }
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let request = self.agent.request(method, &format!("{}{path}", self.base));
        match &self.token {
            Some(token) => request.set("X-Consul-Token", token),
            None => request,
        }
    }
}

fn registry_error(operation: &str, err: ureq::Error) -> Error {
    let message = match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            format!("HTTP {code}: {}", body.trim())
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    };
    Error::Registry {
        operation: operation.to_string(),
        message,
    }
}

fn check_body(check: &HealthCheck) -> Value {
    match check {
        HealthCheck::Tcp { target, interval } => json!({
            "TCP": target,
            "Interval": format!("{}s", interval.as_secs().max(1)),
            "DeregisterCriticalServiceAfter": "10m",
        }),
        HealthCheck::Command { args, interval } => json!({
            "Args": args,
            "Interval": format!("{}s", interval.as_secs().max(1)),
        }),
    }
}

fn registration_body(registration: &ServiceRegistration) -> Value {
    let mut body = json!({
        "ID": registration.id,
        "Name": registration.name,
        "Address": registration.address,
        "Port": registration.port,
        "Tags": registration.tags,
    });
    if let (Some(check), Some(map)) = (&registration.check, body.as_object_mut()) {
        map.insert("Check".to_string(), check_body(check));
    }
    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogEntry {
    #[serde(rename = "ServiceID")]
    service_id: String,
    service_name: String,
    #[serde(default)]
    node: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    service_address: String,
    #[serde(default)]
    service_port: u16,
    #[serde(default)]
    service_tags: Option<Vec<String>>,
    #[serde(default)]
    modify_index: u64,
}

impl From<CatalogEntry> for ServiceEntry {
    fn from(entry: CatalogEntry) -> Self {
        let address = if entry.service_address.is_empty() {
            entry.address
        } else {
            entry.service_address
        };
        ServiceEntry {
            id: entry.service_id,
            name: entry.service_name,
            node: entry.node,
            address,
            port: entry.service_port,
            tags: entry.service_tags.unwrap_or_default(),
            modify_index: entry.modify_index,
        }
    }
}

impl ServiceRegistry for Consul {
    fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        self.request("PUT", "/v1/agent/service/register")
            .send_json(registration_body(registration))
            .map_err(|err| registry_error("register", err))?;
        tracing::debug!(service = %registration.id, "registered service");
        Ok(())
    }

    fn deregister(&self, service_id: &str) -> Result<()> {
        match self
            .request("PUT", &format!("/v1/agent/service/deregister/{service_id}"))
            .call()
        {
            Ok(_) | Err(ureq::Error::Status(404, _)) => {
                tracing::debug!(service = service_id, "deregistered service");
                Ok(())
            }
            Err(err) => Err(registry_error("deregister", err)),
        }
    }

    fn lookup(&self, name: &str) -> Result<Vec<ServiceEntry>> {
        let entries: Vec<CatalogEntry> = self
            .request("GET", &format!("/v1/catalog/service/{name}"))
            .call()
            .map_err(|err| registry_error("lookup", err))?
            .into_json()
            .map_err(|err| Error::Registry {
                operation: "lookup".to_string(),
                message: format!("unparsable catalog response: {err}"),
            })?;
        Ok(entries.into_iter().map(ServiceEntry::from).collect())
    }
}
