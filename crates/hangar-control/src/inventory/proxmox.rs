//! Proxmox VE inventory client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::PlatformConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::DeploymentKind;

use super::{PlatformInventory, PlatformResource};

/// Proxmox wraps every payload in `{"data": ...}`.
#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Proxmox reports `vmid` as a number for VMs and sometimes a string for
/// containers.
#[derive(Deserialize)]
#[serde(untagged)]
enum VmId {
    Number(u32),
    Text(String),
}

impl VmId {
    fn value(&self) -> Option<u32> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct RawGuest {
    vmid: VmId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cpus: Option<f64>,
    #[serde(default)]
    maxmem: Option<u64>,
    #[serde(default)]
    maxdisk: Option<u64>,
}

impl RawGuest {
    fn into_resource(self, kind: DeploymentKind) -> Option<PlatformResource> {
        let id = self.vmid.value()?;
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cores = self.cpus.map(|c| c as u32);
        Some(PlatformResource {
            id,
            name: self.name.unwrap_or_else(|| format!("{kind}-{id}")),
            kind,
            status: self.status.unwrap_or_else(|| "unknown".to_owned()),
            cores,
            memory_bytes: self.maxmem,
            disk_bytes: self.maxdisk,
        })
    }
}

/// Container interface from `/lxc/{id}/interfaces`.
#[derive(Debug, Deserialize)]
pub(crate) struct LxcInterface {
    name: String,
    #[serde(default)]
    inet: Option<String>,
}

/// Guest agent reply from `agent/network-get-interfaces`.
#[derive(Debug, Deserialize)]
pub(crate) struct AgentReply {
    #[serde(default)]
    result: Vec<AgentInterface>,
}

#[derive(Debug, Deserialize)]
struct AgentInterface {
    name: String,
    #[serde(default, rename = "ip-addresses")]
    ip_addresses: Vec<AgentAddress>,
}

#[derive(Debug, Deserialize)]
struct AgentAddress {
    #[serde(rename = "ip-address-type")]
    kind: String,
    #[serde(rename = "ip-address")]
    address: String,
}

/// First usable IPv4 address on a container's `eth0`.
pub(crate) fn lxc_address(interfaces: &[LxcInterface]) -> Option<String> {
    interfaces
        .iter()
        .filter(|iface| iface.name == "eth0")
        .filter_map(|iface| iface.inet.as_deref())
        .map(|inet| inet.split('/').next().unwrap_or_default())
        .find(|ip| !ip.is_empty() && *ip != "0.0.0.0")
        .map(ToOwned::to_owned)
}

/// First non-loopback IPv4 address the guest agent reports on the primary NIC.
pub(crate) fn agent_address(reply: &AgentReply) -> Option<String> {
    reply
        .result
        .iter()
        .filter(|iface| iface.name == "eth0" || iface.name == "ens18")
        .flat_map(|iface| iface.ip_addresses.iter())
        .filter(|addr| addr.kind == "ipv4" && !addr.address.starts_with("127."))
        .map(|addr| addr.address.clone())
        .next()
}

/// HTTP client for the Proxmox VE API.
#[derive(Debug, Clone)]
pub struct ProxmoxInventory {
    client: Client,
    base_url: String,
    node: String,
}

impl ProxmoxInventory {
    /// Create a new client from configuration.
    pub fn new(config: &PlatformConfig) -> ControlResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(secret) = &config.token_secret {
            let mut value = HeaderValue::from_str(&format!(
                "PVEAPIToken={}={}",
                config.token_id,
                secret.expose()
            ))
            .map_err(|e| ControlError::Config(format!("invalid API token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .default_headers(headers)
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            node: config.node.clone(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ControlResult<Option<T>> {
        let url = format!("{}/nodes/{}/{path}", self.base_url, self.node);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ControlError::inventory(format!("GET {url}: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                let envelope: Envelope<T> = response
                    .json()
                    .await
                    .map_err(|e| ControlError::inventory(format!("GET {url}: {e}")))?;
                Ok(Some(envelope.data))
            }
            // The guest agent answers 500 until it is up.
            StatusCode::NOT_FOUND | StatusCode::INTERNAL_SERVER_ERROR => {
                debug!(url = %url, status = %response.status(), "inventory object not ready");
                Ok(None)
            }
            status => Err(ControlError::inventory(format!("GET {url}: {status}"))),
        }
    }

    async fn list_kind(&self, kind: DeploymentKind) -> ControlResult<Vec<PlatformResource>> {
        let path = match kind {
            DeploymentKind::Vm => "qemu",
            DeploymentKind::Lxc => "lxc",
        };
        let guests: Vec<RawGuest> = self
            .get(path)
            .await?
            .ok_or_else(|| ControlError::inventory(format!("node {} not found", self.node)))?;

        Ok(guests
            .into_iter()
            .filter_map(|g| g.into_resource(kind))
            .collect())
    }
}

#[async_trait]
impl PlatformInventory for ProxmoxInventory {
    async fn list_resources(&self) -> ControlResult<Vec<PlatformResource>> {
        let mut resources = self.list_kind(DeploymentKind::Vm).await?;
        resources.extend(self.list_kind(DeploymentKind::Lxc).await?);
        resources.sort_by_key(|r| r.id);
        Ok(resources)
    }

    async fn resource_address(
        &self,
        resource_id: u32,
        kind: DeploymentKind,
    ) -> ControlResult<Option<String>> {
        match kind {
            DeploymentKind::Lxc => {
                let interfaces: Option<Vec<LxcInterface>> = self
                    .get(&format!("lxc/{resource_id}/interfaces"))
                    .await?;
                Ok(interfaces.as_deref().and_then(lxc_address))
            }
            DeploymentKind::Vm => {
                let reply: Option<AgentReply> = self
                    .get(&format!("qemu/{resource_id}/agent/network-get-interfaces"))
                    .await?;
                Ok(reply.as_ref().and_then(agent_address))
            }
        }
    }
}
