//! Virtualisation platform inventory.
//!
//! The inventory is the platform's own view of which compute objects exist.
//! The allocator trusts it over the local store, and the provisioning driver
//! falls back to it when the infrastructure tool cannot observe an address.

mod proxmox;
mod fixed;

pub use fixed::StaticInventory;
pub use proxmox::ProxmoxInventory;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{InventoryMode, PlatformConfig};
use crate::error::ControlResult;
use crate::types::DeploymentKind;

/// A VM or container as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformResource {
    /// Platform resource identifier.
    pub id: u32,
    /// Name (hostname) on the platform.
    pub name: String,
    /// VM or container.
    pub kind: DeploymentKind,
    /// Platform status, e.g. `running` or `stopped`.
    pub status: String,
    /// Allocated CPU cores.
    pub cores: Option<u32>,
    /// Allocated memory in bytes.
    pub memory_bytes: Option<u64>,
    /// Allocated disk in bytes.
    pub disk_bytes: Option<u64>,
}

impl PlatformResource {
    /// Whether the platform reports the object as running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Query interface for the compute objects that exist on the platform.
#[async_trait]
pub trait PlatformInventory: Send + Sync {
    /// List every VM and container on the node.
    async fn list_resources(&self) -> ControlResult<Vec<PlatformResource>>;

    /// Identifiers currently allocated on the platform.
    async fn resource_ids(&self) -> ControlResult<BTreeSet<u32>> {
        Ok(self.list_resources().await?.into_iter().map(|r| r.id).collect())
    }

    /// Network address the platform observes for an object, if any yet.
    async fn resource_address(
        &self,
        resource_id: u32,
        kind: DeploymentKind,
    ) -> ControlResult<Option<String>>;
}

/// Build the inventory selected by configuration.
pub fn from_config(config: &PlatformConfig) -> ControlResult<Arc<dyn PlatformInventory>> {
    match config.mode {
        InventoryMode::Proxmox => Ok(Arc::new(ProxmoxInventory::new(config)?)),
        InventoryMode::Static => Ok(Arc::new(StaticInventory::new())),
    }
}
