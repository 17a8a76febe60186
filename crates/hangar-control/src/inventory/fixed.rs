//! Fixed inventory for tests and platform-less runs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::DeploymentKind;

use super::{PlatformInventory, PlatformResource};

/// An inventory whose contents are set by the caller.
#[derive(Debug, Default)]
pub struct StaticInventory {
    resources: RwLock<Vec<PlatformResource>>,
    addresses: RwLock<HashMap<u32, String>>,
    unavailable: RwLock<Option<String>>,
}

impl StaticInventory {
    /// Create an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inventory that reports `ids` as existing containers.
    #[must_use]
    pub fn with_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        let inventory = Self::new();
        for id in ids {
            inventory.add(PlatformResource {
                id,
                name: format!("manual-{id}"),
                kind: DeploymentKind::Lxc,
                status: "running".to_owned(),
                cores: None,
                memory_bytes: None,
                disk_bytes: None,
            });
        }
        inventory
    }

    /// Add an object.
    pub fn add(&self, resource: PlatformResource) {
        if let Ok(mut resources) = self.resources.write() {
            resources.retain(|r| r.id != resource.id);
            resources.push(resource);
        }
    }

    /// Remove an object.
    pub fn remove(&self, id: u32) {
        if let Ok(mut resources) = self.resources.write() {
            resources.retain(|r| r.id != id);
        }
    }

    /// Report `address` for object `id`.
    pub fn set_address(&self, id: u32, address: impl Into<String>) {
        if let Ok(mut addresses) = self.addresses.write() {
            addresses.insert(id, address.into());
        }
    }

    /// Make every query fail with `reason`, or recover with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        if let Ok(mut unavailable) = self.unavailable.write() {
            *unavailable = reason.map(ToOwned::to_owned);
        }
    }

    fn check_available(&self) -> ControlResult<()> {
        let unavailable = self
            .unavailable
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        match unavailable.as_deref() {
            Some(reason) => Err(ControlError::inventory(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformInventory for StaticInventory {
    async fn list_resources(&self) -> ControlResult<Vec<PlatformResource>> {
        self.check_available()?;
        let resources = self
            .resources
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        Ok(resources.clone())
    }

    async fn resource_address(
        &self,
        resource_id: u32,
        _kind: DeploymentKind,
    ) -> ControlResult<Option<String>> {
        self.check_available()?;
        let addresses = self
            .addresses
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        Ok(addresses.get(&resource_id).cloned())
    }
}
