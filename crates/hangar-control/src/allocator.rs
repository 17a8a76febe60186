//! Resource identifier allocation.
//!
//! Identifiers must be unique across the whole platform. The in-use set is
//! computed at call time as the union of what the store has recorded for
//! non-deleted deployments and what the platform inventory reports live, so
//! manually created objects and out-of-band teardowns are both accounted for.
//!
//! Selection draws random candidates from the configured range a bounded
//! number of times, then falls back to a linear scan. The whole
//! read-pick-reserve sequence runs under one process-wide lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::config::AllocatorConfig;
use crate::error::{ControlError, ControlResult};
use crate::inventory::PlatformInventory;
use crate::store::DeploymentStore;
use crate::types::DeploymentId;

/// Pick a free identifier in `start..=end`.
///
/// Tries `random_attempts` uniform draws before scanning linearly for the
/// lowest free value. Returns `None` when every identifier is in use.
pub fn pick_free<R: Rng>(
    start: u32,
    end: u32,
    used: &BTreeSet<u32>,
    rng: &mut R,
    random_attempts: u32,
) -> Option<u32> {
    if start > end {
        return None;
    }

    for _ in 0..random_attempts {
        let candidate = rng.gen_range(start..=end);
        if !used.contains(&candidate) {
            return Some(candidate);
        }
    }

    (start..=end).find(|candidate| !used.contains(candidate))
}

/// Allocates platform-unique resource identifiers.
pub struct ResourceAllocator {
    store: Arc<dyn DeploymentStore>,
    inventory: Arc<dyn PlatformInventory>,
    config: AllocatorConfig,
    region: Mutex<SmallRng>,
}

impl ResourceAllocator {
    /// Create a new allocator.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        inventory: Arc<dyn PlatformInventory>,
        config: AllocatorConfig,
    ) -> ControlResult<Self> {
        if config.range_start == 0 || config.range_start > config.range_end {
            return Err(ControlError::Config(format!(
                "invalid resource id range {}-{}",
                config.range_start, config.range_end
            )));
        }

        Ok(Self {
            store,
            inventory,
            config,
            region: Mutex::new(SmallRng::from_entropy()),
        })
    }

    /// Identifiers in use according to either source.
    ///
    /// An inventory failure is returned rather than ignored.
    pub async fn used_ids(&self) -> ControlResult<BTreeSet<u32>> {
        let mut used = self.store.used_resource_ids().await?;
        let live = self.inventory.resource_ids().await?;
        debug!(stored = used.len(), live = live.len(), "computed in-use resource ids");
        used.extend(live);
        Ok(used)
    }

    /// Allocate an identifier and reserve it against `deployment`.
    #[instrument(skip(self), fields(deployment_id = %deployment))]
    pub async fn allocate(&self, deployment: &DeploymentId) -> ControlResult<u32> {
        let mut rng = self.region.lock().await;

        let used = self.used_ids().await?;
        let resource_id = pick_free(
            self.config.range_start,
            self.config.range_end,
            &used,
            &mut *rng,
            self.config.random_attempts,
        )
        .ok_or(ControlError::AllocationExhausted {
            start: self.config.range_start,
            end: self.config.range_end,
        })?;

        self.store
            .reserve_resource_id(deployment, resource_id)
            .await?;

        info!(resource_id, "allocated resource id");
        Ok(resource_id)
    }
}

impl std::fmt::Debug for ResourceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAllocator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
