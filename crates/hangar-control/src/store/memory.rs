//! In-memory deployment store.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::state::{check_transition, DeploymentStatus};
use crate::types::{DeploymentId, DeploymentRecord, StatusPatch};

use super::{DeploymentFilter, DeploymentStore};

/// In-memory deployment store.
///
/// Used by tests and when no database is reachable. Data is lost when the
/// process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_live(record: &DeploymentRecord) -> bool {
    record.status != DeploymentStatus::Deleted
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let key = record.data.id.as_str().to_owned();
        if deployments.contains_key(&key) {
            return Err(ControlError::internal(format!(
                "deployment {key} already exists"
            )));
        }
        if deployments
            .values()
            .any(|r| is_live(r) && r.data.name == record.data.name)
        {
            return Err(ControlError::DuplicateName(record.data.name.clone()));
        }

        deployments.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments.get(id.as_str()).cloned())
    }

    async fn get_by_name(&self, name: &str) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments
            .values()
            .find(|r| is_live(r) && r.data.name == name)
            .cloned())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|r| filter.admits(r.status))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.data.created_at.cmp(&a.data.created_at));

        #[allow(clippy::as_conversions)]
        let offset = filter.offset.unwrap_or(0) as usize;
        let results = results.into_iter().skip(offset);

        if let Some(limit) = filter.limit {
            #[allow(clippy::as_conversions)]
            Ok(results.take(limit as usize).collect())
        } else {
            Ok(results.collect())
        }
    }

    async fn transition(
        &self,
        id: &DeploymentId,
        from: DeploymentStatus,
        to: DeploymentStatus,
        patch: StatusPatch,
    ) -> ControlResult<DeploymentRecord> {
        check_transition(from, to)?;

        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let record = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;

        if record.status != from {
            return Err(ControlError::StaleState {
                id: id.to_string(),
                expected: from.as_str(),
                actual: record.status.as_str(),
            });
        }

        patch.apply_to(&mut record.data);
        record.status = to;

        Ok(record.clone())
    }

    async fn reserve_resource_id(&self, id: &DeploymentId, resource_id: u32) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if deployments.values().any(|r| {
            is_live(r) && r.data.resource_id == Some(resource_id) && r.data.id != *id
        }) {
            return Err(ControlError::internal(format!(
                "resource id {resource_id} is already reserved"
            )));
        }

        let record = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
        record.data.resource_id = Some(resource_id);
        record.data.updated_at = chrono::Utc::now();

        Ok(())
    }

    async fn used_resource_ids(&self) -> ControlResult<BTreeSet<u32>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments
            .values()
            .filter(|r| is_live(r))
            .filter_map(|r| r.data.resource_id)
            .collect())
    }
}
