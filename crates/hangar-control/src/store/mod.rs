//! Deployment storage backends.
//!
//! This module provides the store trait and its implementations. The primary
//! implementation uses PostgreSQL, and an in-memory implementation backs tests
//! and database-less runs.
//!
//! Records are never removed: deletion is a transition to
//! [`DeploymentStatus::Deleted`]. Every status change is a check-and-set
//! against the caller's expected predecessor, which is what keeps two
//! pipelines from racing on one deployment.

mod memory;
mod postgres;

use std::collections::BTreeSet;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::state::DeploymentStatus;
use crate::types::{DeploymentId, DeploymentRecord, StatusPatch};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Include soft-deleted records when no status is given.
    pub include_deleted: bool,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new filter that returns every non-deleted deployment.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: None,
            include_deleted: false,
            limit: None,
            offset: None,
        }
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Include soft-deleted records.
    #[must_use]
    pub const fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether a record with `status` passes the filter.
    #[must_use]
    pub fn admits(&self, status: DeploymentStatus) -> bool {
        match self.status {
            Some(wanted) => status == wanted,
            None => self.include_deleted || status != DeploymentStatus::Deleted,
        }
    }
}

/// Backend for storing deployment records.
///
/// Every operation is atomic at the single-record level.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment record.
    ///
    /// Fails with `DuplicateName` if a non-deleted deployment already uses the
    /// record's name.
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Get a deployment by ID.
    ///
    /// Returns `None` if the deployment does not exist.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Get the non-deleted deployment with this name.
    async fn get_by_name(&self, name: &str) -> ControlResult<Option<DeploymentRecord>>;

    /// List deployments matching the filter criteria.
    ///
    /// Results are ordered by `created_at` descending (newest first).
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// Move a deployment from `from` to `to`, writing `patch` with it.
    ///
    /// The transition must be in the table, and the persisted status must
    /// still be `from`; otherwise the update fails with
    /// `InvalidStateTransition` or `StaleState` and nothing is written.
    async fn transition(
        &self,
        id: &DeploymentId,
        from: DeploymentStatus,
        to: DeploymentStatus,
        patch: StatusPatch,
    ) -> ControlResult<DeploymentRecord>;

    /// Record `resource_id` as held by the deployment before infrastructure
    /// exists.
    async fn reserve_resource_id(&self, id: &DeploymentId, resource_id: u32) -> ControlResult<()>;

    /// Resource identifiers held by non-deleted deployments.
    async fn used_resource_ids(&self) -> ControlResult<BTreeSet<u32>>;
}
