//! Deployment state machine.
//!
//! [`DeploymentStatus`] is the persisted tag and owns the single transition
//! table every store update is checked against. The pipeline additionally
//! walks typed stages ([`Stage<S>`]) so a stage cannot be skipped at compile
//! time.
//!
//! # Example
//!
//! ```ignore
//! let pending = Stage::<super::Pending>::begin(record);
//! let provisioning = pending.start_provisioning();
//! let deploying = provisioning.provisioned(address, resource_id);
//! let running = deploying.configured();
//! // pending.configured() would not compile - invalid transition
//! ```

use std::fmt;
use std::marker::PhantomData;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentData, DeploymentId, DeploymentRecord, StatusPatch};

/// Persisted lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, waiting for the pipeline.
    Pending,
    /// Allocating and provisioning infrastructure.
    Provisioning,
    /// Configuring the application on the provisioned host.
    Deploying,
    /// Application is up.
    Running,
    /// A pipeline stage failed.
    Failed,
    /// Application was stopped on request.
    Stopped,
    /// Removed on request. Terminal.
    Deleted,
}

impl DeploymentStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Provisioning,
        Self::Deploying,
        Self::Running,
        Self::Failed,
        Self::Stopped,
        Self::Deleted,
    ];

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }

    /// Whether a pipeline may still be working on this deployment.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Provisioning | Self::Deploying)
    }

    /// The transition table.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            (Self::Deleted, _) => false,
            (_, Self::Deleted) => true,
            (Self::Pending, Self::Provisioning)
            | (Self::Provisioning, Self::Deploying | Self::Failed)
            | (Self::Deploying, Self::Running | Self::Failed)
            | (Self::Running, Self::Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "provisioning" => Ok(Self::Provisioning),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Reject any transition not in the table.
pub fn check_transition(from: DeploymentStatus, to: DeploymentStatus) -> ControlResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ControlError::InvalidStateTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

// =============================================================================
// Typed pipeline stages
// =============================================================================

/// Marker trait for pipeline stages.
pub trait PipelineStage: private::Sealed + Send + Sync {
    /// Status persisted while in this stage.
    fn status() -> DeploymentStatus;
}

mod private {
    pub trait Sealed {}
}

/// Waiting for the pipeline to pick the deployment up.
#[derive(Debug, Clone, Copy)]
pub struct Pending;

/// Allocating an identifier and applying infrastructure.
#[derive(Debug, Clone, Copy)]
pub struct Provisioning;

/// Configuring the application over SSH.
#[derive(Debug, Clone, Copy)]
pub struct Deploying;

/// Application is up.
#[derive(Debug, Clone, Copy)]
pub struct Running;

impl private::Sealed for Pending {}
impl private::Sealed for Provisioning {}
impl private::Sealed for Deploying {}
impl private::Sealed for Running {}

impl PipelineStage for Pending {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Pending
    }
}

impl PipelineStage for Provisioning {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Provisioning
    }
}

impl PipelineStage for Deploying {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Deploying
    }
}

impl PipelineStage for Running {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Running
    }
}

/// A deployment the pipeline holds in a specific stage.
///
/// Each forward step yields the next stage together with the [`StatusPatch`]
/// the store must commit for it.
#[derive(Debug)]
pub struct Stage<S: PipelineStage> {
    data: DeploymentData,
    _stage: PhantomData<S>,
}

impl<S: PipelineStage> Stage<S> {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Status persisted for this stage.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::status()
    }

    fn advance<T: PipelineStage>(self, patch: &StatusPatch) -> (Stage<T>, StatusPatch) {
        let mut data = self.data;
        patch.clone().apply_to(&mut data);
        (
            Stage {
                data,
                _stage: PhantomData,
            },
            patch.clone(),
        )
    }
}

impl Stage<Pending> {
    /// Pick up a freshly created record.
    pub fn begin(record: DeploymentRecord) -> ControlResult<Self> {
        if record.status != DeploymentStatus::Pending {
            return Err(ControlError::InvalidStateTransition {
                from: record.status.as_str(),
                to: DeploymentStatus::Provisioning.as_str(),
            });
        }
        Ok(Self {
            data: record.data,
            _stage: PhantomData,
        })
    }

    /// Start provisioning.
    #[must_use]
    pub fn start_provisioning(self) -> (Stage<Provisioning>, StatusPatch) {
        self.advance(&StatusPatch::default())
    }
}

impl Stage<Provisioning> {
    /// Infrastructure is up at `address` with platform id `resource_id`.
    #[must_use]
    pub fn provisioned(self, address: String, resource_id: u32) -> (Stage<Deploying>, StatusPatch) {
        self.advance(&StatusPatch {
            address: Some(address),
            resource_id: Some(resource_id),
            ..StatusPatch::default()
        })
    }
}

impl Stage<Deploying> {
    /// The application is configured and supervised.
    #[must_use]
    pub fn configured(self) -> (Stage<Running>, StatusPatch) {
        self.advance(&StatusPatch {
            deployed_at: Some(Utc::now()),
            ..StatusPatch::default()
        })
    }

    /// Network address assigned during provisioning.
    #[must_use]
    pub fn address(&self) -> &str {
        self.data.address.as_deref().unwrap_or_default()
    }
}
