//! Provisioning drivers.
//!
//! A driver turns a rendered workspace into running infrastructure and tears
//! it down again. Drivers never retry: a failed apply is reported once and
//! the orchestrator decides what happens next.

mod terraform;

pub use terraform::{parse_outputs, TerraformDriver, TerraformOutputs};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ControlConfig, DriverMode};
use crate::descriptor::Workspace;
use crate::error::{ControlError, ControlResult};
use crate::inventory::PlatformInventory;
use crate::logs::DeploymentLog;
use crate::types::{DeploymentId, DeploymentKind};

/// Everything a driver needs to apply one deployment's workspace.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Deployment being provisioned.
    pub deployment_id: DeploymentId,
    /// VM or container.
    pub kind: DeploymentKind,
    /// Identifier reserved by the allocator.
    pub resource_id: u32,
    /// Workspace holding the rendered descriptor.
    pub workspace: Workspace,
    /// Deployment log sink.
    pub log: DeploymentLog,
}

/// Result of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResult {
    /// Network address of the guest.
    pub address: String,
    /// Platform identifier of the guest.
    pub platform_id: u32,
}

/// Drives an infrastructure tool through its lifecycle.
#[async_trait]
pub trait ProvisioningDriver: Send + Sync {
    /// Create (or converge) the infrastructure described in the workspace.
    ///
    /// `cancel` only interrupts waiting for an address; the tool itself is
    /// always allowed to finish.
    async fn apply(
        &self,
        request: &ApplyRequest,
        cancel: &CancellationToken,
    ) -> ControlResult<ProvisionResult>;

    /// Destroy the infrastructure and remove the workspace on success.
    async fn destroy(&self, workspace: &Workspace, log: &DeploymentLog) -> ControlResult<()>;
}

/// Create the driver selected by configuration.
pub fn from_config(
    config: &ControlConfig,
    inventory: Arc<dyn PlatformInventory>,
) -> Arc<dyn ProvisioningDriver> {
    match config.terraform.mode {
        DriverMode::Terraform => Arc::new(TerraformDriver::new(config, inventory)),
        DriverMode::Mock => Arc::new(MockDriver::default()),
    }
}

#[derive(Debug, Default)]
struct MockState {
    failing_applies: u32,
    destroy_error: Option<String>,
    apply_delay: Duration,
    destroy_delay: Duration,
    applies: Vec<DeploymentId>,
    destroys: usize,
}

/// Driver that provisions nothing.
///
/// Apply returns the requested identifier and an address derived from it.
#[derive(Debug, Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    /// Create a new mock driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` applies.
    pub fn fail_next_applies(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_applies = count;
        }
    }

    /// Make every destroy fail with `message`.
    pub fn fail_destroy(&self, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.destroy_error = Some(message.into());
        }
    }

    /// Hold each apply for `delay` before completing.
    pub fn set_apply_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.apply_delay = delay;
        }
    }

    /// Hold each destroy for `delay` before completing.
    pub fn set_destroy_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.destroy_delay = delay;
        }
    }

    /// Number of apply calls so far.
    #[must_use]
    pub fn apply_count(&self) -> usize {
        self.state.lock().map(|s| s.applies.len()).unwrap_or(0)
    }

    /// Number of destroy calls so far.
    #[must_use]
    pub fn destroy_count(&self) -> usize {
        self.state.lock().map(|s| s.destroys).unwrap_or(0)
    }

    /// Address handed out for `resource_id`.
    #[must_use]
    pub fn address_for(resource_id: u32) -> String {
        format!("10.0.{}.{}", resource_id / 256, resource_id % 256)
    }
}

#[async_trait]
impl ProvisioningDriver for MockDriver {
    async fn apply(
        &self,
        request: &ApplyRequest,
        _cancel: &CancellationToken,
    ) -> ControlResult<ProvisionResult> {
        let delay = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ControlError::internal("lock poisoned"))?;
            state.applies.push(request.deployment_id.clone());
            state.apply_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fail = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ControlError::internal("lock poisoned"))?;
            if state.failing_applies > 0 {
                state.failing_applies -= 1;
                true
            } else {
                false
            }
        };

        if fail {
            request.log.append("apply", "mock apply failed").await;
            return Err(ControlError::provisioning("mock apply failed"));
        }

        request
            .log
            .append("apply", &format!("mock {} {} created", request.kind, request.resource_id))
            .await;

        Ok(ProvisionResult {
            address: Self::address_for(request.resource_id),
            platform_id: request.resource_id,
        })
    }

    async fn destroy(&self, workspace: &Workspace, log: &DeploymentLog) -> ControlResult<()> {
        let (error, delay) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ControlError::internal("lock poisoned"))?;
            state.destroys += 1;
            (state.destroy_error.clone(), state.destroy_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = error {
            log.append("destroy", &message).await;
            return Err(ControlError::DestroyFailed(message));
        }

        log.append("destroy", "mock resources destroyed").await;
        workspace.remove().await
    }
}
