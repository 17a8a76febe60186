//! Hangar Control Plane
//!
//! This crate turns a request of the form "deploy this repository with this
//! framework on a VM or container of this size" into a running application
//! on a Proxmox-style virtualisation host.
//!
//! # Architecture
//!
//! A deployment passes through four collaborators:
//!
//! - **Allocation**: [`allocator::ResourceAllocator`] picks a platform-unique
//!   resource identifier from the union of recorded and live identifiers
//! - **Provisioning**: a [`provisioner::ProvisioningDriver`] renders an
//!   infrastructure descriptor into a per-deployment workspace and applies it
//!   with an external infrastructure-as-code tool
//! - **Remote setup**: [`remote::RemoteExecutor`] waits for the guest to
//!   accept SSH and runs the framework's setup plan
//! - **Persistence**: a [`store::DeploymentStore`] records every status
//!   change with check-and-set semantics
//!
//! [`deployment::DeploymentManager`] runs the pipeline in the background and
//! serves stop and delete requests; [`api`] exposes it over HTTP.
//!
//! # State Machine
//!
//! ```text
//! Pending ──▶ Provisioning ──▶ Deploying ──▶ Running ──▶ Stopped
//!                  │               │
//!                  ▼               ▼
//!                Failed          Failed
//!
//! any non-deleted status ──▶ Deleted
//! ```
//!
//! Forward pipeline steps are typed ([`state::Stage`]), and every persisted
//! transition is checked against [`state::DeploymentStatus::can_transition_to`].

#![forbid(unsafe_code)]

pub mod allocator;
pub mod api;
pub mod config;
pub mod credentials;
pub mod deployment;
pub mod descriptor;
pub mod error;
pub mod inventory;
pub mod logs;
pub mod provisioner;
pub mod remote;
pub mod service;
pub mod state;
pub mod store;
pub mod types;
pub mod validation;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::{Collaborators, DeploymentManager, SyncReport};
pub use error::{ControlError, ControlResult};
pub use service::ControlService;
pub use state::{DeploymentStatus, Stage};
pub use store::{DeploymentFilter, DeploymentStore, MemoryStore, PostgresStore};
pub use types::{
    DeploymentData, DeploymentId, DeploymentKind, DeploymentRecord, DeploymentRequest,
    DeploymentView, Framework, ResourceSpec,
};
pub use validation::validate_request;
