//! Deployment orchestration and lifecycle management.
//!
//! The manager records a deployment, then walks it through allocation,
//! infrastructure apply and remote configuration in a background task.
//! Deletes and stops are served against whatever state the record is in.

mod manager;

pub use manager::{Collaborators, DeploymentManager, SyncReport, IMPORTED_REPOSITORY};
