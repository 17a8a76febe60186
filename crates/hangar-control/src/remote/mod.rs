//! Remote setup of provisioned guests.
//!
//! A [`RemoteTransport`] opens sessions to a guest address; a
//! [`RemoteSession`] runs shell scripts on it. The [`RemoteExecutor`] waits
//! for the guest to accept connections and then runs the setup plan built by
//! [`plan::setup_plan`].

mod executor;
mod mock;
mod openssh;
pub mod plan;

pub use executor::RemoteExecutor;
pub use mock::{MockTransport, MockTransportMode};
pub use openssh::OpenSshTransport;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{SshConfig, TransportMode};
use crate::credentials::ManagedKey;
use crate::error::ControlResult;

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status of the remote shell.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Opens sessions to guests.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Connect to `address`. Fails when the guest does not accept the
    /// connection yet.
    async fn connect(&self, address: &str) -> ControlResult<Box<dyn RemoteSession>>;
}

/// A connection to one guest.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `script` with the remote shell.
    async fn run(&self, script: &str) -> ControlResult<CommandOutput>;
}

/// Build the transport selected by configuration.
pub fn from_config(config: &SshConfig, key: &ManagedKey) -> Arc<dyn RemoteTransport> {
    match config.mode {
        TransportMode::Openssh => Arc::new(OpenSshTransport::new(config, key)),
        TransportMode::Mock => Arc::new(MockTransport::new(MockTransportMode::Accept)),
    }
}
