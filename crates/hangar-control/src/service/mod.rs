//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::config::{ControlConfig, TransportMode};
use crate::credentials::ManagedKey;
use crate::deployment::{Collaborators, DeploymentManager};
use crate::error::{ControlError, ControlResult};
use crate::inventory;
use crate::provisioner;
use crate::remote::{self, RemoteExecutor};
use crate::store::{DeploymentStore, MemoryStore, PostgresStore};

/// Public key recorded in descriptors when guests are never dialled.
const MOCK_PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAImock hangar-control";

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Database connections
/// - Platform inventory, provisioning driver and remote transport
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service.
    ///
    /// This will:
    /// 1. Connect to the database (or use in-memory store as fallback)
    /// 2. Build the platform collaborators
    /// 3. Create the deployment manager
    /// 4. Start the HTTP API server
    /// 5. Wait for shutdown signal
    pub async fn run(&self) -> ControlResult<()> {
        let store = self.create_store().await;
        let manager = self.create_manager(Arc::clone(&store)).await?;
        info!("deployment manager initialised");

        let state = api::AppState {
            manager: manager.clone(),
            store,
        };

        let app =
            api::with_request_timeout(api::router(state), self.config.server.request_timeout());

        let listener = tokio::net::TcpListener::bind(self.config.server.listen)
            .await
            .map_err(|e| ControlError::Config(format!("failed to bind TCP: {e}")))?;

        info!(listen = %self.config.server.listen, "control service listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.cancel.clone()))
            .await
            .map_err(|e| ControlError::Config(format!("server error: {e}")))?;

        manager.shutdown();
        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn create_store(&self) -> Arc<dyn DeploymentStore> {
        match PostgresStore::connect(&self.config.database).await {
            Ok(store) => {
                info!("connected to PostgreSQL");
                Arc::new(store)
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        }
    }

    async fn create_manager(
        &self,
        store: Arc<dyn DeploymentStore>,
    ) -> ControlResult<DeploymentManager> {
        let inventory = inventory::from_config(&self.config.platform)?;
        info!(mode = ?self.config.platform.mode, "platform inventory configured");

        let driver = provisioner::from_config(&self.config, Arc::clone(&inventory));
        info!(mode = ?self.config.terraform.mode, "provisioning driver configured");

        let key = self.managed_key().await?;
        let transport = remote::from_config(&self.config.ssh, &key);
        info!(mode = ?self.config.ssh.mode, "remote transport configured");

        DeploymentManager::new(
            &self.config,
            Collaborators {
                store,
                inventory,
                driver,
                executor: RemoteExecutor::new(transport, &self.config.ssh),
                key,
            },
        )
    }

    async fn managed_key(&self) -> ControlResult<ManagedKey> {
        match self.config.ssh.mode {
            TransportMode::Openssh => ManagedKey::load_or_generate(&self.config.ssh.key_path).await,
            TransportMode::Mock => Ok(ManagedKey::from_parts(
                self.config.ssh.key_path.clone(),
                MOCK_PUBLIC_KEY,
            )),
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
