//! Hangar control service binary.
//!
//! Runs the deployment pipeline and its HTTP API.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hangar_control::{ControlConfig, ControlService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("hangar_control=info".parse()?),
        )
        .init();

    info!("hangar control service starting");

    // Load configuration
    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        listen = %config.server.listen,
        platform = ?config.platform.mode,
        driver = ?config.terraform.mode,
        transport = ?config.ssh.mode,
        "configuration loaded"
    );

    let service = ControlService::new(config);
    if let Err(e) = service.run().await {
        error!(error = %e, "control service failed");
        return Err(e.into());
    }

    Ok(())
}
