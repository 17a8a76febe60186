//! Remote Provisioning Executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::plan::{setup_plan, stop_script};
use super::{RemoteSession, RemoteTransport};
use crate::config::SshConfig;
use crate::error::{ControlError, ControlResult};
use crate::logs::DeploymentLog;
use crate::types::{DeploymentData, Framework};

/// Waits for guests to become reachable and runs setup scripts on them.
pub struct RemoteExecutor {
    transport: Arc<dyn RemoteTransport>,
    retry_interval: Duration,
    retry_ceiling: Duration,
}

impl RemoteExecutor {
    /// Create an executor using the retry settings in `config`.
    #[must_use]
    pub fn new(transport: Arc<dyn RemoteTransport>, config: &SshConfig) -> Self {
        Self::with_retry(transport, config.retry_interval(), config.retry_ceiling())
    }

    /// Create an executor with explicit retry settings.
    #[must_use]
    pub fn with_retry(
        transport: Arc<dyn RemoteTransport>,
        retry_interval: Duration,
        retry_ceiling: Duration,
    ) -> Self {
        Self {
            transport,
            retry_interval,
            retry_ceiling,
        }
    }

    /// Connect to `address`, retrying with a fixed interval until the
    /// ceiling is reached.
    pub async fn connect(
        &self,
        address: &str,
        log: &DeploymentLog,
        cancel: &CancellationToken,
    ) -> ControlResult<Box<dyn RemoteSession>> {
        let start = Instant::now();
        let deadline = start + self.retry_ceiling;
        let mut attempts = 0u32;

        log.append("connect", &format!("waiting for {address} to accept connections"))
            .await;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            let last_error = match timeout(remaining, self.transport.connect(address)).await {
                Ok(Ok(session)) => {
                    info!(address, attempts, "guest reachable");
                    log.append("connect", &format!("connected after {attempts} attempt(s)"))
                        .await;
                    return Ok(session);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "connection attempt timed out".to_owned(),
            };

            debug!(address, attempts, error = %last_error, "guest not reachable yet");

            if Instant::now() + self.retry_interval >= deadline {
                let waited_secs = start.elapsed().as_secs();
                log.append(
                    "connect",
                    &format!("gave up after {attempts} attempt(s): {last_error}"),
                )
                .await;
                return Err(ControlError::RemoteUnreachable {
                    address: address.to_owned(),
                    waited_secs,
                    last_error,
                });
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ControlError::Cancelled(format!(
                        "connection to {address} cancelled"
                    )));
                }
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Install and start the deployment's application on `address`.
    ///
    /// Steps run in order and the first failure aborts the rest.
    #[instrument(skip_all, fields(deployment_id = %data.id, address = %address))]
    pub async fn configure(
        &self,
        address: &str,
        data: &DeploymentData,
        log: &DeploymentLog,
        cancel: &CancellationToken,
    ) -> ControlResult<()> {
        let steps = setup_plan(data.framework, &data.repo_url, &data.env_vars)?;
        let session = self.connect(address, log, cancel).await?;

        for step in &steps {
            debug!(step = step.name, "running remote step");
            log.append(step.name, "starting").await;
            run_step(session.as_ref(), step.name, &step.script, log).await?;
        }

        info!(steps = steps.len(), "application configured");
        Ok(())
    }

    /// Stop the supervised application on `address`.
    ///
    /// Makes a single connection attempt.
    #[instrument(skip(self, log))]
    pub async fn stop(
        &self,
        address: &str,
        framework: Framework,
        log: &DeploymentLog,
    ) -> ControlResult<()> {
        let session = self.transport.connect(address).await.map_err(|e| {
            ControlError::RemoteUnreachable {
                address: address.to_owned(),
                waited_secs: 0,
                last_error: e.to_string(),
            }
        })?;
        run_step(session.as_ref(), "stop", &stop_script(framework), log).await
    }
}

async fn run_step(
    session: &dyn RemoteSession,
    step: &'static str,
    script: &str,
    log: &DeploymentLog,
) -> ControlResult<()> {
    let output = match session.run(script).await {
        Ok(output) => output,
        Err(e) => {
            log.append(step, &e.to_string()).await;
            return Err(ControlError::RemoteCommandFailed {
                step: step.to_owned(),
                exit_code: -1,
                stderr: e.to_string(),
            });
        }
    };

    if !output.stdout.is_empty() {
        log.append(step, &output.stdout).await;
    }
    if !output.stderr.is_empty() {
        log.append(step, &output.stderr).await;
    }

    if output.success() {
        Ok(())
    } else {
        warn!(step, exit_code = output.exit_code, "remote step failed");
        Err(ControlError::RemoteCommandFailed {
            step: step.to_owned(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("retry_interval", &self.retry_interval)
            .field("retry_ceiling", &self.retry_ceiling)
            .finish_non_exhaustive()
    }
}
