//! Terraform driver.
//!
//! Runs the `terraform` binary inside a deployment workspace. Output from
//! every invocation is streamed into the deployment log. A running
//! invocation is never interrupted by cancellation; only the wait for an
//! address afterwards is.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{ApplyRequest, ProvisionResult, ProvisioningDriver};
use crate::config::{ControlConfig, Secret};
use crate::descriptor::Workspace;
use crate::error::{ControlError, ControlResult};
use crate::inventory::PlatformInventory;
use crate::logs::DeploymentLog;
use crate::types::DeploymentKind;

/// Address value reported before the guest has one.
const PENDING_ADDRESS: &str = "pending";

/// Lines of stderr quoted in a failure message.
const STDERR_TAIL: usize = 20;

/// Values read from `terraform output -json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerraformOutputs {
    /// Guest address, if one has been reported.
    pub address: Option<String>,
    /// Platform identifier of the guest.
    pub platform_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OutputValue<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u32),
    String(String),
}

#[derive(Debug, Deserialize)]
struct RawOutputs {
    ip_address: Option<OutputValue<Option<String>>>,
    vm_id: Option<OutputValue<NumberOrString>>,
}

/// Parse the JSON printed by `terraform output -json`.
pub fn parse_outputs(json: &str) -> ControlResult<TerraformOutputs> {
    let raw: RawOutputs = serde_json::from_str(json)
        .map_err(|e| ControlError::provisioning(format!("unreadable terraform outputs: {e}")))?;

    let address = raw
        .ip_address
        .and_then(|o| o.value)
        .map(|a| a.trim().to_owned())
        .filter(|a| !a.is_empty() && a != PENDING_ADDRESS);

    let platform_id = match raw.vm_id.map(|o| o.value) {
        None => None,
        Some(NumberOrString::Number(id)) => Some(id),
        Some(NumberOrString::String(s)) => Some(s.trim().parse().map_err(|_| {
            ControlError::provisioning(format!("terraform reported invalid vm_id {s:?}"))
        })?),
    };

    Ok(TerraformOutputs {
        address,
        platform_id,
    })
}

struct CommandOutput {
    stdout: String,
}

/// Driver that shells out to terraform.
pub struct TerraformDriver {
    binary: PathBuf,
    command_timeout: Duration,
    token_id: String,
    token_secret: Option<Secret>,
    inventory: Arc<dyn PlatformInventory>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl TerraformDriver {
    /// Create a driver from configuration.
    #[must_use]
    pub fn new(config: &ControlConfig, inventory: Arc<dyn PlatformInventory>) -> Self {
        Self {
            binary: config.terraform.binary.clone(),
            command_timeout: Duration::from_secs(config.terraform.command_timeout_secs),
            token_id: config.platform.token_id.clone(),
            token_secret: config.platform.token_secret.clone(),
            inventory,
            poll_interval: Duration::from_secs(config.pipeline.address_poll_interval_secs),
            poll_timeout: Duration::from_secs(config.pipeline.address_poll_timeout_secs),
        }
    }

    async fn run(
        &self,
        workspace: &Workspace,
        args: &[&str],
        log: &DeploymentLog,
        stage: &'static str,
        stream_stdout: bool,
    ) -> ControlResult<CommandOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(workspace.dir())
            .env("TF_IN_AUTOMATION", "1")
            .env("PM_API_TOKEN_ID", &self.token_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(secret) = &self.token_secret {
            cmd.env("PM_API_TOKEN_SECRET", secret.expose());
        }

        debug!(binary = %self.binary.display(), ?args, "spawning terraform");
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            ControlError::provisioning(format!(
                "failed to spawn {}: {e}",
                self.binary.display()
            ))
        })?;

        let stdout_task = collect_lines(child.stdout.take(), log.clone(), stage, stream_stdout);
        let stderr_task = collect_lines(child.stderr.take(), log.clone(), stage, true);

        let status = match timeout(self.command_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ControlError::provisioning(format!(
                    "terraform {stage} process error: {e}"
                )));
            }
            Err(_) => {
                child.kill().await.ok();
                log.append(stage, "timed out").await;
                return Err(ControlError::provisioning(format!(
                    "terraform {stage} timed out after {}s",
                    self.command_timeout.as_secs()
                )));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            let tail = stderr
                .iter()
                .rev()
                .take(STDERR_TAIL)
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(ControlError::provisioning(format!(
                "terraform {stage} failed (exit code {exit_code}): {tail}"
            )));
        }

        info!(
            stage,
            duration_secs = start.elapsed().as_secs_f32(),
            "terraform command finished"
        );

        Ok(CommandOutput {
            stdout: stdout.join("\n"),
        })
    }

    async fn init(&self, workspace: &Workspace, log: &DeploymentLog) -> ControlResult<()> {
        self.run(workspace, &["init", "-input=false", "-no-color"], log, "init", true)
            .await
            .map(|_| ())
    }

    /// Wait for the platform to report an address for the guest.
    async fn poll_address(
        &self,
        resource_id: u32,
        kind: DeploymentKind,
        log: &DeploymentLog,
        cancel: &CancellationToken,
    ) -> ControlResult<String> {
        log.append("address", "waiting for the guest to report an address")
            .await;
        let deadline = Instant::now() + self.poll_timeout;

        loop {
            match self.inventory.resource_address(resource_id, kind).await {
                Ok(Some(address)) => {
                    log.append("address", &format!("guest address is {address}"))
                        .await;
                    return Ok(address);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(resource_id, error = %e, "address lookup failed, retrying");
                }
            }

            if Instant::now() >= deadline {
                return Err(ControlError::provisioning(format!(
                    "no address reported for {kind} {resource_id} after {}s",
                    self.poll_timeout.as_secs()
                )));
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ControlError::Cancelled(format!(
                        "address wait for {kind} {resource_id} cancelled"
                    )));
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Read lines from a child pipe, optionally mirroring them into the log.
fn collect_lines<R>(
    pipe: Option<R>,
    log: DeploymentLog,
    stage: &'static str,
    stream: bool,
) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Vec::new();
        if let Some(pipe) = pipe {
            let mut reader = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if stream {
                    log.append(stage, &line).await;
                }
                lines.push(line);
            }
        }
        lines
    })
}

#[async_trait]
impl ProvisioningDriver for TerraformDriver {
    #[instrument(skip_all, fields(deployment_id = %request.deployment_id, resource_id = request.resource_id))]
    async fn apply(
        &self,
        request: &ApplyRequest,
        cancel: &CancellationToken,
    ) -> ControlResult<ProvisionResult> {
        let workspace = &request.workspace;
        let log = &request.log;

        self.init(workspace, log).await?;
        self.run(
            workspace,
            &["apply", "-auto-approve", "-input=false", "-no-color"],
            log,
            "apply",
            true,
        )
        .await?;

        let output = self
            .run(workspace, &["output", "-json", "-no-color"], log, "output", false)
            .await?;
        let outputs = parse_outputs(&output.stdout)?;

        let platform_id = match outputs.platform_id {
            Some(id) if id != request.resource_id => {
                warn!(
                    reported = id,
                    requested = request.resource_id,
                    "platform assigned a different identifier"
                );
                id
            }
            Some(id) => id,
            None => request.resource_id,
        };

        let address = match outputs.address {
            Some(address) => address,
            None => {
                self.poll_address(platform_id, request.kind, log, cancel)
                    .await?
            }
        };

        info!(%address, platform_id, "infrastructure applied");
        Ok(ProvisionResult {
            address,
            platform_id,
        })
    }

    #[instrument(skip_all, fields(workspace = %workspace.dir().display()))]
    async fn destroy(&self, workspace: &Workspace, log: &DeploymentLog) -> ControlResult<()> {
        if !workspace.exists().await {
            debug!("no workspace, nothing to destroy");
            return Ok(());
        }

        let result = async {
            self.init(workspace, log).await?;
            self.run(
                workspace,
                &["destroy", "-auto-approve", "-input=false", "-no-color"],
                log,
                "destroy",
                true,
            )
            .await
        }
        .await;

        match result {
            Ok(_) => {
                workspace.remove().await?;
                info!("infrastructure destroyed");
                Ok(())
            }
            Err(e) => Err(ControlError::DestroyFailed(e.to_string())),
        }
    }
}

impl std::fmt::Debug for TerraformDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerraformDriver")
            .field("binary", &self.binary)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StaticInventory;
    use crate::types::DeploymentId;

    #[test]
    fn parses_numeric_and_string_ids() {
        let outputs = parse_outputs(
            r#"{"ip_address":{"sensitive":false,"type":"string","value":"192.168.100.41"},
                "vm_id":{"sensitive":false,"type":"number","value":321}}"#,
        )
        .unwrap();
        assert_eq!(outputs.address.as_deref(), Some("192.168.100.41"));
        assert_eq!(outputs.platform_id, Some(321));

        let outputs = parse_outputs(r#"{"vm_id":{"value":"412"}}"#).unwrap();
        assert_eq!(outputs.platform_id, Some(412));
        assert_eq!(outputs.address, None);
    }

    #[test]
    fn pending_address_is_absent() {
        let outputs =
            parse_outputs(r#"{"ip_address":{"value":"pending"},"vm_id":{"value":200}}"#).unwrap();
        assert_eq!(outputs.address, None);

        let outputs = parse_outputs(r#"{"ip_address":{"value":null}}"#).unwrap();
        assert_eq!(outputs.address, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_outputs("not json").is_err());
        assert!(parse_outputs(r#"{"vm_id":{"value":"abc"}}"#).is_err());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write a fake terraform that answers `output` with `outputs` and
        /// fails whenever its first argument is `fail_on`.
        fn fake_terraform(dir: &std::path::Path, outputs: &str, fail_on: &str) -> PathBuf {
            let path = dir.join("terraform");
            let script = format!(
                "#!/bin/sh\n\
                 case \"$1\" in\n\
                 {fail_on}) echo \"Error: $1 refused\" >&2; exit 1 ;;\n\
                 output) echo '{outputs}' ;;\n\
                 *) echo \"$1 complete\" ;;\n\
                 esac\n"
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn driver(binary: PathBuf, inventory: Arc<StaticInventory>) -> TerraformDriver {
            let mut config = ControlConfig::default();
            config.terraform.binary = binary;
            config.pipeline.address_poll_interval_secs = 0;
            config.pipeline.address_poll_timeout_secs = 1;
            TerraformDriver::new(&config, inventory)
        }

        async fn request(dir: &std::path::Path) -> ApplyRequest {
            let id = DeploymentId::new("dep-tf");
            let workspace = Workspace::for_deployment(&dir.join("ws"), &id);
            workspace.write_descriptor("{}").await.unwrap();
            ApplyRequest {
                workspace,
                log: DeploymentLog::at(dir.join("dep-tf.log")),
                deployment_id: id,
                kind: DeploymentKind::Lxc,
                resource_id: 150,
            }
        }

        #[tokio::test]
        async fn apply_reads_outputs_and_logs() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_terraform(
                dir.path(),
                r#"{"ip_address":{"value":"10.1.1.5"},"vm_id":{"value":150}}"#,
                "never",
            );
            let driver = driver(binary, Arc::new(StaticInventory::new()));
            let request = request(dir.path()).await;

            let result = driver
                .apply(&request, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(result.address, "10.1.1.5");
            assert_eq!(result.platform_id, 150);

            let log = std::fs::read_to_string(request.log.path()).unwrap();
            assert!(log.contains("[init] init complete"));
            assert!(log.contains("[apply] apply complete"));
        }

        #[tokio::test]
        async fn pending_address_is_polled_from_inventory() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_terraform(
                dir.path(),
                r#"{"ip_address":{"value":"pending"},"vm_id":{"value":150}}"#,
                "never",
            );
            let inventory = Arc::new(StaticInventory::with_ids([150]));
            inventory.set_address(150, "10.1.1.9");
            let driver = driver(binary, inventory);
            let request = request(dir.path()).await;

            let result = driver
                .apply(&request, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(result.address, "10.1.1.9");
        }

        #[tokio::test]
        async fn missing_address_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_terraform(dir.path(), r#"{"vm_id":{"value":150}}"#, "never");
            let driver = driver(binary, Arc::new(StaticInventory::with_ids([150])));
            let request = request(dir.path()).await;

            let err = driver
                .apply(&request, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ControlError::ProvisioningFailed(_)));
        }

        #[tokio::test]
        async fn failed_apply_reports_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_terraform(dir.path(), "{}", "apply");
            let driver = driver(binary, Arc::new(StaticInventory::new()));
            let request = request(dir.path()).await;

            let err = driver
                .apply(&request, &CancellationToken::new())
                .await
                .unwrap_err();
            match err {
                ControlError::ProvisioningFailed(msg) => {
                    assert!(msg.contains("exit code 1"));
                    assert!(msg.contains("apply refused"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn destroy_removes_workspace_or_fails() {
            let dir = tempfile::tempdir().unwrap();
            let request = request(dir.path()).await;

            let fail_dir = tempfile::tempdir().unwrap();
            let failing = driver(
                fake_terraform(fail_dir.path(), "{}", "destroy"),
                Arc::new(StaticInventory::new()),
            );
            let err = failing
                .destroy(&request.workspace, &request.log)
                .await
                .unwrap_err();
            assert!(matches!(err, ControlError::DestroyFailed(_)));
            assert!(request.workspace.exists().await);

            let ok_dir = tempfile::tempdir().unwrap();
            let working = driver(
                fake_terraform(ok_dir.path(), "{}", "never"),
                Arc::new(StaticInventory::new()),
            );
            working
                .destroy(&request.workspace, &request.log)
                .await
                .unwrap();
            assert!(!request.workspace.exists().await);

            working
                .destroy(&request.workspace, &request.log)
                .await
                .unwrap();
        }
    }
}
