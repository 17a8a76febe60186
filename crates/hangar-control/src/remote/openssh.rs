//! Transport over the system OpenSSH client.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{CommandOutput, RemoteSession, RemoteTransport};
use crate::config::SshConfig;
use crate::credentials::ManagedKey;
use crate::error::{ControlError, ControlResult};

/// Exit status ssh uses for its own failures.
const SSH_ERROR_EXIT: i32 = 255;

/// Runs commands through the `ssh` binary, one process per command.
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    user: String,
    key_path: PathBuf,
    jump: Option<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl OpenSshTransport {
    /// Create a transport that authenticates with `key`.
    #[must_use]
    pub fn new(config: &SshConfig, key: &ManagedKey) -> Self {
        Self {
            user: config.user.clone(),
            key_path: key.private_key().to_path_buf(),
            jump: config
                .jump_host
                .as_ref()
                .map(|host| format!("{}@{host}", config.jump_user)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    /// Arguments placed before the remote command.
    fn base_args(&self, address: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            "StrictHostKeyChecking=accept-new".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_owned(),
            "ServerAliveInterval=30".to_owned(),
            "-i".to_owned(),
            self.key_path.display().to_string(),
        ];
        if let Some(jump) = &self.jump {
            args.push("-J".to_owned());
            args.push(jump.clone());
        }
        args.push(format!("{}@{address}", self.user));
        args
    }
}

#[async_trait]
impl RemoteTransport for OpenSshTransport {
    async fn connect(&self, address: &str) -> ControlResult<Box<dyn RemoteSession>> {
        let session = OpenSshSession {
            args: self.base_args(address),
            command_timeout: self.command_timeout,
        };

        let probe = session.exec("true", self.connect_timeout * 2).await?;
        if probe.exit_code == SSH_ERROR_EXIT {
            return Err(ControlError::internal(format!(
                "ssh to {address} failed: {}",
                probe.stderr.trim()
            )));
        }

        debug!(address, "ssh connection established");
        Ok(Box::new(session))
    }
}

struct OpenSshSession {
    args: Vec<String>,
    command_timeout: Duration,
}

impl OpenSshSession {
    /// Pipe `script` into `bash -se` on the guest.
    async fn exec(&self, script: &str, limit: Duration) -> ControlResult<CommandOutput> {
        let mut child = Command::new("ssh")
            .args(&self.args)
            .arg("bash -se")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlError::internal(format!("failed to spawn ssh: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.shutdown().await?;
        }

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ControlError::internal(format!(
                    "remote command timed out after {}s",
                    limit.as_secs()
                )));
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn run(&self, script: &str) -> ControlResult<CommandOutput> {
        self.exec(script, self.command_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(jump_host: Option<&str>) -> OpenSshTransport {
        let config = SshConfig {
            jump_host: jump_host.map(ToOwned::to_owned),
            jump_user: "hv".to_owned(),
            ..SshConfig::default()
        };
        let key = ManagedKey::from_parts("/keys/id_ed25519", "ssh-ed25519 AAAA");
        OpenSshTransport::new(&config, &key)
    }

    #[test]
    fn args_without_jump_host() {
        let args = transport(None).base_args("10.0.0.4");
        assert_eq!(args.last().map(String::as_str), Some("root@10.0.0.4"));
        assert!(args.contains(&"BatchMode=yes".to_owned()));
        assert!(args.contains(&"/keys/id_ed25519".to_owned()));
        assert!(!args.contains(&"-J".to_owned()));
    }

    #[test]
    fn args_with_jump_host() {
        let args = transport(Some("pve.local")).base_args("10.0.0.4");
        let jump = args.iter().position(|a| a == "-J").unwrap();
        assert_eq!(args[jump + 1], "hv@pve.local");
    }
}
