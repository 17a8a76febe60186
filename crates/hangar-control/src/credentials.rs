//! Managed SSH key pair.
//!
//! The orchestrator owns one ed25519 key pair. The public half is injected
//! into every descriptor; the private half stays on this host and is only
//! handed to the ssh client by path.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};

/// Comment attached to generated keys.
const KEY_COMMENT: &str = "hangar-control";

/// The key pair used to reach provisioned guests.
#[derive(Debug, Clone)]
pub struct ManagedKey {
    private_key: PathBuf,
    public_key: String,
}

impl ManagedKey {
    /// Use an existing key pair without touching the filesystem.
    #[must_use]
    pub fn from_parts(private_key: impl Into<PathBuf>, public_key: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: public_key.into(),
        }
    }

    /// Load the key at `path`, generating it first if it does not exist.
    pub async fn load_or_generate(path: &Path) -> ControlResult<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            generate(path).await?;
        }
        let public_key = load_public_key(path).await?;
        Ok(Self {
            private_key: path.to_path_buf(),
            public_key,
        })
    }

    /// Path of the private key.
    #[must_use]
    pub fn private_key(&self) -> &Path {
        &self.private_key
    }

    /// OpenSSH-format public key.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

async fn generate(key_path: &Path) -> ControlResult<()> {
    if let Some(parent) = key_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    info!(path = %key_path.display(), "generating managed SSH key");

    let output = Command::new("ssh-keygen")
        .arg("-t")
        .arg("ed25519")
        .arg("-f")
        .arg(key_path)
        .arg("-N")
        .arg("")
        .arg("-C")
        .arg(KEY_COMMENT)
        .output()
        .await
        .map_err(|e| ControlError::internal(format!("failed to run ssh-keygen: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ControlError::internal(format!("ssh-keygen failed: {stderr}")));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

async fn load_public_key(private_key_path: &Path) -> ControlResult<String> {
    let public_key_path = private_key_path.with_extension("pub");

    match tokio::fs::read_to_string(&public_key_path).await {
        Ok(content) => return Ok(content.trim().to_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let output = Command::new("ssh-keygen")
        .arg("-y")
        .arg("-f")
        .arg(private_key_path)
        .output()
        .await
        .map_err(|e| ControlError::internal(format!("failed to run ssh-keygen: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ControlError::internal(format!("ssh-keygen -y failed: {stderr}")));
    }

    let public_key = String::from_utf8_lossy(&output.stdout).trim().to_owned();

    if let Err(e) = tokio::fs::write(&public_key_path, format!("{public_key}\n")).await {
        warn!(
            path = %public_key_path.display(),
            error = %e,
            "failed to cache public key"
        );
    }

    Ok(public_key)
}
