//! Infrastructure descriptor generation.
//!
//! A deployment's infrastructure is described as Terraform JSON configuration
//! (`main.tf.json`) in a workspace directory of its own. Rendering is pure;
//! writing the result into the workspace is a separate step.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use url::Url;

use crate::config::{ControlConfig, PlatformConfig};
use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentData, DeploymentId, DeploymentKind};

/// Terraform resource name used for the deployment's guest.
pub const RESOURCE_NAME: &str = "deployment";

/// File name of the rendered descriptor inside a workspace.
pub const DESCRIPTOR_FILE: &str = "main.tf.json";

/// Everything rendering needs besides the deployment itself.
#[derive(Debug, Clone)]
pub struct DescriptorSettings {
    /// Platform placement settings.
    pub platform: PlatformConfig,
    /// Provider registry source.
    pub provider_source: String,
    /// Provider version constraint.
    pub provider_version: String,
    /// Account provisioned with the managed public key.
    pub ssh_user: String,
}

impl DescriptorSettings {
    /// Extract the rendering settings from the full configuration.
    #[must_use]
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            platform: config.platform.clone(),
            provider_source: config.terraform.provider_source.clone(),
            provider_version: config.terraform.provider_version.clone(),
            ssh_user: config.ssh.user.clone(),
        }
    }

    fn check(&self, kind: DeploymentKind, public_key: &str) -> ControlResult<()> {
        let platform = &self.platform;
        if platform.node.trim().is_empty() {
            return Err(ControlError::template("platform node is empty"));
        }
        if platform.storage.trim().is_empty() {
            return Err(ControlError::template("storage pool is empty"));
        }
        if platform.bridge.trim().is_empty() {
            return Err(ControlError::template("network bridge is empty"));
        }
        match kind {
            DeploymentKind::Lxc if platform.lxc_template.trim().is_empty() => {
                return Err(ControlError::template("no OS template configured for containers"));
            }
            DeploymentKind::Vm if platform.vm_template.trim().is_empty() => {
                return Err(ControlError::template("no clone template configured for VMs"));
            }
            _ => {}
        }
        Url::parse(&platform.api_url).map_err(|e| {
            ControlError::template(format!("invalid API URL '{}': {e}", platform.api_url))
        })?;
        if public_key.trim().is_empty() {
            return Err(ControlError::template("managed public key is empty"));
        }
        Ok(())
    }
}

/// Hostname derived from a deployment name.
#[must_use]
pub fn hostname(name: &str) -> String {
    name.replace('_', "-").to_lowercase()
}

/// Render the Terraform JSON descriptor for a deployment.
pub fn render(
    settings: &DescriptorSettings,
    data: &DeploymentData,
    resource_id: u32,
    public_key: &str,
) -> ControlResult<String> {
    settings.check(data.kind, public_key)?;
    let platform = &settings.platform;

    let (resource_type, resource, address_expr) = match data.kind {
        DeploymentKind::Lxc => (
            "proxmox_lxc",
            lxc_resource(platform, data, resource_id, public_key),
            json!("pending"),
        ),
        DeploymentKind::Vm => (
            "proxmox_vm_qemu",
            vm_resource(settings, data, resource_id, public_key),
            json!(format!("${{proxmox_vm_qemu.{RESOURCE_NAME}.default_ipv4_address}}")),
        ),
    };

    let descriptor = json!({
        "terraform": {
            "required_providers": {
                "proxmox": {
                    "source": settings.provider_source,
                    "version": settings.provider_version,
                }
            }
        },
        "provider": {
            "proxmox": {
                "pm_api_url": platform.api_url,
                "pm_tls_insecure": !platform.verify_tls,
            }
        },
        "resource": {
            resource_type: {
                RESOURCE_NAME: resource,
            }
        },
        "output": {
            "ip_address": { "value": address_expr },
            "vm_id": { "value": format!("${{{resource_type}.{RESOURCE_NAME}.vmid}}") },
        }
    });

    serde_json::to_string_pretty(&descriptor)
        .map_err(|e| ControlError::Serialisation(format!("failed to serialise descriptor: {e}")))
}

fn lxc_resource(
    platform: &PlatformConfig,
    data: &DeploymentData,
    resource_id: u32,
    public_key: &str,
) -> Value {
    let mut network = json!({
        "name": "eth0",
        "bridge": platform.bridge,
        "ip": "dhcp",
    });
    if let Some(gateway) = gateway(platform) {
        network["gw"] = json!(gateway);
    }

    json!({
        "target_node": platform.node,
        "hostname": hostname(&data.name),
        "vmid": resource_id,
        "ostemplate": platform.lxc_template,
        "cores": data.resources.cores,
        "memory": data.resources.memory_mb,
        "swap": 512,
        "unprivileged": true,
        "start": true,
        "onboot": true,
        "ssh_public_keys": public_key.trim(),
        "nameserver": platform.dns_servers.join(" "),
        "rootfs": {
            "storage": platform.storage,
            "size": format!("{}G", data.resources.disk_gb),
        },
        "network": network,
        "features": {
            "nesting": true,
        },
        "tags": format!("hangar;{}", data.framework),
    })
}

fn gateway(platform: &PlatformConfig) -> Option<&str> {
    let gateway = platform.gateway.trim();
    (!gateway.is_empty()).then_some(gateway)
}

fn vm_resource(
    settings: &DescriptorSettings,
    data: &DeploymentData,
    resource_id: u32,
    public_key: &str,
) -> Value {
    let platform = &settings.platform;
    let ipconfig = match gateway(platform) {
        Some(gateway) => format!("ip=dhcp,gw={gateway}"),
        None => "ip=dhcp".to_owned(),
    };

    json!({
        "name": hostname(&data.name),
        "target_node": platform.node,
        "vmid": resource_id,
        "clone": platform.vm_template,
        "full_clone": true,
        "agent": 1,
        "os_type": "cloud-init",
        "cores": data.resources.cores,
        "sockets": 1,
        "memory": data.resources.memory_mb,
        "scsihw": "virtio-scsi-pci",
        "ciuser": settings.ssh_user,
        "sshkeys": public_key.trim(),
        "ipconfig0": ipconfig,
        "nameserver": platform.dns_servers.join(" "),
        "disks": {
            "scsi": {
                "scsi0": {
                    "disk": {
                        "storage": platform.storage,
                        "size": format!("{}G", data.resources.disk_gb),
                    }
                }
            }
        },
        "network": {
            "id": 0,
            "model": "virtio",
            "bridge": platform.bridge,
        },
        "tags": format!("hangar;{}", data.framework),
    })
}

/// A deployment's isolated working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    /// Workspace for `id` under `root`.
    #[must_use]
    pub fn for_deployment(root: &Path, id: &DeploymentId) -> Self {
        Self {
            dir: root.join(id.as_str()),
        }
    }

    /// Workspace directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the rendered descriptor.
    #[must_use]
    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.join(DESCRIPTOR_FILE)
    }

    /// Whether the workspace has been created.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.dir).await.unwrap_or(false)
    }

    /// Create the directory and overwrite the descriptor.
    pub async fn write_descriptor(&self, descriptor: &str) -> ControlResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.descriptor_path(), descriptor).await?;
        Ok(())
    }

    /// Remove the workspace and everything in it.
    pub async fn remove(&self) -> ControlResult<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
