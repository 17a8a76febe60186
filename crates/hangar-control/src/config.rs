//! Configuration for hangar-control.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentKind, ResourceSpec};

const ENV_PREFIX: &str = "HANGAR_";

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Virtualisation platform configuration.
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Infrastructure tool configuration.
    #[serde(default)]
    pub terraform: TerraformConfig,

    /// Resource identifier allocation.
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// Remote access configuration.
    #[serde(default)]
    pub ssh: SshConfig,

    /// Pipeline behaviour.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Per-kind resource bounds.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Per-kind default sizing.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Deployment log sink.
    #[serde(default)]
    pub logs: LogsConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `hangar.toml` in the current directory (if present)
    /// 3. Environment variables with `HANGAR_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("hangar.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// A credential read from configuration, redacted in debug output.
#[derive(Clone)]
pub struct Secret(Arc<SecretString>);

impl Secret {
    /// Wrap a plain value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(value.into())))
    }

    /// Access the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8085)
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl ServerConfig {
    /// Request timeout as a duration.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Empty selects the in-memory store.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/hangar".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// How the platform inventory is queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryMode {
    /// Proxmox VE HTTP API.
    #[default]
    Proxmox,

    /// Fixed, empty inventory for local testing.
    Static,
}

/// Virtualisation platform configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Inventory backend.
    #[serde(default)]
    pub mode: InventoryMode,

    /// Proxmox API base URL, e.g. `https://pve.local:8006/api2/json`.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Node that hosts deployments.
    #[serde(default = "default_node")]
    pub node: String,

    /// API token identifier (`user@realm!token`).
    #[serde(default)]
    pub token_id: String,

    /// API token secret.
    #[serde(default)]
    pub token_secret: Option<Secret>,

    /// Verify the API's TLS certificate.
    #[serde(default)]
    pub verify_tls: bool,

    /// Storage pool for root disks.
    #[serde(default = "default_storage")]
    pub storage: String,

    /// Network bridge for guest interfaces.
    #[serde(default = "default_bridge")]
    pub bridge: String,

    /// OS template for containers.
    #[serde(default = "default_lxc_template")]
    pub lxc_template: String,

    /// Cloud-init template cloned for virtual machines.
    #[serde(default = "default_vm_template")]
    pub vm_template: String,

    /// Default gateway handed to guests.
    #[serde(default = "default_gateway")]
    pub gateway: String,

    /// DNS servers handed to guests.
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,

    /// Inventory request timeout in seconds.
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://localhost:8006/api2/json".to_owned()
}

fn default_node() -> String {
    "pve".to_owned()
}

fn default_storage() -> String {
    "local-lvm".to_owned()
}

fn default_bridge() -> String {
    "vmbr0".to_owned()
}

fn default_lxc_template() -> String {
    "local:vztmpl/ubuntu-22.04-standard_22.04-1_amd64.tar.zst".to_owned()
}

fn default_vm_template() -> String {
    "ubuntu-22-cloudinit".to_owned()
}

fn default_gateway() -> String {
    "192.168.100.1".to_owned()
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_owned(), "8.8.4.4".to_owned()]
}

const fn default_api_timeout_secs() -> u64 {
    15
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            mode: InventoryMode::default(),
            api_url: default_api_url(),
            node: default_node(),
            token_id: String::new(),
            token_secret: None,
            verify_tls: false,
            storage: default_storage(),
            bridge: default_bridge(),
            lxc_template: default_lxc_template(),
            vm_template: default_vm_template(),
            gateway: default_gateway(),
            dns_servers: default_dns_servers(),
            timeout_secs: default_api_timeout_secs(),
        }
    }
}

/// Which provisioning driver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    /// The `terraform` binary.
    #[default]
    Terraform,

    /// Mock driver for testing.
    Mock,
}

/// Infrastructure tool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TerraformConfig {
    /// Driver selection.
    #[serde(default)]
    pub mode: DriverMode,

    /// Path to the terraform binary.
    #[serde(default = "default_terraform_binary")]
    pub binary: PathBuf,

    /// Root directory holding one workspace per deployment.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Provider registry source.
    #[serde(default = "default_provider_source")]
    pub provider_source: String,

    /// Provider version constraint.
    #[serde(default = "default_provider_version")]
    pub provider_version: String,

    /// Timeout for a single tool invocation in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_terraform_binary() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/var/lib/hangar/workspaces")
}

fn default_provider_source() -> String {
    "telmate/proxmox".to_owned()
}

fn default_provider_version() -> String {
    "3.0.1-rc4".to_owned()
}

const fn default_command_timeout_secs() -> u64 {
    1800
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            mode: DriverMode::default(),
            binary: default_terraform_binary(),
            workspace_root: default_workspace_root(),
            provider_source: default_provider_source(),
            provider_version: default_provider_version(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// Resource identifier allocation.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorConfig {
    /// First identifier of the range.
    #[serde(default = "default_range_start")]
    pub range_start: u32,

    /// Last identifier of the range (inclusive).
    #[serde(default = "default_range_end")]
    pub range_end: u32,

    /// Random draws before the linear scan.
    #[serde(default = "default_random_attempts")]
    pub random_attempts: u32,
}

const fn default_range_start() -> u32 {
    100
}

const fn default_range_end() -> u32 {
    999
}

const fn default_random_attempts() -> u32 {
    100
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
            random_attempts: default_random_attempts(),
        }
    }
}

/// Which remote transport runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// The system `ssh` client.
    #[default]
    Openssh,

    /// Mock transport for testing.
    Mock,
}

/// Remote access configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Transport selection.
    #[serde(default)]
    pub mode: TransportMode,

    /// Remote user.
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Managed private key. Generated on first use.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Optional jump host, typically the hypervisor.
    #[serde(default)]
    pub jump_host: Option<String>,

    /// User on the jump host.
    #[serde(default = "default_ssh_user")]
    pub jump_user: String,

    /// Delay between connection attempts in seconds.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Give up connecting after this many seconds.
    #[serde(default = "default_retry_ceiling_secs")]
    pub retry_ceiling_secs: u64,

    /// Timeout for a single connection attempt in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Timeout for a single remote command in seconds.
    #[serde(default = "default_ssh_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_ssh_user() -> String {
    "root".to_owned()
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/var/lib/hangar/ssh/id_ed25519")
}

const fn default_retry_interval_secs() -> u64 {
    5
}

const fn default_retry_ceiling_secs() -> u64 {
    600
}

const fn default_ssh_command_timeout_secs() -> u64 {
    900
}

impl SshConfig {
    /// Delay between connection attempts.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Connection retry ceiling.
    #[must_use]
    pub const fn retry_ceiling(&self) -> Duration {
        Duration::from_secs(self.retry_ceiling_secs)
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            user: default_ssh_user(),
            key_path: default_key_path(),
            jump_host: None,
            jump_user: default_ssh_user(),
            retry_interval_secs: default_retry_interval_secs(),
            retry_ceiling_secs: default_retry_ceiling_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_ssh_command_timeout_secs(),
        }
    }
}

/// Pipeline behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Pipelines executing at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Attempts for the apply stage.
    #[serde(default = "default_attempts")]
    pub apply_attempts: u32,

    /// Attempts for the configure stage.
    #[serde(default = "default_attempts")]
    pub configure_attempts: u32,

    /// Delay between address polls in seconds.
    #[serde(default = "default_address_poll_interval_secs")]
    pub address_poll_interval_secs: u64,

    /// Give up polling for an address after this many seconds.
    #[serde(default = "default_address_poll_timeout_secs")]
    pub address_poll_timeout_secs: u64,
}

const fn default_max_concurrent() -> usize {
    4
}

const fn default_attempts() -> u32 {
    1
}

const fn default_address_poll_interval_secs() -> u64 {
    10
}

const fn default_address_poll_timeout_secs() -> u64 {
    300
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            apply_attempts: default_attempts(),
            configure_attempts: default_attempts(),
            address_poll_interval_secs: default_address_poll_interval_secs(),
            address_poll_timeout_secs: default_address_poll_timeout_secs(),
        }
    }
}

/// Inclusive bounds for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Bounds {
    /// Minimum.
    pub min: u32,
    /// Maximum.
    pub max: u32,
}

impl Bounds {
    /// Whether `value` lies within the bounds.
    #[must_use]
    pub const fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Bounds for one deployment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct KindLimits {
    /// CPU cores.
    pub cores: Bounds,
    /// Memory in MB.
    pub memory_mb: Bounds,
    /// Disk in GB.
    pub disk_gb: Bounds,
}

/// Per-kind resource bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Virtual machine bounds.
    #[serde(default = "default_vm_limits")]
    pub vm: KindLimits,
    /// Container bounds.
    #[serde(default = "default_lxc_limits")]
    pub lxc: KindLimits,
}

const fn default_vm_limits() -> KindLimits {
    KindLimits {
        cores: Bounds { min: 1, max: 16 },
        memory_mb: Bounds { min: 512, max: 32768 },
        disk_gb: Bounds { min: 10, max: 500 },
    }
}

const fn default_lxc_limits() -> KindLimits {
    KindLimits {
        cores: Bounds { min: 1, max: 8 },
        memory_mb: Bounds { min: 256, max: 16384 },
        disk_gb: Bounds { min: 5, max: 200 },
    }
}

impl LimitsConfig {
    /// Bounds for a kind.
    #[must_use]
    pub const fn for_kind(&self, kind: DeploymentKind) -> &KindLimits {
        match kind {
            DeploymentKind::Vm => &self.vm,
            DeploymentKind::Lxc => &self.lxc,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            vm: default_vm_limits(),
            lxc: default_lxc_limits(),
        }
    }
}

/// Per-kind default sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    /// Virtual machine defaults.
    #[serde(default = "default_vm_spec")]
    pub vm: ResourceSpec,
    /// Container defaults.
    #[serde(default = "default_lxc_spec")]
    pub lxc: ResourceSpec,
}

const fn default_vm_spec() -> ResourceSpec {
    ResourceSpec {
        cores: 2,
        memory_mb: 2048,
        disk_gb: 20,
    }
}

const fn default_lxc_spec() -> ResourceSpec {
    ResourceSpec {
        cores: 1,
        memory_mb: 1024,
        disk_gb: 10,
    }
}

impl DefaultsConfig {
    /// Defaults for a kind.
    #[must_use]
    pub const fn for_kind(&self, kind: DeploymentKind) -> ResourceSpec {
        match kind {
            DeploymentKind::Vm => self.vm,
            DeploymentKind::Lxc => self.lxc,
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            vm: default_vm_spec(),
            lxc: default_lxc_spec(),
        }
    }
}

/// Deployment log sink.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
    /// Directory holding one log file per deployment.
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/hangar/deployments")
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}
