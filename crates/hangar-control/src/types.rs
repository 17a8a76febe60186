//! Core types for hangar-control.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::DeploymentStatus;

/// Unique identifier for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Create a new deployment ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique deployment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeploymentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The kind of compute a deployment runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    /// Full virtual machine (QEMU).
    Vm,
    /// System container (LXC).
    Lxc,
}

impl DeploymentKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Lxc => "lxc",
        }
    }
}

impl fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm" | "qemu" => Ok(Self::Vm),
            "lxc" => Ok(Self::Lxc),
            _ => Err(format!("unknown deployment kind: {s}")),
        }
    }
}

/// Language runtime a framework needs on the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// Python 3 with venv.
    Python,
    /// PHP with composer.
    Php,
    /// Node.js with npm.
    Nodejs,
}

/// Supported application frameworks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    /// Django (gunicorn).
    Django,
    /// Laravel (artisan serve).
    Laravel,
    /// Express.js.
    Express,
    /// Flask (gunicorn).
    Flask,
    /// FastAPI (uvicorn).
    Fastapi,
    /// React single-page app, built and served statically.
    React,
    /// Vue.js single-page app, built and served statically.
    Vuejs,
    /// Next.js.
    Nextjs,
    /// Imported from the platform; the framework was never recorded.
    Unknown,
}

impl Framework {
    /// Every framework a request may ask for.
    pub const SUPPORTED: [Self; 8] = [
        Self::Django,
        Self::Laravel,
        Self::Express,
        Self::Flask,
        Self::Fastapi,
        Self::React,
        Self::Vuejs,
        Self::Nextjs,
    ];

    /// Get the framework identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Django => "django",
            Self::Laravel => "laravel",
            Self::Express => "express",
            Self::Flask => "flask",
            Self::Fastapi => "fastapi",
            Self::React => "react",
            Self::Vuejs => "vuejs",
            Self::Nextjs => "nextjs",
            Self::Unknown => "unknown",
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Django => "Django",
            Self::Laravel => "Laravel",
            Self::Express => "Express.js",
            Self::Flask => "Flask",
            Self::Fastapi => "FastAPI",
            Self::React => "React",
            Self::Vuejs => "Vue.js",
            Self::Nextjs => "Next.js",
            Self::Unknown => "Unknown",
        }
    }

    /// Language runtime installed on the guest, if any.
    #[must_use]
    pub const fn runtime(&self) -> Option<Runtime> {
        match self {
            Self::Django | Self::Flask | Self::Fastapi => Some(Runtime::Python),
            Self::Laravel => Some(Runtime::Php),
            Self::Express | Self::React | Self::Vuejs | Self::Nextjs => Some(Runtime::Nodejs),
            Self::Unknown => None,
        }
    }

    /// Framework version the setup targets.
    #[must_use]
    pub const fn version(&self) -> &'static str {
        match self {
            Self::Django => "4.2",
            Self::Laravel => "10.x",
            Self::Express | Self::React => "18.x",
            Self::Flask => "3.0",
            Self::Fastapi => "0.104",
            Self::Vuejs => "3.x",
            Self::Nextjs => "14.x",
            Self::Unknown => "",
        }
    }

    /// Port the application listens on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Django | Self::Laravel | Self::Fastapi => 8000,
            Self::Express | Self::React | Self::Nextjs => 3000,
            Self::Flask => 5000,
            Self::Vuejs => 8080,
            Self::Unknown => 80,
        }
    }

    /// Whether the built application is served by a reverse proxy.
    #[must_use]
    pub const fn is_static_site(&self) -> bool {
        matches!(self, Self::React | Self::Vuejs)
    }

    /// Catalogue entry for the HTTP surface.
    #[must_use]
    pub fn info(&self) -> FrameworkInfo {
        FrameworkInfo {
            id: *self,
            name: self.display_name(),
            language: self.runtime(),
            version: self.version(),
            port: self.port(),
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "django" => Ok(Self::Django),
            "laravel" => Ok(Self::Laravel),
            "express" => Ok(Self::Express),
            "flask" => Ok(Self::Flask),
            "fastapi" => Ok(Self::Fastapi),
            "react" => Ok(Self::React),
            "vuejs" => Ok(Self::Vuejs),
            "nextjs" => Ok(Self::Nextjs),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("unknown framework: {s}")),
        }
    }
}

/// Static metadata describing a framework.
#[derive(Debug, Clone, Serialize)]
pub struct FrameworkInfo {
    /// Framework identifier.
    pub id: Framework,
    /// Display name.
    pub name: &'static str,
    /// Language runtime.
    pub language: Option<Runtime>,
    /// Targeted version.
    pub version: &'static str,
    /// Default port.
    pub port: u16,
}

/// CPU, memory and disk sizing for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU core count.
    pub cores: u32,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Disk size in GB.
    pub disk_gb: u32,
}

/// Common data for a deployment, independent of its status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Human-chosen name, unique among live deployments.
    pub name: String,
    /// VM or container.
    pub kind: DeploymentKind,
    /// Application framework.
    pub framework: Framework,
    /// Source repository URL.
    pub repo_url: String,
    /// Requested sizing.
    pub resources: ResourceSpec,
    /// Application environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_vars: BTreeMap<String, String>,
    /// Network address, once provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Platform resource identifier, once allocated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<u32>,
    /// Error message if the deployment failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the application came up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    /// When the deployment was removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DeploymentData {
    /// Create new deployment data from an accepted request.
    #[must_use]
    pub fn new(request: DeploymentRequest, resources: ResourceSpec) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            name: request.name,
            kind: request.kind,
            framework: request.framework,
            repo_url: request.repo_url,
            resources,
            env_vars: request.env_vars,
            address: None,
            resource_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
            deleted_at: None,
        }
    }
}

/// A deployment record as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// The deployment data.
    #[serde(flatten)]
    pub data: DeploymentData,
    /// Current status.
    pub status: DeploymentStatus,
}

impl DeploymentRecord {
    /// Create a new deployment record in the pending state.
    #[must_use]
    pub const fn new(data: DeploymentData) -> Self {
        Self {
            data,
            status: DeploymentStatus::Pending,
        }
    }

    /// Public URL of the application, available while it runs.
    #[must_use]
    pub fn access_url(&self) -> Option<String> {
        if self.status != DeploymentStatus::Running {
            return None;
        }
        self.data
            .address
            .as_ref()
            .map(|address| format!("http://{address}:{}", self.data.framework.port()))
    }
}

/// Read model handed to the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentView {
    /// The stored record.
    #[serde(flatten)]
    pub record: DeploymentRecord,
    /// Application URL when running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_url: Option<String>,
}

impl From<DeploymentRecord> for DeploymentView {
    fn from(record: DeploymentRecord) -> Self {
        let access_url = record.access_url();
        Self { record, access_url }
    }
}

/// A request to create a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Deployment name.
    pub name: String,
    /// VM or container.
    pub kind: DeploymentKind,
    /// Application framework.
    pub framework: Framework,
    /// Source repository URL.
    pub repo_url: String,
    /// CPU cores; the kind default applies when absent.
    #[serde(default)]
    pub cores: Option<u32>,
    /// Memory in MB; the kind default applies when absent.
    #[serde(default)]
    pub memory_mb: Option<u32>,
    /// Disk in GB; the kind default applies when absent.
    #[serde(default)]
    pub disk_gb: Option<u32>,
    /// Application environment variables.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Fields written alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    /// Network address.
    pub address: Option<String>,
    /// Platform resource identifier.
    pub resource_id: Option<u32>,
    /// Error message.
    pub error: Option<String>,
    /// Deployment timestamp.
    pub deployed_at: Option<DateTime<Utc>>,
    /// Deletion timestamp.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StatusPatch {
    /// Patch carrying an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Apply the patch to deployment data.
    pub fn apply_to(self, data: &mut DeploymentData) {
        if let Some(address) = self.address {
            data.address = Some(address);
        }
        if let Some(resource_id) = self.resource_id {
            data.resource_id = Some(resource_id);
        }
        if let Some(error) = self.error {
            data.error = Some(error);
        }
        if let Some(deployed_at) = self.deployed_at {
            data.deployed_at = Some(deployed_at);
        }
        if let Some(deleted_at) = self.deleted_at {
            data.deleted_at = Some(deleted_at);
        }
        data.updated_at = Utc::now();
    }
}

/// Deployment counts per status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeploymentStats {
    /// Non-deleted deployments.
    pub total: usize,
    /// Pending deployments.
    pub pending: usize,
    /// Provisioning deployments.
    pub provisioning: usize,
    /// Deploying deployments.
    pub deploying: usize,
    /// Running deployments.
    pub running: usize,
    /// Failed deployments.
    pub failed: usize,
    /// Stopped deployments.
    pub stopped: usize,
    /// Soft-deleted deployments.
    pub deleted: usize,
    /// Running share of the non-deleted total, in percent.
    pub success_rate: f64,
}

impl DeploymentStats {
    /// Tally a set of records.
    #[must_use]
    pub fn from_records(records: &[DeploymentRecord]) -> Self {
        let mut stats = Self::default();
        for record in records {
            match record.status {
                DeploymentStatus::Pending => stats.pending += 1,
                DeploymentStatus::Provisioning => stats.provisioning += 1,
                DeploymentStatus::Deploying => stats.deploying += 1,
                DeploymentStatus::Running => stats.running += 1,
                DeploymentStatus::Failed => stats.failed += 1,
                DeploymentStatus::Stopped => stats.stopped += 1,
                DeploymentStatus::Deleted => stats.deleted += 1,
            }
        }
        stats.total = records.len() - stats.deleted;
        if stats.total > 0 {
            #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
            let rate = stats.running as f64 / stats.total as f64 * 100.0;
            stats.success_rate = (rate * 100.0).round() / 100.0;
        }
        stats
    }
}
