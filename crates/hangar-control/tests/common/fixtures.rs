//! Test fixtures for control integration tests.

use std::collections::BTreeMap;

use hangar_control::{DeploymentKind, DeploymentRequest, Framework};
use serde_json::{json, Value};

/// Builder for creating test deployment requests.
pub struct RequestBuilder {
    name: String,
    kind: DeploymentKind,
    framework: Framework,
    repo_url: String,
    cores: Option<u32>,
    memory_mb: Option<u32>,
    disk_gb: Option<u32>,
    env_vars: BTreeMap<String, String>,
}

impl RequestBuilder {
    /// Creates a container request for an Express application.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: DeploymentKind::Lxc,
            framework: Framework::Express,
            repo_url: format!("https://github.com/acme/{name}"),
            cores: Some(1),
            memory_mb: Some(1024),
            disk_gb: Some(10),
            env_vars: BTreeMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: DeploymentKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_framework(mut self, framework: Framework) -> Self {
        self.framework = framework;
        self
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env_vars.insert(name.to_owned(), value.to_owned());
        self
    }

    /// Leaves sizing to the kind defaults.
    pub fn default_sizing(mut self) -> Self {
        self.cores = None;
        self.memory_mb = None;
        self.disk_gb = None;
        self
    }

    pub fn build(self) -> DeploymentRequest {
        DeploymentRequest {
            name: self.name,
            kind: self.kind,
            framework: self.framework,
            repo_url: self.repo_url,
            cores: self.cores,
            memory_mb: self.memory_mb,
            disk_gb: self.disk_gb,
            env_vars: self.env_vars,
        }
    }

    /// The request as an HTTP body.
    pub fn json(self) -> Value {
        json!(self.build())
    }
}
