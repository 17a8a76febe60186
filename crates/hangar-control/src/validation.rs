//! Request validation.
//!
//! Runs before a deployment is recorded. Every problem is reported at once.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::config::{Bounds, DefaultsConfig, LimitsConfig};
use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentRequest, Framework, ResourceSpec};

/// Pattern for deployment names.
static NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{1,48}[a-zA-Z0-9]$").ok());

/// Pattern for environment variable names.
static ENV_NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

fn is_match(pattern: &LazyLock<Option<Regex>>, value: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(value))
}

/// Validate a deployment request and resolve its sizing.
///
/// Absent sizing fields take the kind's defaults. The resolved sizing must
/// lie within the kind's limits.
pub fn validate_request(
    request: &DeploymentRequest,
    limits: &LimitsConfig,
    defaults: &DefaultsConfig,
) -> ControlResult<ResourceSpec> {
    let mut problems = Vec::new();

    if !is_match(&NAME_PATTERN, &request.name) {
        problems.push(
            "name must be 3-50 letters, digits, hyphens or underscores, starting and ending \
             with a letter or digit"
                .to_owned(),
        );
    }

    if let Err(problem) = validate_repo_url(&request.repo_url) {
        problems.push(problem);
    }

    if request.framework == Framework::Unknown {
        problems.push("framework is not supported".to_owned());
    }

    let fallback = defaults.for_kind(request.kind);
    let resources = ResourceSpec {
        cores: request.cores.unwrap_or(fallback.cores),
        memory_mb: request.memory_mb.unwrap_or(fallback.memory_mb),
        disk_gb: request.disk_gb.unwrap_or(fallback.disk_gb),
    };

    let bounds = limits.for_kind(request.kind);
    check_bounds(&mut problems, "cores", resources.cores, bounds.cores);
    check_bounds(&mut problems, "memory_mb", resources.memory_mb, bounds.memory_mb);
    check_bounds(&mut problems, "disk_gb", resources.disk_gb, bounds.disk_gb);

    for name in request.env_vars.keys() {
        if !is_match(&ENV_NAME_PATTERN, name) {
            problems.push(format!("invalid environment variable name {name:?}"));
        }
    }

    if problems.is_empty() {
        Ok(resources)
    } else {
        Err(ControlError::Validation(problems))
    }
}

fn check_bounds(problems: &mut Vec<String>, field: &str, value: u32, bounds: Bounds) {
    if !bounds.contains(value) {
        problems.push(format!(
            "{field} must be between {} and {}, got {value}",
            bounds.min, bounds.max
        ));
    }
}

/// A repository URL must be http(s) with a host and an owner/repo path.
fn validate_repo_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| format!("repository URL is invalid: {e}"))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err("repository URL must use http or https".to_owned());
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("repository URL has no host".to_owned());
    }

    let segments = url
        .path_segments()
        .map(|s| s.filter(|segment| !segment.is_empty()).count())
        .unwrap_or(0);
    if segments < 2 {
        return Err("repository URL must name an owner and a repository".to_owned());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::DeploymentKind;

    fn request() -> DeploymentRequest {
        DeploymentRequest {
            name: "my-app".to_owned(),
            kind: DeploymentKind::Lxc,
            framework: Framework::Express,
            repo_url: "https://github.com/acme/shop.git".to_owned(),
            cores: Some(1),
            memory_mb: Some(1024),
            disk_gb: Some(10),
            env_vars: BTreeMap::new(),
        }
    }

    fn validate(request: &DeploymentRequest) -> ControlResult<ResourceSpec> {
        validate_request(request, &LimitsConfig::default(), &DefaultsConfig::default())
    }

    fn problems(request: &DeploymentRequest) -> Vec<String> {
        match validate(request) {
            Err(ControlError::Validation(problems)) => problems,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_valid_request() {
        let spec = validate(&request()).unwrap();
        assert_eq!(
            spec,
            ResourceSpec {
                cores: 1,
                memory_mb: 1024,
                disk_gb: 10
            }
        );
    }

    #[test]
    fn fills_kind_defaults() {
        let mut req = request();
        req.kind = DeploymentKind::Vm;
        req.cores = None;
        req.memory_mb = None;
        req.disk_gb = None;
        let spec = validate(&req).unwrap();
        assert_eq!(spec.cores, 2);
        assert_eq!(spec.memory_mb, 2048);
        assert_eq!(spec.disk_gb, 20);
    }

    #[test]
    fn rejects_bad_names() {
        let long = "x".repeat(51);
        for name in [
            "ab",
            "has space",
            "semi;colon",
            "---",
            "_ab-",
            "shop_",
            long.as_str(),
        ] {
            let mut req = request();
            req.name = name.to_owned();
            assert_eq!(problems(&req).len(), 1, "{name}");
        }
    }

    #[test]
    fn accepts_inner_separators() {
        for name in ["a-b", "my_app-2", "Shop_API"] {
            let mut req = request();
            req.name = name.to_owned();
            assert!(validate(&req).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_bad_urls() {
        for url in [
            "not a url",
            "ftp://github.com/acme/shop",
            "https://github.com/acme",
            "https://github.com/",
        ] {
            let mut req = request();
            req.repo_url = url.to_owned();
            assert_eq!(problems(&req).len(), 1, "{url}");
        }
    }

    #[test]
    fn enforces_kind_limits() {
        let mut req = request();
        req.cores = Some(9);
        req.memory_mb = Some(128);
        req.disk_gb = Some(201);
        assert_eq!(problems(&req).len(), 3);

        req.kind = DeploymentKind::Vm;
        req.memory_mb = Some(512);
        req.disk_gb = Some(200);
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut req = request();
        req.name = "x".to_owned();
        req.repo_url = "git@github.com:acme/shop".to_owned();
        req.framework = Framework::Unknown;
        req.env_vars.insert("1BAD".to_owned(), "v".to_owned());
        req.env_vars.insert("GOOD_NAME".to_owned(), "v".to_owned());
        assert_eq!(problems(&req).len(), 4);
    }
}
