//! Shell scripts that set an application up on a fresh guest.
//!
//! Every step can be rerun against an already configured guest: the
//! checkout is replaced, configuration files are overwritten and the service
//! is re-registered under the same unit name.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{ControlError, ControlResult};
use crate::types::{Framework, Runtime};

/// Directory the application is checked out into.
pub const APP_DIR: &str = "/opt/app";

/// Systemd unit supervising the application.
pub const UNIT_NAME: &str = "hangar-app.service";

/// Nginx site serving static builds.
pub const SITE_NAME: &str = "hangar-app";

/// One named step of the setup plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStep {
    /// Short label used in logs and failure messages.
    pub name: &'static str,
    /// Script piped to the remote shell.
    pub script: String,
}

impl RemoteStep {
    fn new(name: &'static str, script: impl Into<String>) -> Self {
        Self {
            name,
            script: script.into(),
        }
    }
}

/// Quote `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Ordered steps that install and start `framework` from `repo_url`.
pub fn setup_plan(
    framework: Framework,
    repo_url: &str,
    env_vars: &BTreeMap<String, String>,
) -> ControlResult<Vec<RemoteStep>> {
    let runtime = framework.runtime().ok_or_else(|| {
        ControlError::internal(format!("no setup plan for framework {framework}"))
    })?;

    let mut steps = vec![
        RemoteStep::new("packages", packages_script()),
        RemoteStep::new("runtime", runtime_script(runtime, framework.is_static_site())),
        RemoteStep::new("clone", clone_script(repo_url)),
        RemoteStep::new("environment", env_script(framework, env_vars)),
        RemoteStep::new("dependencies", dependencies_script(framework)),
    ];

    if framework.is_static_site() {
        steps.push(RemoteStep::new("proxy", proxy_script(framework)));
    } else {
        steps.push(RemoteStep::new("service", service_script(framework)));
    }

    Ok(steps)
}

/// Script that stops the application.
#[must_use]
pub fn stop_script(framework: Framework) -> String {
    if framework.is_static_site() {
        "systemctl stop nginx".to_owned()
    } else {
        format!("systemctl stop {UNIT_NAME}")
    }
}

fn packages_script() -> String {
    "export DEBIAN_FRONTEND=noninteractive\n\
     apt-get update -qq\n\
     apt-get install -y -qq git curl ca-certificates build-essential"
        .to_owned()
}

fn runtime_script(runtime: Runtime, static_site: bool) -> String {
    let mut script = String::from("export DEBIAN_FRONTEND=noninteractive\n");
    match runtime {
        Runtime::Python => {
            script.push_str("apt-get install -y -qq python3 python3-pip python3-venv\n");
        }
        Runtime::Php => {
            script.push_str(
                "apt-get install -y -qq php-cli php-mbstring php-xml php-curl php-zip php-sqlite3 unzip\n\
                 if ! command -v composer >/dev/null 2>&1; then\n\
                 curl -fsSL https://getcomposer.org/installer | php -- --install-dir=/usr/local/bin --filename=composer\n\
                 fi\n",
            );
        }
        Runtime::Nodejs => {
            script.push_str(
                "if ! command -v node >/dev/null 2>&1; then\n\
                 curl -fsSL https://deb.nodesource.com/setup_18.x | bash -\n\
                 apt-get install -y -qq nodejs\n\
                 fi\n",
            );
        }
    }
    if static_site {
        script.push_str("apt-get install -y -qq nginx\n");
    }
    script
}

fn clone_script(repo_url: &str) -> String {
    format!(
        "rm -rf {APP_DIR}\ngit clone --depth 1 {} {APP_DIR}",
        shell_quote(repo_url)
    )
}

fn env_script(framework: Framework, env_vars: &BTreeMap<String, String>) -> String {
    let mut script = format!("cd {APP_DIR}\n");
    if framework == Framework::Laravel {
        script.push_str("if [ -f .env.example ]; then cp .env.example .env; else : > .env; fi\n");
    } else {
        script.push_str(": > .env\n");
    }

    script.push_str("cat >> .env <<'HANGAR_ENV'\n");
    let _ = writeln!(script, "PORT={}", framework.port());
    for (name, value) in env_vars {
        let _ = writeln!(script, "{name}={}", value.replace('\n', "\\n"));
    }
    script.push_str("HANGAR_ENV");
    script
}

fn dependencies_script(framework: Framework) -> String {
    let mut script = format!("cd {APP_DIR}\n");
    match framework {
        Framework::Django | Framework::Flask | Framework::Fastapi => {
            script.push_str(
                "python3 -m venv .venv\n\
                 if [ -f requirements.txt ]; then .venv/bin/pip install -q -r requirements.txt; fi\n",
            );
            if framework == Framework::Fastapi {
                script.push_str(".venv/bin/pip install -q uvicorn\n");
            } else {
                script.push_str(".venv/bin/pip install -q gunicorn\n");
            }
            if framework == Framework::Django {
                script.push_str(
                    "if [ -f manage.py ]; then\n\
                     .venv/bin/python manage.py migrate --noinput\n\
                     .venv/bin/python manage.py collectstatic --noinput\n\
                     fi\n",
                );
            }
        }
        Framework::Laravel => {
            script.push_str(
                "if [ -f composer.json ]; then\n\
                 COMPOSER_ALLOW_SUPERUSER=1 composer install --no-dev --optimize-autoloader --no-interaction\n\
                 fi\n\
                 php artisan key:generate --force\n\
                 php artisan migrate --force\n",
            );
        }
        Framework::Express | Framework::Nextjs | Framework::React | Framework::Vuejs => {
            script.push_str("if [ -f package.json ]; then npm install --no-audit --no-fund; fi\n");
            if framework != Framework::Express {
                script.push_str("npm run build\n");
            }
        }
        Framework::Unknown => {}
    }
    script
}

/// Turns the directory holding `wsgi.py` into a dotted module path; the
/// repository root becomes empty.
const WSGI_MODULE_SED: &str = r"s|^\./||; s|^\.$||; s|/|.|g";

/// Gunicorn target built from `WSGI_MODULE`.
const WSGI_TARGET: &str = "${WSGI_MODULE:+$WSGI_MODULE.}wsgi:application";

fn exec_start(framework: Framework) -> String {
    let port = framework.port();
    match framework {
        Framework::Django => {
            format!("{APP_DIR}/.venv/bin/gunicorn --bind 0.0.0.0:{port} {WSGI_TARGET}")
        }
        Framework::Flask => format!("{APP_DIR}/.venv/bin/gunicorn --bind 0.0.0.0:{port} app:app"),
        Framework::Fastapi => {
            format!("{APP_DIR}/.venv/bin/uvicorn main:app --host 0.0.0.0 --port {port}")
        }
        Framework::Laravel => format!("/usr/bin/php artisan serve --host=0.0.0.0 --port={port}"),
        _ => "/usr/bin/npm start".to_owned(),
    }
}

fn service_script(framework: Framework) -> String {
    let mut script = String::new();
    if framework == Framework::Django {
        let _ = writeln!(
            script,
            "WSGI_MODULE=$(cd {APP_DIR} && dirname \"$(find . -maxdepth 2 -name wsgi.py | head -n 1)\" | sed '{WSGI_MODULE_SED}')"
        );
    }

    let _ = write!(
        script,
        "cat > /etc/systemd/system/{UNIT_NAME} <<UNIT\n\
         [Unit]\n\
         Description=hangar application\n\
         After=network.target\n\
         \n\
         [Service]\n\
         WorkingDirectory={APP_DIR}\n\
         EnvironmentFile={APP_DIR}/.env\n\
         ExecStart={}\n\
         Restart=always\n\
         RestartSec=3\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n\
         UNIT\n\
         systemctl daemon-reload\n\
         systemctl enable {UNIT_NAME}\n\
         systemctl restart {UNIT_NAME}",
        exec_start(framework)
    );
    script
}

fn proxy_script(framework: Framework) -> String {
    let root = if framework == Framework::Vuejs {
        "dist"
    } else {
        "build"
    };
    format!(
        "cat > /etc/nginx/sites-available/{SITE_NAME} <<'SITE'\n\
         server {{\n\
         \x20   listen {port};\n\
         \x20   root {APP_DIR}/{root};\n\
         \x20   index index.html;\n\
         \x20   location / {{\n\
         \x20       try_files $uri $uri/ /index.html;\n\
         \x20   }}\n\
         }}\n\
         SITE\n\
         ln -sf /etc/nginx/sites-available/{SITE_NAME} /etc/nginx/sites-enabled/{SITE_NAME}\n\
         rm -f /etc/nginx/sites-enabled/default\n\
         nginx -t\n\
         systemctl enable nginx\n\
         systemctl reload-or-restart nginx",
        port = framework.port(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(steps: &[RemoteStep]) -> Vec<&str> {
        steps.iter().map(|s| s.name).collect()
    }

    #[test]
    fn express_plan_registers_service() {
        let steps = setup_plan(
            Framework::Express,
            "https://github.com/acme/shop",
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(
            names(&steps),
            ["packages", "runtime", "clone", "environment", "dependencies", "service"]
        );

        let service = &steps[5].script;
        assert!(service.contains("cat > /etc/systemd/system/hangar-app.service"));
        assert!(service.contains("ExecStart=/usr/bin/npm start"));
        assert!(service.contains("systemctl restart hangar-app.service"));
        assert!(!steps[4].script.contains("npm run build"));
    }

    #[test]
    fn static_sites_are_served_by_nginx() {
        let steps = setup_plan(
            Framework::Vuejs,
            "https://github.com/acme/site",
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(steps.last().map(|s| s.name), Some("proxy"));
        let proxy = &steps[5].script;
        assert!(proxy.contains("listen 8080;"));
        assert!(proxy.contains("root /opt/app/dist;"));
        assert!(steps[1].script.contains("nginx"));
        assert!(steps[4].script.contains("npm run build"));
    }

    #[test]
    fn env_file_is_rewritten_with_port_and_variables() {
        let mut vars = BTreeMap::new();
        vars.insert("DEBUG".to_owned(), "false".to_owned());
        vars.insert("GREETING".to_owned(), "hello\nworld".to_owned());
        let steps = setup_plan(Framework::Flask, "https://github.com/acme/api", &vars).unwrap();
        let env = &steps[3].script;
        assert!(env.contains(": > .env"));
        assert!(env.contains("PORT=5000\nDEBUG=false\nGREETING=hello\\nworld\n"));
    }

    #[test]
    fn laravel_starts_from_example_env() {
        let steps = setup_plan(
            Framework::Laravel,
            "https://github.com/acme/blog",
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(steps[3].script.contains("cp .env.example .env"));
        assert!(steps[4].script.contains("composer install --no-dev"));
        assert!(steps[5].script.contains("artisan serve --host=0.0.0.0 --port=8000"));
    }

    #[test]
    fn django_resolves_wsgi_module() {
        let steps = setup_plan(
            Framework::Django,
            "https://github.com/acme/cms",
            &BTreeMap::new(),
        )
        .unwrap();
        let service = &steps[5].script;
        assert!(service.starts_with("WSGI_MODULE=$("));
        assert!(service.contains(WSGI_MODULE_SED));
        assert!(service.contains(&format!("--bind 0.0.0.0:8000 {WSGI_TARGET}")));
    }

    #[test]
    fn wsgi_target_for_root_and_nested_projects() {
        for (dir, expected) in [
            (".", "wsgi:application"),
            ("./cms", "cms.wsgi:application"),
            ("./src/cms", "src.cms.wsgi:application"),
        ] {
            let script = format!(
                "WSGI_MODULE=$(echo '{dir}' | sed '{WSGI_MODULE_SED}'); echo \"{WSGI_TARGET}\""
            );
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(&script)
                .output()
                .unwrap();
            assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), expected);
        }
    }

    #[test]
    fn repository_url_is_quoted() {
        let steps = setup_plan(
            Framework::Express,
            "https://example.com/a/b'; rm -rf /",
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(steps[2]
            .script
            .contains(r"'https://example.com/a/b'\''; rm -rf /'"));
    }

    #[test]
    fn unknown_framework_has_no_plan() {
        assert!(setup_plan(Framework::Unknown, "https://x/y/z", &BTreeMap::new()).is_err());
    }
}
