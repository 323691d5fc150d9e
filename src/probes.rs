//! Read-only environment probes.
//!
//! Each probe answers one question (tool on PATH, files present, endpoint
//! reachable) as a boolean or health value and never raises; failures are
//! values, not errors. The aggregate report gates whether the launch action
//! is available. Probes do not write to the status store themselves.

use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::state::{Health, StatusRecord};

/// CLI tool information
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Name of the CLI tool
    pub name: &'static str,
    /// Command to run the tool
    pub command: &'static str,
    /// Whether the tool is installed
    pub installed: bool,
    /// Version string (if installed)
    pub version: Option<String>,
}

/// Check if the `git` CLI is installed
pub async fn detect_git() -> ToolInfo {
    let (installed, version) = check_cli_version("git", &["--version"]).await;
    ToolInfo {
        name: "Git",
        command: "git",
        installed,
        version,
    }
}

/// Check if the `conda` CLI is installed
pub async fn detect_conda() -> ToolInfo {
    let (installed, version) = check_cli_version("conda", &["--version"]).await;
    ToolInfo {
        name: "Conda",
        command: "conda",
        installed,
        version,
    }
}

/// Helper to check if a CLI is installed and get its version
async fn check_cli_version(command: &str, args: &[&str]) -> (bool, Option<String>) {
    // A PATH miss answers without spawning anything
    if which::which(command).is_err() {
        return (false, None);
    }

    let result = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|s| s.trim().to_string());
            (true, version)
        }
        _ => (false, None),
    }
}

/// Whether the configured conda environment exists.
pub async fn conda_env_present(env_name: &str) -> bool {
    if env_name.is_empty() {
        return false;
    }

    let result = Command::new("conda")
        .args(["env", "list"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split_whitespace().next())
            .any(|env| env == env_name),
        _ => false,
    }
}

/// The factor server entrypoint, trying both known checkout layouts.
pub fn factor_entrypoint(factor_path: &Path) -> Option<PathBuf> {
    let candidates = [
        factor_path
            .join("panda_factor_server")
            .join("panda_factor_server")
            .join("__main__.py"),
        factor_path.join("panda_factor_server").join("__main__.py"),
    ];
    candidates.into_iter().find(|p| p.exists())
}

/// The quantflow server entrypoint, if the checkout has one.
pub fn quantflow_entrypoint(quantflow_path: &Path) -> Option<PathBuf> {
    let candidate = quantflow_path
        .join("src")
        .join("panda_server")
        .join("main.py");
    candidate.exists().then_some(candidate)
}

/// Whether the factor checkout exists with a usable server entrypoint.
pub fn project_files_present(record: &StatusRecord) -> bool {
    if record.project_path.is_empty() {
        return false;
    }
    let factor_path = record.factor_path();
    factor_path.exists() && factor_entrypoint(&factor_path).is_some()
}

/// Whether the MongoDB install directory holds the expected binaries:
/// `bin/mongod` plus at least one of the `mongo`/`mongosh` shells.
pub fn mongodb_files_present(mongodb_path: &str) -> bool {
    if mongodb_path.is_empty() {
        return false;
    }
    let bin = Path::new(mongodb_path).join("bin");
    let mongod = bin.join(format!("mongod{EXE_SUFFIX}"));
    let mongo = bin.join(format!("mongo{EXE_SUFFIX}"));
    let mongosh = bin.join(format!("mongosh{EXE_SUFFIX}"));
    mongod.exists() && (mongo.exists() || mongosh.exists())
}

/// HTTP health check: 200 means running, any other status means degraded,
/// and a connection failure or timeout means the server is not up.
pub async fn server_health(url: &str, timeout_secs: u64) -> Health {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to build health-check client");
            return Health::Unknown;
        }
    };

    match client.get(url).send().await {
        Ok(response) if response.status() == reqwest::StatusCode::OK => Health::Running,
        Ok(response) => {
            tracing::debug!(status = %response.status(), url, "Health check non-200");
            Health::Degraded
        }
        Err(e) => {
            tracing::debug!(error = %e, url, "Health check connection failed");
            Health::Stopped
        }
    }
}

/// Aggregate of every probe relevant to launching the stack.
#[derive(Debug, Clone)]
pub struct EnvironmentReport {
    pub git: ToolInfo,
    pub conda: ToolInfo,
    pub conda_env: bool,
    pub project_files: bool,
    pub mongodb: bool,
}

impl EnvironmentReport {
    /// Launch is enabled only when every environment probe passes.
    pub fn can_launch(&self) -> bool {
        self.git.installed
            && self.conda.installed
            && self.conda_env
            && self.project_files
            && self.mongodb
    }

    /// Coarse value for the record's `environment_status` field.
    pub fn environment_health(&self) -> Health {
        if self.git.installed && self.conda.installed && self.conda_env {
            Health::Ok
        } else {
            Health::Error
        }
    }

    /// Coarse value for the record's `mongodb_status` field.
    pub fn mongodb_health(&self, mongodb_path: &str) -> Health {
        if mongodb_path.is_empty() {
            Health::NotConfigured
        } else if self.mongodb {
            Health::Ok
        } else {
            Health::Error
        }
    }
}

/// Run every environment probe.
pub async fn run_all(record: &StatusRecord) -> EnvironmentReport {
    let (git, conda, conda_env) = tokio::join!(
        detect_git(),
        detect_conda(),
        conda_env_present(&record.conda_env),
    );

    EnvironmentReport {
        git,
        conda,
        conda_env,
        project_files: project_files_present(record),
        mongodb: mongodb_files_present(&record.mongodb_path),
    }
}
