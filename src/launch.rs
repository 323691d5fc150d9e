//! Launching and stopping the deployed stack.
//!
//! Launch renders an ephemeral session script (same templates as the
//! generated artifacts, same ordering contract) and spawns it detached so
//! the services outlive this process. Stop is best-effort process
//! termination; every kill result is reported, none is fatal.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::Config;
use crate::events::LogSink;
use crate::probes;
use crate::scripts;
use crate::state::{DeploymentStatus, Health, StatusStore};

/// Start the stack. Fails fast when the deployment is incomplete or the
/// launch preconditions (database files, server entrypoint) are not met.
pub fn launch_stack(store: &StatusStore, config: &Config, sink: &LogSink) -> Result<()> {
    let record = store.record();

    if record.project_path.is_empty() || record.conda_env.is_empty() {
        bail!("deployment configuration is incomplete; run 'stackup deploy' first");
    }
    if record.deployment_status != DeploymentStatus::Completed {
        bail!(
            "deployment is {}; run 'stackup deploy' first",
            record.deployment_status.describe()
        );
    }
    if record.mongodb_path.is_empty() || !Path::new(&record.mongodb_path).exists() {
        bail!("MongoDB path is not configured or does not exist; set it with 'stackup deploy --mongodb <dir>'");
    }

    let factor_path = record.factor_path();
    let entry = probes::factor_entrypoint(&factor_path).ok_or_else(|| {
        anyhow!(
            "factor server entrypoint not found under {}",
            factor_path.display()
        )
    })?;
    sink.info(format!("found factor server entrypoint: {}", entry.display()));

    match probes::quantflow_entrypoint(&record.quantflow_path()) {
        Some(path) => sink.info(format!("found quantflow server entrypoint: {}", path.display())),
        None => sink.warn("quantflow server entrypoint not found, it will be skipped"),
    }

    let state_dir = config.state_path();
    fs::create_dir_all(&state_dir).context("Failed to create state directory")?;
    let script = scripts::write_session_script(record, config, &state_dir)?;

    sink.info(format!("launching stack via {}", script.display()));
    spawn_detached(&script)?;
    sink.info("startup script is running in the background; 'stackup check' reports server health");

    Ok(())
}

/// Spawn the session script without waiting for it.
fn spawn_detached(script: &Path) -> Result<()> {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg("start").arg("").arg(script);
        c
    } else {
        Command::new(script)
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start launch script: {}", script.display()))?;

    Ok(())
}

#[cfg(windows)]
fn kill_targets() -> Vec<(&'static str, Vec<&'static str>, &'static str)> {
    vec![
        ("taskkill", vec!["/f", "/im", "mongod.exe"], "MongoDB"),
        ("taskkill", vec!["/f", "/im", "python.exe"], "stack servers"),
    ]
}

#[cfg(not(windows))]
fn kill_targets() -> Vec<(&'static str, Vec<&'static str>, &'static str)> {
    vec![
        ("pkill", vec!["-f", "mongod"], "MongoDB"),
        ("pkill", vec!["-f", "panda_factor_server"], "factor server"),
        ("pkill", vec!["-f", "panda_server/main.py"], "quantflow server"),
    ]
}

/// Stop the stack processes. Each kill is best effort and reported.
pub fn stop_stack(store: &mut StatusStore, sink: &LogSink) {
    for (program, args, label) in kill_targets() {
        let result = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match result {
            Ok(status) if status.success() => sink.info(format!("{label} stopped")),
            Ok(_) => sink.info(format!("no running {label} found")),
            Err(e) => sink.warn(format!("could not run {program}: {e}")),
        }
    }

    store.update(|r| r.server_status = Health::Stopped);
    sink.info("stack stopped");
}

/// Open one specific page in the browser.
pub fn open_url(url: &str, sink: &LogSink) -> Result<()> {
    open::that(url).with_context(|| format!("Failed to open {url}"))?;
    sink.info(format!("opened {url}"));
    Ok(())
}

/// Open the stack UIs, preferring the factor server and falling back to
/// quantflow. Stops at the first URL that opens.
pub fn open_browser(config: &Config, sink: &LogSink) -> Result<()> {
    let urls = [&config.stack.factor_url, &config.stack.quantflow_url];

    for url in urls {
        match open::that(url) {
            Ok(()) => {
                sink.info(format!("opened {url}"));
                return Ok(());
            }
            Err(e) => sink.warn(format!("could not open {url}: {e}")),
        }
    }

    bail!("could not open a browser; visit {} by hand", config.stack.factor_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn completed_store(dir: &TempDir) -> StatusStore {
        let mut store = StatusStore::load(dir.path().join("status.json"));
        store.update(|r| {
            r.project_path = dir.path().to_string_lossy().to_string();
            r.conda_env = "stackenv".to_string();
            r.deployment_status = DeploymentStatus::Completed;
        });
        store
    }

    #[test]
    fn test_launch_requires_completed_deployment() {
        let dir = TempDir::new().unwrap();
        let mut store = completed_store(&dir);
        store.update(|r| r.deployment_status = DeploymentStatus::InProgress);

        let err = launch_stack(&store, &Config::default(), &LogSink::discard()).unwrap_err();
        assert!(err.to_string().contains("in progress"));
    }

    #[test]
    fn test_launch_requires_mongodb_path() {
        let dir = TempDir::new().unwrap();
        let store = completed_store(&dir);

        let err = launch_stack(&store, &Config::default(), &LogSink::discard()).unwrap_err();
        assert!(err.to_string().contains("MongoDB"));
    }

    #[test]
    fn test_launch_requires_server_entrypoint() {
        let dir = TempDir::new().unwrap();
        let mongodb = TempDir::new().unwrap();
        let mut store = completed_store(&dir);
        store.update(|r| r.mongodb_path = mongodb.path().to_string_lossy().to_string());

        // MongoDB dir exists but there is no factor checkout
        let err = launch_stack(&store, &Config::default(), &LogSink::discard()).unwrap_err();
        assert!(err.to_string().contains("entrypoint"));
    }

    #[test]
    fn test_kill_targets_stop_database_first() {
        let targets = kill_targets();
        assert!(targets.len() >= 2);
        assert_eq!(targets[0].2, "MongoDB");
    }

    #[test]
    fn test_default_record_is_not_launchable() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::load(dir.path().join("status.json"));
        let err = launch_stack(&store, &Config::default(), &LogSink::discard()).unwrap_err();
        assert!(err.to_string().contains("incomplete"));
    }
}
