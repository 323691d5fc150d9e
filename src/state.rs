//! Persisted deployment status.
//!
//! The status file is a flat JSON object, human-editable, written after every
//! mutation. Loading merges saved values over the documented defaults, so a
//! file written by an older version never breaks a newer one and vice versa.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Overall progress of the deployment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl DeploymentStatus {
    pub fn describe(self) -> &'static str {
        match self {
            DeploymentStatus::NotStarted => "not started",
            DeploymentStatus::InProgress => "in progress",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
        }
    }
}

/// Coarse health of an environment fact or service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Unknown,
    Ok,
    Error,
    NotConfigured,
    Stopped,
    Running,
    /// The service answered, but not with a 200.
    Degraded,
}

impl Health {
    pub fn describe(self) -> &'static str {
        match self {
            Health::Unknown => "unknown",
            Health::Ok => "ok",
            Health::Error => "error",
            Health::NotConfigured => "not configured",
            Health::Stopped => "stopped",
            Health::Running => "running",
            Health::Degraded => "degraded",
        }
    }
}

/// The persisted record: operator-supplied configuration plus discovered
/// environment facts and deployment progress.
///
/// Unknown keys in the file are ignored; missing keys take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRecord {
    pub project_path: String,
    pub conda_env: String,
    pub git_url: String,
    pub quantflow_git_url: String,
    pub mongodb_path: String,
    pub mongodb_status: Health,
    pub deployment_status: DeploymentStatus,
    pub last_update: String,
    pub git_commit: String,
    pub quantflow_commit: String,
    pub environment_status: Health,
    pub server_status: Health,
    /// Step ids in completion order. Never contains duplicates.
    pub completed_steps: Vec<String>,
    pub last_check: String,
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            project_path: String::new(),
            conda_env: "pandaaitool".to_string(),
            git_url: "https://github.com/PandaAI-Tech/panda_factor.git".to_string(),
            quantflow_git_url: "https://github.com/PandaAI-Tech/panda_quantflow.git".to_string(),
            mongodb_path: String::new(),
            mongodb_status: Health::Unknown,
            deployment_status: DeploymentStatus::NotStarted,
            last_update: String::new(),
            git_commit: String::new(),
            quantflow_commit: String::new(),
            environment_status: Health::Unknown,
            server_status: Health::Stopped,
            completed_steps: Vec::new(),
            last_check: String::new(),
        }
    }
}

impl StatusRecord {
    /// Install location of the factor checkout.
    pub fn factor_path(&self) -> PathBuf {
        Path::new(&self.project_path).join("panda_factor")
    }

    /// Install location of the quantflow checkout.
    pub fn quantflow_path(&self) -> PathBuf {
        Path::new(&self.project_path).join("panda_quantflow")
    }

    pub fn step_completed(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }
}

/// Owns the in-memory record and its file on disk.
///
/// The in-memory record is authoritative: persistence failures are logged and
/// swallowed, never surfaced to callers.
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    record: StatusRecord,
}

impl StatusStore {
    /// Load the record from `path`, merging saved values over defaults.
    ///
    /// A missing, unreadable, or unparseable file yields the default record.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<StatusRecord>(&contents) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Status file unparseable, using defaults");
                    StatusRecord::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusRecord::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Status file unreadable, using defaults");
                StatusRecord::default()
            }
        };
        Self { path, record }
    }

    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamp `last_check` and write the full record to disk.
    ///
    /// Write failures are logged and swallowed; the in-memory record remains
    /// authoritative for the rest of the process lifetime.
    pub fn save(&mut self) {
        self.record.last_check = timestamp_now();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(parent) {
                    warn!(path = %parent.display(), error = %e, "Failed to create status directory");
                    return;
                }
            }
        }

        match serde_json::to_string_pretty(&self.record) {
            Ok(contents) => {
                if let Err(e) = fs::write(&self.path, contents) {
                    warn!(path = %self.path.display(), error = %e, "Failed to write status file");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize status record"),
        }
    }

    /// Apply field assignments to the record, then save. The only mutation path.
    pub fn update<F: FnOnce(&mut StatusRecord)>(&mut self, apply: F) {
        apply(&mut self.record);
        self.save();
    }

    /// Record a step as complete (dedup append, completion order preserved)
    /// and persist immediately.
    pub fn complete_step(&mut self, step_id: &str) {
        if !self.record.step_completed(step_id) {
            self.record.completed_steps.push(step_id.to_string());
        }
        self.save();
    }

    /// Restore the default record. Explicit operator action only.
    pub fn reset(&mut self) {
        self.record = StatusRecord::default();
        self.save();
    }
}

/// Human-readable local timestamp used for `last_update` / `last_check`.
pub fn timestamp_now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> StatusStore {
        StatusStore::load(dir.path().join("status.json"))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(*store.record(), StatusRecord::default());
        assert_eq!(store.record().conda_env, "pandaaitool");
        assert_eq!(store.record().deployment_status, DeploymentStatus::NotStarted);
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        fs::write(&path, r#"{"project_path": "/x"}"#).unwrap();

        let store = StatusStore::load(&path);
        assert_eq!(store.record().project_path, "/x");

        // Every other field keeps its documented default
        let defaults = StatusRecord::default();
        assert_eq!(store.record().conda_env, defaults.conda_env);
        assert_eq!(store.record().git_url, defaults.git_url);
        assert_eq!(store.record().deployment_status, defaults.deployment_status);
        assert_eq!(store.record().completed_steps, defaults.completed_steps);
        assert_eq!(store.record().server_status, Health::Stopped);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        fs::write(
            &path,
            r#"{"project_path": "/x", "some_future_field": {"nested": true}}"#,
        )
        .unwrap();

        let store = StatusStore::load(&path);
        assert_eq!(store.record().project_path, "/x");
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        fs::write(&path, "not json {{{").unwrap();

        let store = StatusStore::load(&path);
        assert_eq!(*store.record(), StatusRecord::default());
    }

    #[test]
    fn test_round_trip_refreshes_last_check() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");

        let mut store = StatusStore::load(&path);
        store.update(|r| {
            r.project_path = "/opt/stack".to_string();
            r.deployment_status = DeploymentStatus::InProgress;
            r.completed_steps = vec!["check_environment".to_string()];
        });
        let saved = store.record().clone();
        assert!(!saved.last_check.is_empty());

        let reloaded = StatusStore::load(&path);
        let mut expected = saved.clone();
        expected.last_check = reloaded.record().last_check.clone();
        assert_eq!(*reloaded.record(), expected);
    }

    #[test]
    fn test_complete_step_deduplicates() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store.complete_step("clone_project");
        store.complete_step("setup_conda_env");
        store.complete_step("clone_project");

        assert_eq!(
            store.record().completed_steps,
            vec!["clone_project".to_string(), "setup_conda_env".to_string()]
        );
    }

    #[test]
    fn test_reset_restores_defaults() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.update(|r| {
            r.project_path = "/x".to_string();
            r.deployment_status = DeploymentStatus::Failed;
            r.completed_steps.push("clone_project".to_string());
        });

        store.reset();
        let mut expected = StatusRecord::default();
        expected.last_check = store.record().last_check.clone();
        assert_eq!(*store.record(), expected);

        // The reset survives a reload
        let reloaded = StatusStore::load(store.path());
        assert!(reloaded.record().completed_steps.is_empty());
    }

    #[test]
    fn test_save_failure_keeps_memory_authoritative() {
        let dir = TempDir::new().unwrap();
        // A directory at the status path makes every write fail
        let path = dir.path().join("status.json");
        fs::create_dir_all(&path).unwrap();

        let mut store = StatusStore::load(&path);
        store.update(|r| r.project_path = "/kept".to_string());
        assert_eq!(store.record().project_path, "/kept");
    }

    #[test]
    fn test_enum_serialization_is_snake_case() {
        let record = StatusRecord {
            deployment_status: DeploymentStatus::InProgress,
            mongodb_status: Health::NotConfigured,
            ..StatusRecord::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""deployment_status":"in_progress""#));
        assert!(json.contains(r#""mongodb_status":"not_configured""#));
    }
}
