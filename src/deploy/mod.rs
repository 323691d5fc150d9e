//! The deployment sequencer.
//!
//! Runs the step catalogue in order against the status store. Steps already
//! recorded complete are skipped without re-verification; the record is
//! trusted even if an artifact was deleted behind our back (`stackup reset`
//! is the recovery path). A step is recorded complete only after its action
//! succeeds, and the record is persisted immediately after each step, so a
//! crash mid-sequence loses at most the step that was running.

mod steps;

pub use steps::{Step, StepContext};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{LogSink, Progress};
use crate::exec::CommandRunner;
use crate::git::GitCli;
use crate::state::{timestamp_now, DeploymentStatus, StatusStore};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("a deployment is already in progress")]
    AlreadyRunning,
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),
    #[error("deployment cancelled before step '{0}'")]
    Cancelled(&'static str),
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: &'static str, message: String },
}

/// Executes the catalogue with resume support.
///
/// One sequencer is shared per process; the busy flag rejects a second run
/// while one is in flight, since interleaved writers would corrupt the
/// completed-steps list.
pub struct Sequencer {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    busy: AtomicBool,
    cancel: Arc<AtomicBool>,
}

impl Sequencer {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            busy: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked before each step starts. Raising it stops the sequence
    /// between steps; a command already running completes first.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run every step not yet recorded complete, in catalogue order.
    pub async fn run(&self, store: &mut StatusStore, sink: &LogSink) -> Result<(), DeployError> {
        let _busy = BusyGuard::acquire(&self.busy).ok_or(DeployError::AlreadyRunning)?;

        validate_config(store)?;

        store.update(|r| r.deployment_status = DeploymentStatus::InProgress);

        let total = Step::CATALOGUE.len();
        let already_done = store.record().completed_steps.len();
        if already_done > 0 {
            sink.info(format!(
                "resuming: {} of {} steps previously completed ({})",
                already_done,
                total,
                store.record().completed_steps.join(", ")
            ));
        }

        for (index, step) in Step::CATALOGUE.into_iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                sink.warn(format!("cancelled before step '{}'", step.title()));
                return Err(DeployError::Cancelled(step.id()));
            }

            if store.record().step_completed(step.id()) {
                sink.send(Progress::StepSkipped {
                    index,
                    total,
                    title: step.title(),
                });
                continue;
            }

            sink.send(Progress::StepStarted {
                index,
                total,
                title: step.title(),
            });

            let snapshot = store.record().clone();
            let ctx = StepContext {
                record: &snapshot,
                config: &self.config,
                runner: self.runner.as_ref(),
                sink,
            };

            match step.execute(&ctx).await {
                Ok(()) => {
                    // Completion is recorded only after the action succeeded,
                    // and persisted before the next step starts
                    store.complete_step(step.id());
                    sink.send(Progress::StepCompleted {
                        index,
                        total,
                        title: step.title(),
                    });
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    sink.warn(format!("step '{}' failed: {message}", step.title()));
                    warn!(step = step.id(), error = %message, "Deployment step failed");
                    store.update(|r| r.deployment_status = DeploymentStatus::Failed);
                    return Err(DeployError::StepFailed {
                        step: step.id(),
                        message,
                    });
                }
            }
        }

        store.update(|r| {
            r.deployment_status = DeploymentStatus::Completed;
            r.last_update = timestamp_now();
        });
        self.record_commits(store).await;

        info!("Deployment completed");
        sink.info("deployment completed");
        Ok(())
    }

    /// Cache the observed HEAD commits. Informational only; failures ignored.
    async fn record_commits(&self, store: &mut StatusStore) {
        let factor_path = store.record().factor_path();
        if let Ok(commit) = GitCli::head_commit(self.runner.as_ref(), &factor_path).await {
            store.update(|r| r.git_commit = commit);
        }

        let quantflow_path = store.record().quantflow_path();
        if quantflow_path.exists() {
            if let Ok(commit) = GitCli::head_commit(self.runner.as_ref(), &quantflow_path).await {
                store.update(|r| r.quantflow_commit = commit);
            }
        }
    }
}

fn validate_config(store: &StatusStore) -> Result<(), DeployError> {
    let record = store.record();
    if record.project_path.is_empty() {
        return Err(DeployError::MissingConfig("project_path"));
    }
    if record.conda_env.is_empty() {
        return Err(DeployError::MissingConfig("conda_env"));
    }
    if record.git_url.is_empty() {
        return Err(DeployError::MissingConfig("git_url"));
    }
    Ok(())
}

/// Holds the busy flag for the duration of a run.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
