//! Git CLI wrapper.
//!
//! Uses the git CLI directly rather than libgit2 so clones and pulls behave
//! exactly like the operator's own git, including credentials and hooks.
//! Mutating operations stream their output; queries capture it.

use anyhow::Result;
use std::path::Path;

use crate::events::LogSink;
use crate::exec::{CommandRunner, CommandSpec};

pub struct GitCli;

impl GitCli {
    /// Clone `url` into `dest`. Output is streamed to the sink.
    pub async fn clone(runner: &dyn CommandRunner, url: &str, dest: &Path, sink: &LogSink) -> bool {
        let spec = CommandSpec::new("git")
            .args(["clone", url])
            .arg(dest.to_string_lossy());
        runner.run(&spec, sink).await
    }

    /// Pull the current branch in `repo`. Output is streamed to the sink.
    pub async fn pull(runner: &dyn CommandRunner, repo: &Path, sink: &LogSink) -> bool {
        let spec = CommandSpec::new("git").arg("pull").current_dir(repo);
        runner.run(&spec, sink).await
    }

    pub async fn fetch(runner: &dyn CommandRunner, repo: &Path) -> Result<()> {
        let spec = CommandSpec::new("git").arg("fetch").current_dir(repo);
        runner.capture(&spec).await?;
        Ok(())
    }

    /// The HEAD commit SHA of `repo`.
    pub async fn head_commit(runner: &dyn CommandRunner, repo: &Path) -> Result<String> {
        let spec = CommandSpec::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(repo);
        runner.capture(&spec).await
    }

    /// Whether the local branch is behind its upstream. Call after `fetch`.
    pub async fn is_behind_remote(runner: &dyn CommandRunner, repo: &Path) -> Result<bool> {
        let spec = CommandSpec::new("git")
            .args(["status", "-uno"])
            .current_dir(repo);
        let output = runner.capture(&spec).await?;
        Ok(output.contains("behind"))
    }

    /// One-line subjects of commits on origin/main that HEAD lacks.
    pub async fn pending_commits(runner: &dyn CommandRunner, repo: &Path) -> Result<String> {
        let spec = CommandSpec::new("git")
            .args(["log", "HEAD..origin/main", "--oneline"])
            .current_dir(repo);
        runner.capture(&spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records specs and answers from a script.
    struct RecordingRunner {
        invocations: Mutex<Vec<CommandSpec>>,
        capture_reply: String,
    }

    impl RecordingRunner {
        fn new(capture_reply: &str) -> Self {
            Self {
                invocations: Mutex::new(Vec::new()),
                capture_reply: capture_reply.to_string(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: &CommandSpec, _sink: &LogSink) -> bool {
            self.invocations.lock().unwrap().push(spec.clone());
            true
        }

        async fn capture(&self, spec: &CommandSpec) -> Result<String> {
            self.invocations.lock().unwrap().push(spec.clone());
            if self.capture_reply == "<err>" {
                return Err(anyhow!("scripted failure"));
            }
            Ok(self.capture_reply.clone())
        }
    }

    #[tokio::test]
    async fn test_clone_builds_expected_command() {
        let runner = RecordingRunner::new("");
        let ok = GitCli::clone(
            &runner,
            "https://example.com/repo.git",
            Path::new("/tmp/dest"),
            &LogSink::discard(),
        )
        .await;
        assert!(ok);

        let invocations = runner.invocations.lock().unwrap();
        assert_eq!(invocations[0].program, "git");
        assert_eq!(
            invocations[0].args,
            vec!["clone", "https://example.com/repo.git", "/tmp/dest"]
        );
    }

    #[tokio::test]
    async fn test_pull_runs_in_repo_dir() {
        let runner = RecordingRunner::new("");
        GitCli::pull(&runner, Path::new("/repo"), &LogSink::discard()).await;

        let invocations = runner.invocations.lock().unwrap();
        assert_eq!(invocations[0].args, vec!["pull"]);
        assert_eq!(invocations[0].cwd.as_deref(), Some(Path::new("/repo")));
    }

    #[tokio::test]
    async fn test_is_behind_remote_parses_status() {
        let behind = RecordingRunner::new("Your branch is behind 'origin/main' by 2 commits");
        assert!(GitCli::is_behind_remote(&behind, Path::new("/repo"))
            .await
            .unwrap());

        let current = RecordingRunner::new("Your branch is up to date with 'origin/main'");
        assert!(!GitCli::is_behind_remote(&current, Path::new("/repo"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_head_commit_propagates_errors() {
        let runner = RecordingRunner::new("<err>");
        assert!(GitCli::head_commit(&runner, Path::new("/repo")).await.is_err());
    }
}
