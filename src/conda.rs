//! Conda CLI wrapper.
//!
//! Environments are provisioned with `conda create` and commands that must
//! run inside an environment are built as `conda run -n <env> ...`, the
//! non-interactive equivalent of activating the environment first.

use anyhow::Result;

use crate::events::LogSink;
use crate::exec::{CommandRunner, CommandSpec};

pub struct CondaCli;

impl CondaCli {
    /// Whether an environment with `name` exists.
    pub async fn env_exists(runner: &dyn CommandRunner, name: &str) -> Result<bool> {
        let spec = CommandSpec::new("conda").args(["env", "list"]);
        let listing = runner.capture(&spec).await?;
        // `conda env list` prints one env per line, name first
        Ok(listing
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split_whitespace().next())
            .any(|env| env == name))
    }

    /// Create environment `name` with the given python version.
    pub async fn create_env(
        runner: &dyn CommandRunner,
        name: &str,
        python_version: &str,
        sink: &LogSink,
    ) -> bool {
        let python = format!("python={python_version}");
        let spec =
            CommandSpec::new("conda").args(["create", "-n", name, python.as_str(), "-y"]);
        runner.run(&spec, sink).await
    }

    /// Build a command that runs `program args...` inside environment `name`.
    pub fn run_in_env<I, S>(name: &str, program: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("conda")
            .args(["run", "-n", name, "--no-capture-output", program])
            .args(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct ListingRunner(String);

    #[async_trait]
    impl CommandRunner for ListingRunner {
        async fn run(&self, _spec: &CommandSpec, _sink: &LogSink) -> bool {
            true
        }

        async fn capture(&self, _spec: &CommandSpec) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_env_exists_matches_whole_name() {
        let listing = "\
# conda environments:
#
base                  *  /opt/conda
pandaaitool              /opt/conda/envs/pandaaitool
pandaaitool-old          /opt/conda/envs/pandaaitool-old";
        let runner = ListingRunner(listing.to_string());

        assert!(CondaCli::env_exists(&runner, "pandaaitool").await.unwrap());
        assert!(CondaCli::env_exists(&runner, "base").await.unwrap());
        // Substring of another env name must not match
        assert!(!CondaCli::env_exists(&runner, "panda").await.unwrap());
        assert!(!CondaCli::env_exists(&runner, "missing").await.unwrap());
    }

    #[test]
    fn test_run_in_env_builds_conda_run() {
        let spec = CondaCli::run_in_env("stack", "pip", ["install", "-e", "."]);
        assert_eq!(spec.program, "conda");
        assert_eq!(
            spec.args,
            vec!["run", "-n", "stack", "--no-capture-output", "pip", "install", "-e", "."]
        );
    }
}
