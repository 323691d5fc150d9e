//! The deployment step catalogue.
//!
//! Steps are a fixed, ordered list; each has a stable string id recorded in
//! the status file when it completes. Ids are part of the on-disk format, so
//! existing status files keep resuming correctly - never renumber or rename.
//!
//! A handler returns `Ok(())` when the step should be recorded complete and
//! `Err` when the failure is fatal to the sequence. Sub-command failures that
//! are merely advisory (an optional install that can be redone by hand) are
//! logged as warnings inside the handler and do not fail the step.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;

use crate::conda::CondaCli;
use crate::config::Config;
use crate::events::LogSink;
use crate::exec::CommandRunner;
use crate::git::GitCli;
use crate::scripts;
use crate::state::StatusRecord;

/// Submodules of the factor checkout installed as editable packages.
const FACTOR_SUBMODULES: &[&str] = &[
    "panda_common",
    "panda_factor",
    "panda_data",
    "panda_data_hub",
    "panda_llm",
    "panda_factor_server",
];

/// Everything a step handler needs. The record is a snapshot taken when the
/// sequence started; steps never write to the store directly.
pub struct StepContext<'a> {
    pub record: &'a StatusRecord,
    pub config: &'a Config,
    pub runner: &'a dyn CommandRunner,
    pub sink: &'a LogSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CheckEnvironment,
    CreateDirectory,
    CloneProject,
    SetupCondaEnv,
    InstallDependencies,
    DeployQuantflow,
    CreateScripts,
}

impl Step {
    /// The full catalogue, in execution order.
    pub const CATALOGUE: [Step; 7] = [
        Step::CheckEnvironment,
        Step::CreateDirectory,
        Step::CloneProject,
        Step::SetupCondaEnv,
        Step::InstallDependencies,
        Step::DeployQuantflow,
        Step::CreateScripts,
    ];

    /// Stable identifier recorded in the status file.
    pub fn id(self) -> &'static str {
        match self {
            Step::CheckEnvironment => "check_environment",
            Step::CreateDirectory => "create_directory",
            Step::CloneProject => "clone_project",
            Step::SetupCondaEnv => "setup_conda_env",
            Step::InstallDependencies => "install_dependencies",
            Step::DeployQuantflow => "deploy_quantflow",
            Step::CreateScripts => "create_scripts",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Step::CheckEnvironment => "check environment",
            Step::CreateDirectory => "create install directory",
            Step::CloneProject => "clone factor repository",
            Step::SetupCondaEnv => "set up conda environment",
            Step::InstallDependencies => "install dependencies",
            Step::DeployQuantflow => "deploy quantflow",
            Step::CreateScripts => "generate launch scripts",
        }
    }

    pub async fn execute(self, ctx: &StepContext<'_>) -> Result<()> {
        match self {
            Step::CheckEnvironment => check_environment(ctx).await,
            Step::CreateDirectory => create_directory(ctx),
            Step::CloneProject => clone_project(ctx).await,
            Step::SetupCondaEnv => setup_conda_env(ctx).await,
            Step::InstallDependencies => install_dependencies(ctx).await,
            Step::DeployQuantflow => deploy_quantflow(ctx).await,
            Step::CreateScripts => create_scripts(ctx),
        }
    }
}

async fn check_environment(ctx: &StepContext<'_>) -> Result<()> {
    use crate::exec::CommandSpec;

    let git = ctx
        .runner
        .capture(&CommandSpec::new("git").arg("--version"))
        .await
        .map_err(|_| anyhow!("git is not installed or not on PATH"))?;
    ctx.sink.info(format!("found {git}"));

    let conda = ctx
        .runner
        .capture(&CommandSpec::new("conda").arg("--version"))
        .await
        .map_err(|_| anyhow!("conda is not installed or not on PATH"))?;
    ctx.sink.info(format!("found {conda}"));

    Ok(())
}

fn create_directory(ctx: &StepContext<'_>) -> Result<()> {
    let path = Path::new(&ctx.record.project_path);
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create install directory: {}", path.display()))?;
    ctx.sink.info(format!("install directory ready: {}", path.display()));
    Ok(())
}

async fn clone_project(ctx: &StepContext<'_>) -> Result<()> {
    let factor_path = ctx.record.factor_path();

    if factor_path.exists() {
        ctx.sink
            .info("factor checkout already exists, pulling latest changes");
        if !GitCli::pull(ctx.runner, &factor_path, ctx.sink).await {
            return Err(anyhow!("failed to update the factor repository"));
        }
    } else if !GitCli::clone(ctx.runner, &ctx.record.git_url, &factor_path, ctx.sink).await {
        return Err(anyhow!("failed to clone the factor repository"));
    }

    Ok(())
}

async fn setup_conda_env(ctx: &StepContext<'_>) -> Result<()> {
    let env = &ctx.record.conda_env;

    let exists = CondaCli::env_exists(ctx.runner, env)
        .await
        .context("failed to list conda environments")?;

    if exists {
        ctx.sink.info(format!("conda environment '{env}' already exists"));
        return Ok(());
    }

    ctx.sink.info(format!("creating conda environment '{env}'"));
    if !CondaCli::create_env(ctx.runner, env, &ctx.config.stack.python_version, ctx.sink).await {
        return Err(anyhow!("failed to create conda environment '{env}'"));
    }

    Ok(())
}

async fn install_dependencies(ctx: &StepContext<'_>) -> Result<()> {
    let factor_path = ctx.record.factor_path();
    let env = &ctx.record.conda_env;

    let requirements = factor_path.join("requirements.txt");
    if requirements.exists() {
        let spec = CondaCli::run_in_env(
            env,
            "pip",
            ["install", "-r", "requirements.txt", "--ignore-installed"],
        )
        .current_dir(&factor_path);

        if !ctx.runner.run(&spec, ctx.sink).await {
            ctx.sink
                .warn("some dependencies failed to install; they can be installed by hand later");
        }
    } else {
        ctx.sink.warn("requirements.txt not found, skipping dependency install");
    }

    // Editable installs for whichever submodules the checkout actually has
    let existing: Vec<String> = FACTOR_SUBMODULES
        .iter()
        .filter(|m| factor_path.join(m).exists())
        .map(|m| format!("./{m}"))
        .collect();

    for module in FACTOR_SUBMODULES {
        if !factor_path.join(module).exists() {
            ctx.sink.warn(format!("submodule directory not found: {module}"));
        }
    }

    if existing.is_empty() {
        ctx.sink.warn("no submodule directories found to install");
        return Ok(());
    }

    ctx.sink
        .info(format!("installing editable submodules: {}", existing.join(" ")));
    let mut args = vec!["install".to_string(), "-e".to_string()];
    args.extend(existing);
    let spec = CondaCli::run_in_env(env, "pip", args).current_dir(&factor_path);

    if !ctx.runner.run(&spec, ctx.sink).await {
        ctx.sink
            .warn("some submodules failed to install; module imports may not resolve until fixed");
    }

    Ok(())
}

async fn deploy_quantflow(ctx: &StepContext<'_>) -> Result<()> {
    let url = &ctx.record.quantflow_git_url;
    if url.is_empty() {
        ctx.sink
            .warn("quantflow repository not configured, skipping");
        return Ok(());
    }

    let quantflow_path = ctx.record.quantflow_path();

    if quantflow_path.exists() {
        ctx.sink.info("updating quantflow checkout");
        if !GitCli::pull(ctx.runner, &quantflow_path, ctx.sink).await {
            ctx.sink.warn("failed to update quantflow, continuing with the existing checkout");
        }
    } else {
        ctx.sink.info("cloning quantflow repository");
        if !GitCli::clone(ctx.runner, url, &quantflow_path, ctx.sink).await {
            return Err(anyhow!("failed to clone the quantflow repository"));
        }
    }

    if quantflow_path.exists() {
        let spec = CondaCli::run_in_env(&ctx.record.conda_env, "pip", ["install", "-e", "."])
            .current_dir(&quantflow_path);
        if !ctx.runner.run(&spec, ctx.sink).await {
            ctx.sink
                .warn("quantflow install failed; run 'pip install -e .' in the checkout by hand");
        }
    }

    Ok(())
}

fn create_scripts(ctx: &StepContext<'_>) -> Result<()> {
    match scripts::write_launch_scripts(ctx.record, ctx.config) {
        Ok(written) => {
            for path in written {
                ctx.sink.info(format!("wrote launch script: {}", path.display()));
            }
        }
        Err(e) => ctx.sink.warn(format!("failed to write launch scripts: {e:#}")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_order_is_fixed() {
        let ids: Vec<&str> = Step::CATALOGUE.iter().map(|s| s.id()).collect();
        assert_eq!(
            ids,
            vec![
                "check_environment",
                "create_directory",
                "clone_project",
                "setup_conda_env",
                "install_dependencies",
                "deploy_quantflow",
                "create_scripts",
            ]
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let mut ids: Vec<&str> = Step::CATALOGUE.iter().map(|s| s.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), Step::CATALOGUE.len());
    }
}
