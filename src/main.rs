use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use stackup::config::Config;
use stackup::deploy::{DeployError, Sequencer};
use stackup::events::{format_event, LogSink, Progress};
use stackup::exec::ShellRunner;
use stackup::git::GitCli;
use stackup::launch;
use stackup::logging;
use stackup::probes;
use stackup::state::StatusStore;

#[derive(Parser)]
#[command(name = "stackup")]
#[command(about = "Local deployment manager for the factor/quantflow analytics stack")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deployment sequence, resuming any previous progress
    Deploy {
        /// Install directory for the stack
        #[arg(long)]
        path: Option<String>,

        /// Conda environment name
        #[arg(long)]
        env: Option<String>,

        /// Factor repository URL
        #[arg(long)]
        git_url: Option<String>,

        /// Quantflow repository URL
        #[arg(long)]
        quantflow_url: Option<String>,

        /// MongoDB install directory
        #[arg(long)]
        mongodb: Option<String>,
    },

    /// Start the deployed stack (database, servers, browser)
    Launch,

    /// Stop the running stack processes
    Stop,

    /// Show the recorded deployment status
    Status,

    /// Probe the environment and server health
    Check,

    /// Check the factor checkout for upstream updates
    Updates,

    /// Open the stack UIs in the browser
    Open {
        /// Specific page to open (default: the factor UI, falling back to quantflow)
        #[arg(value_enum)]
        page: Option<Page>,
    },

    /// Clear all recorded status and start over
    Reset {
        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

/// Stack pages reachable from the browser.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Page {
    /// Factor web UI
    Factor,
    /// Quantflow workflow editor
    Workflow,
    /// Quantflow charts
    Charts,
    /// Data source maintenance
    DataUpdate,
    /// Data listing
    DataList,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let logging_handle = logging::init_logging(&config, cli.debug)?;
    if let Some(path) = &logging_handle.log_file_path {
        tracing::debug!(log_file = %path.display(), "Logging to file");
    }

    match cli.command {
        Commands::Deploy {
            path,
            env,
            git_url,
            quantflow_url,
            mongodb,
        } => run_deploy(&config, path, env, git_url, quantflow_url, mongodb).await,
        Commands::Launch => run_launch(&config),
        Commands::Stop => run_stop(&config).await,
        Commands::Status => run_status(&config),
        Commands::Check => run_check(&config).await,
        Commands::Updates => run_updates(&config).await,
        Commands::Open { page } => run_open(&config, page),
        Commands::Reset { yes } => run_reset(&config, yes),
    }
}

/// Single consumer of progress events; workers never print directly.
fn spawn_printer(mut rx: UnboundedReceiver<Progress>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", format_event(&event));
        }
    })
}

async fn run_deploy(
    config: &Config,
    path: Option<String>,
    env: Option<String>,
    git_url: Option<String>,
    quantflow_url: Option<String>,
    mongodb: Option<String>,
) -> Result<()> {
    let mut store = StatusStore::load(config.status_file_path());

    // Persist operator-supplied values before anything runs, like form fields
    store.update(|r| {
        if let Some(path) = path {
            r.project_path = path;
        }
        if let Some(env) = env {
            r.conda_env = env;
        }
        if let Some(url) = git_url {
            r.git_url = url;
        }
        if let Some(url) = quantflow_url {
            r.quantflow_git_url = url;
        }
        if let Some(path) = mongodb {
            r.mongodb_path = path;
        }
    });

    let (sink, rx) = LogSink::channel();
    let printer = spawn_printer(rx);

    let sequencer = Sequencer::new(config.clone(), Arc::new(ShellRunner::new()));

    // Ctrl-C requests a stop between steps; the running command finishes first
    let cancel = sequencer.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let result = sequencer.run(&mut store, &sink).await;
    drop(sink);
    let _ = printer.await;

    match result {
        Ok(()) => {
            println!();
            println!("deployment complete");
            println!("  project:   {}", store.record().factor_path().display());
            println!("  conda env: {}", store.record().conda_env);
            println!();
            println!("next: 'stackup launch' starts the stack and opens the browser");
            Ok(())
        }
        Err(DeployError::StepFailed { step, message }) => {
            bail!("deployment failed at '{step}': {message}")
        }
        Err(e) => bail!(e),
    }
}

fn run_launch(config: &Config) -> Result<()> {
    let store = StatusStore::load(config.status_file_path());
    let (sink, mut rx) = LogSink::channel();

    let result = launch::launch_stack(&store, config, &sink);
    drop(sink);
    while let Ok(event) = rx.try_recv() {
        println!("{}", format_event(&event));
    }
    result
}

async fn run_stop(config: &Config) -> Result<()> {
    let mut store = StatusStore::load(config.status_file_path());
    let (sink, rx) = LogSink::channel();
    let printer = spawn_printer(rx);

    launch::stop_stack(&mut store, &sink);

    drop(sink);
    let _ = printer.await;
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    let store = StatusStore::load(config.status_file_path());
    let record = store.record();

    let or_unset = |s: &str| {
        if s.is_empty() {
            "(unset)".to_string()
        } else {
            s.to_string()
        }
    };
    let short = |commit: &str| {
        if commit.len() >= 8 {
            commit[..8].to_string()
        } else {
            or_unset(commit)
        }
    };

    println!("deployment:       {}", record.deployment_status.describe());
    println!("project path:     {}", or_unset(&record.project_path));
    println!("conda env:        {}", or_unset(&record.conda_env));
    println!("factor repo:      {}", or_unset(&record.git_url));
    println!("quantflow repo:   {}", or_unset(&record.quantflow_git_url));
    println!("mongodb path:     {}", or_unset(&record.mongodb_path));
    println!("environment:      {}", record.environment_status.describe());
    println!("mongodb:          {}", record.mongodb_status.describe());
    println!("server:           {}", record.server_status.describe());
    println!("factor commit:    {}", short(&record.git_commit));
    println!("quantflow commit: {}", short(&record.quantflow_commit));
    println!("last update:      {}", or_unset(&record.last_update));
    println!("last check:       {}", or_unset(&record.last_check));

    if record.completed_steps.is_empty() {
        println!("completed steps:  none");
    } else {
        println!("completed steps:  {}", record.completed_steps.join(", "));
    }

    Ok(())
}

async fn run_check(config: &Config) -> Result<()> {
    let mut store = StatusStore::load(config.status_file_path());

    let report = probes::run_all(store.record()).await;
    let server = probes::server_health(
        &config.stack.factor_url,
        config.stack.health_timeout_secs,
    )
    .await;

    let mark = |ok: bool| if ok { "ok" } else { "missing" };
    let version = |info: &probes::ToolInfo| {
        info.version
            .clone()
            .unwrap_or_else(|| "not found".to_string())
    };

    println!("git:           {} ({})", mark(report.git.installed), version(&report.git));
    println!("conda:         {} ({})", mark(report.conda.installed), version(&report.conda));
    println!(
        "conda env:     {} ({})",
        mark(report.conda_env),
        store.record().conda_env
    );
    println!("project files: {}", mark(report.project_files));
    println!("mongodb:       {}", mark(report.mongodb));
    println!("server:        {} ({})", server.describe(), config.stack.factor_url);

    let environment_status = report.environment_health();
    let mongodb_status = report.mongodb_health(&store.record().mongodb_path);
    store.update(|r| {
        r.environment_status = environment_status;
        r.mongodb_status = mongodb_status;
        r.server_status = server;
    });

    println!();
    if report.can_launch() {
        println!("environment is ready; 'stackup launch' will start the stack");
    } else {
        println!("environment is not ready for launch");
    }

    Ok(())
}

async fn run_updates(config: &Config) -> Result<()> {
    let mut store = StatusStore::load(config.status_file_path());
    let factor_path = store.record().factor_path();
    if !factor_path.exists() {
        bail!(
            "factor checkout not found at {}; run 'stackup deploy' first",
            factor_path.display()
        );
    }

    let runner = ShellRunner::new();

    println!("fetching from origin...");
    GitCli::fetch(&runner, &factor_path).await?;

    if GitCli::is_behind_remote(&runner, &factor_path).await? {
        println!("updates are available:");
        match GitCli::pending_commits(&runner, &factor_path).await {
            Ok(log) if !log.is_empty() => {
                for line in log.lines() {
                    println!("  {line}");
                }
            }
            _ => println!("  (could not list pending commits)"),
        }
    } else {
        println!("factor checkout is up to date");
    }

    if let Ok(commit) = GitCli::head_commit(&runner, &factor_path).await {
        store.update(|r| r.git_commit = commit);
    }

    Ok(())
}

fn run_open(config: &Config, page: Option<Page>) -> Result<()> {
    let (sink, mut rx) = LogSink::channel();

    let result = match page {
        None => launch::open_browser(config, &sink),
        Some(page) => {
            let url = match page {
                Page::Factor => config.stack.factor_url.clone(),
                Page::Workflow => config.stack.quantflow_url.clone(),
                Page::Charts => config.stack.charts_url(),
                Page::DataUpdate => config.stack.data_update_url(),
                Page::DataList => config.stack.data_list_url(),
            };
            launch::open_url(&url, &sink)
        }
    };

    drop(sink);
    while let Ok(event) = rx.try_recv() {
        println!("{}", format_event(&event));
    }
    result
}

fn run_reset(config: &Config, yes: bool) -> Result<()> {
    if !yes {
        println!("this clears all recorded deployment progress and configuration;");
        println!("rerun with --yes to confirm");
        return Ok(());
    }

    let mut store = StatusStore::load(config.status_file_path());
    store.reset();
    println!("status cleared");
    Ok(())
}
