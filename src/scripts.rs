//! Generated launch artifacts.
//!
//! Startup scripts are rendered from templates and written to the install
//! directory. The ordering they encode is a contract: the database starts
//! before either server, and the browser opens only after both servers have
//! been started. A second script drops the operator into an interactive
//! shell with the stack environment prepared.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::probes;
use crate::state::StatusRecord;

/// Which script dialect to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFlavor {
    Shell,
    Batch,
}

impl ScriptFlavor {
    /// The dialect for the machine we are running on.
    pub fn native() -> Self {
        if cfg!(windows) {
            ScriptFlavor::Batch
        } else {
            ScriptFlavor::Shell
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ScriptFlavor::Shell => "sh",
            ScriptFlavor::Batch => "bat",
        }
    }
}

const STARTUP_SH: &str = r#"#!/usr/bin/env bash
# Generated by stackup. Starts the analytics stack in dependency order:
# database, factor server, quantflow server, browser.
set -u

{{#if has_mongodb}}
echo "========================================"
echo "Step 1: start MongoDB"
echo "========================================"
cd "{{mongodb_path}}"
mkdir -p data/db conf
bin/mongod --replSet rs0 --dbpath data/db --port {{mongo_port}} --quiet --fork --logpath mongod.log
echo "waiting for MongoDB to initialize..."
sleep 5
{{else}}
echo "MongoDB path not configured, skipping database startup"
{{/if}}

echo "========================================"
echo "Step 2: start factor server"
echo "========================================"
cd "{{factor_path}}"
export PYTHONPATH="$PWD:$PWD/panda_factor_server:$PWD/panda_common:$PWD/panda_data:$PWD/panda_data_hub:$PWD/panda_factor:$PWD/panda_llm${PYTHONPATH:+:$PYTHONPATH}"
nohup conda run -n {{conda_env}} --no-capture-output python {{factor_entry}} > factor_server.log 2>&1 &
echo "waiting for the factor server to initialize..."
sleep 5

{{#if has_quantflow}}
echo "========================================"
echo "Step 3: start quantflow server"
echo "========================================"
cd "{{quantflow_path}}"
nohup conda run -n {{conda_env}} --no-capture-output python {{quantflow_entry}} > quantflow_server.log 2>&1 &
sleep 10
{{else}}
echo "quantflow checkout not found, skipping"
{{/if}}

echo "========================================"
echo "Step 4: open browser"
echo "========================================"
xdg-open "{{quantflow_url}}" 2>/dev/null || open "{{quantflow_url}}" 2>/dev/null || true
echo "factor server:    {{factor_url}}"
echo "quantflow server: {{quantflow_url}}"
echo "services keep running in the background; use 'stackup stop' to stop them"
"#;

const STARTUP_BAT: &str = r#"@echo off
chcp 65001 >nul
title Analytics Stack
REM Generated by stackup. Starts the analytics stack in dependency order:
REM database, factor server, quantflow server, browser.

{{#if has_mongodb}}
echo ========================================
echo Step 1: start MongoDB
echo ========================================
cd /d "{{mongodb_path}}"
if not exist "data\db" mkdir data\db
if not exist "conf" mkdir conf
start "MongoDB Server" bin\mongod.exe --replSet rs0 --dbpath data\db --port {{mongo_port}} --quiet
echo waiting for MongoDB to initialize...
timeout /t 5 /nobreak >nul
{{else}}
echo MongoDB path not configured, skipping database startup
{{/if}}

echo ========================================
echo Step 2: start factor server
echo ========================================
cd /d "{{factor_path}}"
set PYTHONPATH=%CD%;%CD%\panda_factor_server;%CD%\panda_common;%CD%\panda_data;%CD%\panda_data_hub;%CD%\panda_factor;%CD%\panda_llm;%PYTHONPATH%
start "Factor Server" cmd /c "conda run -n {{conda_env}} --no-capture-output python {{factor_entry}} & pause"
echo waiting for the factor server to initialize...
timeout /t 5 /nobreak >nul

{{#if has_quantflow}}
echo ========================================
echo Step 3: start quantflow server
echo ========================================
cd /d "{{quantflow_path}}"
start "QuantFlow Server" cmd /c "conda run -n {{conda_env}} --no-capture-output python {{quantflow_entry}} & pause"
timeout /t 10 /nobreak >nul
{{else}}
echo quantflow checkout not found, skipping
{{/if}}

echo ========================================
echo Step 4: open browser
echo ========================================
start "" "{{quantflow_url}}"
echo factor server:    {{factor_url}}
echo quantflow server: {{quantflow_url}}
echo services keep running; use "stackup stop" to stop them
pause
"#;

const ENV_SHELL_SH: &str = r#"#!/usr/bin/env bash
# Generated by stackup. Opens a shell with the stack environment prepared.
cd "{{factor_path}}"
export PYTHONPATH="$PWD:$PWD/panda_factor_server:$PWD/panda_common:$PWD/panda_data:$PWD/panda_data_hub:$PWD/panda_factor:$PWD/panda_llm${PYTHONPATH:+:$PYTHONPATH}"
echo "environment: {{conda_env}}"
echo "project:     {{factor_path}}"
echo "run the factor server with: python {{factor_entry}}"
conda activate {{conda_env}} 2>/dev/null || source activate {{conda_env}}
exec "${SHELL:-bash}"
"#;

const ENV_SHELL_BAT: &str = r#"@echo off
chcp 65001 >nul
REM Generated by stackup. Opens a shell with the stack environment prepared.
cd /d "{{factor_path}}"
call conda activate {{conda_env}}
echo environment: {{conda_env}}
echo project:     {{factor_path}}
set PYTHONPATH=%CD%;%CD%\panda_factor_server;%CD%\panda_common;%CD%\panda_data;%CD%\panda_data_hub;%CD%\panda_factor;%CD%\panda_llm;%PYTHONPATH%
echo run the factor server with: python {{factor_entry}}
cmd /k
"#;

/// Fallback entrypoint used when the checkout is not inspectable yet.
const DEFAULT_FACTOR_ENTRY: &str = "./panda_factor_server/panda_factor_server/__main__.py";
const DEFAULT_QUANTFLOW_ENTRY: &str = "src/panda_server/main.py";

fn template_data(record: &StatusRecord, config: &Config) -> serde_json::Value {
    let factor_path = record.factor_path();
    let quantflow_path = record.quantflow_path();

    let factor_entry = probes::factor_entrypoint(&factor_path)
        .and_then(|entry| {
            entry
                .strip_prefix(&factor_path)
                .ok()
                .map(|rel| format!("./{}", rel.to_string_lossy().replace('\\', "/")))
        })
        .unwrap_or_else(|| DEFAULT_FACTOR_ENTRY.to_string());

    json!({
        "factor_path": factor_path.to_string_lossy(),
        "quantflow_path": quantflow_path.to_string_lossy(),
        "has_quantflow": quantflow_path.exists(),
        "mongodb_path": record.mongodb_path,
        "has_mongodb": !record.mongodb_path.is_empty(),
        "conda_env": record.conda_env,
        "factor_entry": factor_entry,
        "quantflow_entry": DEFAULT_QUANTFLOW_ENTRY,
        "factor_url": config.stack.factor_url,
        "quantflow_url": config.stack.quantflow_url,
        "mongo_port": config.stack.mongo_port,
    })
}

fn render(template: &str, data: &serde_json::Value) -> Result<String> {
    let mut hbs = Handlebars::new();
    hbs.set_strict_mode(false);
    // Paths and URLs must land in the script verbatim
    hbs.register_escape_fn(handlebars::no_escape);
    hbs.render_template(template, data)
        .context("Failed to render launch script template")
}

/// Render the full startup script (database, servers, browser).
pub fn render_startup(record: &StatusRecord, config: &Config, flavor: ScriptFlavor) -> Result<String> {
    let template = match flavor {
        ScriptFlavor::Shell => STARTUP_SH,
        ScriptFlavor::Batch => STARTUP_BAT,
    };
    render(template, &template_data(record, config))
}

/// Render the interactive environment-shell script.
pub fn render_env_shell(
    record: &StatusRecord,
    config: &Config,
    flavor: ScriptFlavor,
) -> Result<String> {
    let template = match flavor {
        ScriptFlavor::Shell => ENV_SHELL_SH,
        ScriptFlavor::Batch => ENV_SHELL_BAT,
    };
    render(template, &template_data(record, config))
}

fn write_script(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .with_context(|| format!("Failed to write script: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to mark script executable: {}", path.display()))?;
    }

    Ok(())
}

/// Write the startup and environment-shell scripts to the install directory,
/// in the native dialect. Returns the paths written.
pub fn write_launch_scripts(record: &StatusRecord, config: &Config) -> Result<Vec<PathBuf>> {
    let flavor = ScriptFlavor::native();
    let install = Path::new(&record.project_path);

    let startup_path = install.join(format!("start_stack.{}", flavor.extension()));
    write_script(&startup_path, &render_startup(record, config, flavor)?)?;

    let shell_path = install.join(format!("stack_shell.{}", flavor.extension()));
    write_script(&shell_path, &render_env_shell(record, config, flavor)?)?;

    Ok(vec![startup_path, shell_path])
}

/// Write an ephemeral copy of the startup script for one launch session.
pub fn write_session_script(
    record: &StatusRecord,
    config: &Config,
    dir: &Path,
) -> Result<PathBuf> {
    let flavor = ScriptFlavor::native();
    let path = dir.join(format!("session_launch.{}", flavor.extension()));
    write_script(&path, &render_startup(record, config, flavor)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record() -> StatusRecord {
        StatusRecord {
            project_path: "/opt/stack".to_string(),
            conda_env: "stackenv".to_string(),
            mongodb_path: "/opt/mongodb".to_string(),
            ..StatusRecord::default()
        }
    }

    fn ordered_positions(script: &str, needles: &[&str]) -> Vec<usize> {
        needles
            .iter()
            .map(|n| script.find(n).unwrap_or_else(|| panic!("missing: {n}")))
            .collect()
    }

    #[test]
    fn test_startup_ordering_contract_shell() {
        let script = render_startup(&test_record(), &Config::default(), ScriptFlavor::Shell).unwrap();

        let positions = ordered_positions(
            &script,
            &[
                "bin/mongod",
                "panda_factor_server/panda_factor_server/__main__.py",
                "xdg-open",
            ],
        );
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "stack must start in order");
    }

    #[test]
    fn test_startup_ordering_contract_batch() {
        let script = render_startup(&test_record(), &Config::default(), ScriptFlavor::Batch).unwrap();

        let positions = ordered_positions(
            &script,
            &[
                "bin\\mongod.exe",
                "panda_factor_server/panda_factor_server/__main__.py",
                "Step 4: open browser",
            ],
        );
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "stack must start in order");
    }

    #[test]
    fn test_startup_interpolates_configuration() {
        let mut config = Config::default();
        config.stack.mongo_port = 29999;
        let script = render_startup(&test_record(), &config, ScriptFlavor::Shell).unwrap();

        assert!(script.contains("conda run -n stackenv"));
        assert!(script.contains("--port 29999"));
        assert!(script.contains("/opt/mongodb"));
        // No handlebars placeholders survive rendering
        assert!(!script.contains("{{"));
    }

    #[test]
    fn test_startup_without_mongodb_skips_database() {
        let record = StatusRecord {
            mongodb_path: String::new(),
            ..test_record()
        };
        let script = render_startup(&record, &Config::default(), ScriptFlavor::Shell).unwrap();
        assert!(!script.contains("bin/mongod"));
        assert!(script.contains("skipping database startup"));
    }

    #[test]
    fn test_env_shell_activates_environment() {
        let script =
            render_env_shell(&test_record(), &Config::default(), ScriptFlavor::Shell).unwrap();
        assert!(script.contains("conda activate stackenv"));
        assert!(script.contains("PYTHONPATH"));
    }

    #[test]
    fn test_paths_are_not_html_escaped() {
        let record = StatusRecord {
            project_path: "/opt/my stack/x&y".to_string(),
            ..test_record()
        };
        let script = render_startup(&record, &Config::default(), ScriptFlavor::Shell).unwrap();
        assert!(script.contains("/opt/my stack/x&y/panda_factor"));
        assert!(!script.contains("&amp;"));
    }

    #[test]
    fn test_write_launch_scripts() {
        let dir = tempfile::TempDir::new().unwrap();
        let record = StatusRecord {
            project_path: dir.path().to_string_lossy().to_string(),
            ..test_record()
        };

        let written = write_launch_scripts(&record, &Config::default()).unwrap();
        assert_eq!(written.len(), 2);
        for path in &written {
            assert!(path.exists());
        }
    }
}
