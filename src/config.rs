use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tool-level settings: where state lives, how the stack is reached, logging.
///
/// Operator-supplied deployment values (install path, conda env, repo URLs)
/// are not configuration — they live in the status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory for the status file, logs, and generated session scripts
    #[serde(default = "default_state_dir")]
    pub state: String,
}

fn default_state_dir() -> String {
    ".stackup".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Factor web UI, also the health-check endpoint
    #[serde(default = "default_factor_url")]
    pub factor_url: String,
    #[serde(default = "default_quantflow_url")]
    pub quantflow_url: String,
    #[serde(default = "default_mongo_port")]
    pub mongo_port: u16,
    /// Seconds before the health probe gives up
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Python version requested when the conda env is created
    #[serde(default = "default_python_version")]
    pub python_version: String,
}

fn default_factor_url() -> String {
    "http://localhost:8111".to_string()
}

fn default_quantflow_url() -> String {
    "http://127.0.0.1:8000/quantflow/".to_string()
}

fn default_mongo_port() -> u16 {
    27017
}

fn default_health_timeout() -> u64 {
    3
}

fn default_python_version() -> String {
    "3.12".to_string()
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            factor_url: default_factor_url(),
            quantflow_url: default_quantflow_url(),
            mongo_port: default_mongo_port(),
            health_timeout_secs: default_health_timeout(),
            python_version: default_python_version(),
        }
    }
}

impl StackConfig {
    /// The quantflow charts UI, served next to the workflow UI.
    pub fn charts_url(&self) -> String {
        match self.quantflow_url.strip_suffix("quantflow/") {
            Some(base) => format!("{base}charts/"),
            None => self.quantflow_url.clone(),
        }
    }

    /// The factor data-maintenance page.
    pub fn data_update_url(&self) -> String {
        format!("{}/factor/#/datahubdataclean", self.factor_url)
    }

    /// The factor data-listing page.
    pub fn data_list_url(&self) -> String {
        format!("{}/factor/#/datahublist", self.factor_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to a file under the state directory (false = stderr)
    #[serde(default = "default_log_to_file")]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_to_file() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: default_log_to_file(),
        }
    }
}

impl Config {
    /// Path to the project-local config file within the state directory.
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".stackup/config.toml")
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Start with embedded defaults so stackup works without config files
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        // Project config in .stackup/ (primary config location)
        let project_config = Self::project_config_path();
        if project_config.exists() {
            builder = builder.add_source(config::File::from(project_config));
        }

        // User config in ~/.config/stackup/ (optional global overrides)
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("stackup").join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        // Explicit config file (CLI override)
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with STACKUP_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("STACKUP")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Save config to .stackup/config.toml
    pub fn save(&self) -> Result<()> {
        let config_path = Self::project_config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, toml_str).context("Failed to write config file")?;

        Ok(())
    }

    /// Get absolute path to the state directory
    pub fn state_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.paths.state);
        if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }

    /// Get path to the status file
    pub fn status_file_path(&self) -> PathBuf {
        self.state_path().join("status.json")
    }

    /// Get absolute path to the logs directory
    pub fn logs_path(&self) -> PathBuf {
        self.state_path().join("logs")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            stack: StackConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
