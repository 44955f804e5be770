//! # Configuration
//!
//! Optional `buildscope.toml`. CLI flags override the file, and the file
//! overrides built-in defaults.
//!
//! ```toml
//! database = "build.bscp"
//! log_format = "json"
//! log_filter = "buildscope=debug"
//! ```

use crate::cli::CliError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "buildscope.toml";

/// Default workspace file.
pub const DEFAULT_DATABASE: &str = "buildscope.bscp";

/// Default tracing filter.
pub const DEFAULT_LOG_FILTER: &str = "buildscope=info,buildscope_core=info";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Workspace file path.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// `text` or `json`.
    #[serde(default)]
    pub log_format: Option<String>,

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_filter: Option<String>,
}

impl Config {
    /// Load `explicit` if given, else `./buildscope.toml` if it exists, else
    /// defaults. An explicit file that is missing is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, CliError> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        let local = Path::new(CONFIG_FILE_NAME);
        if local.is_file() {
            return Self::load_from_path(local);
        }
        Ok(Self::default())
    }

    /// Load config from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE))
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Whether JSON logs were requested. The environment variable wins.
    pub fn json_logs(&self, env_format: Option<&str>) -> bool {
        env_format.or(self.log_format.as_deref()) == Some("json")
    }
}
