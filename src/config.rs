use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::app::ReconcileSettings;
use crate::error::{ReconcileError, Result};
use crate::pipeline::processing::registry::RegistryConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "BIOKG_CONFIG";
pub const OUTPUT_DIR_ENV: &str = "BIOKG_OUTPUT_DIR";
pub const BATCH_SIZE_ENV: &str = "BIOKG_BATCH_SIZE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reconcile: ReconcileConfig,
    pub output: OutputConfig,
    pub input: InputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub batch_size: usize,
    /// 0 sizes the pool to the machine
    pub worker_threads: usize,
    pub contest_fuzzy_ties: bool,
    pub dry_run: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            worker_threads: 0,
            contest_fuzzy_ties: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root for run directories and the persisted entity store
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// JSON file of reference aliases consulted after normalization fails
    pub aliases_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub default_directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "biokg-reconcile.log".to_string(),
            default_directive: "biokg_reconcile=info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration. The path is, in order: the argument, `BIOKG_CONFIG`,
    /// `config.toml`. A missing default file yields defaults; a missing file
    /// that was asked for explicitly is an error. Environment overrides are
    /// applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
        let config_path = explicit.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let config = match fs::read_to_string(&config_path) {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                debug!("No {} found, using defaults", config_path.display());
                Self::default()
            }
            Err(e) => {
                return Err(ReconcileError::Config(format!(
                    "Failed to read config file '{}': {}",
                    config_path.display(),
                    e
                )))
            }
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BIOKG_OUTPUT_DIR` and `BIOKG_BATCH_SIZE` style overrides from
    /// `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup(OUTPUT_DIR_ENV) {
            self.output.dir = PathBuf::from(dir);
        }
        if let Some(batch_size) = lookup(BATCH_SIZE_ENV) {
            self.reconcile.batch_size = batch_size.trim().parse().map_err(|e| {
                ReconcileError::Config(format!("{} must be a positive integer: {}", BATCH_SIZE_ENV, e))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.reconcile.batch_size == 0 {
            return Err(ReconcileError::Config("reconcile.batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn store_dir(&self) -> PathBuf {
        self.output.dir.join("store")
    }

    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            batch_size: self.reconcile.batch_size,
            worker_threads: self.reconcile.worker_threads,
            registry: RegistryConfig {
                contest_fuzzy_ties: self.reconcile.contest_fuzzy_ties,
            },
            dry_run: self.reconcile.dry_run,
        }
    }
}
