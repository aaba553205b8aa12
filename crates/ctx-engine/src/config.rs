use anyhow::{Context, Result};
use ctx_mind::{CircuitConfig, SchedulerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_HEALTH_ADDR: &str = "127.0.0.1:7461";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub health_addr: String,
    /// Durable hot revisions kept after each commit.
    pub revision_retention: usize,
    pub scheduler: SchedulerConfig,
    pub circuit: CircuitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_dir: None,
            log_level: None,
            health_addr: DEFAULT_HEALTH_ADDR.to_string(),
            revision_retention: 50,
            scheduler: SchedulerConfig::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

/// Command-line values that take precedence over the file and environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub health_addr: Option<String>,
    pub learning_mode: bool,
}

impl EngineConfig {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid engine config")
    }

    /// File, then `CTX_*` environment, then flags. A missing file means
    /// defaults.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::parse(&contents)?
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.apply_overrides(overrides);
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(value) = non_empty("CTX_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = non_empty("CTX_LOG_LEVEL") {
            self.log_level = Some(value);
        }
        if let Some(value) = non_empty("CTX_HEALTH_ADDR") {
            self.health_addr = value;
        }
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = Some(dir.clone());
        }
        if let Some(dir) = &overrides.log_dir {
            self.log_dir = Some(dir.clone());
        }
        if let Some(addr) = &overrides.health_addr {
            self.health_addr = addr.clone();
        }
        if overrides.learning_mode {
            self.scheduler.learning_mode = true;
        }
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ctx-engine")
}
