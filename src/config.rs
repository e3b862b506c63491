//! Run configuration
//!
//! A run is described by a TOML file:
//!
//! ```toml
//! [input]
//! path = "data/cdata.csv"
//!
//! [domain]
//! xmin = -300
//! xmax = 300
//! ymin = -300
//! ymax = 300
//! dx = 1
//! dy = 1
//!
//! [output]
//! directory = "results"
//!
//! [workers]
//! count = 4
//!
//! [compression]
//! level = 6
//! ```
//!
//! Relative paths are resolved against the directory containing the configuration file.

use ffp_core::compression::DEFAULT_LEVEL;
use ffp_core::errors::{FfpError, FfpResult};
use ffp_core::grid::GridSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    /// CSV table of meteorological records
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Directory receiving the batch volumes, created if needed
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Number of worker processes
    #[serde(default = "default_workers")]
    pub count: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    /// gzip compression level, 0 to 9
    #[serde(default = "default_level")]
    pub level: u32,
}

fn default_level() -> u32 {
    DEFAULT_LEVEL
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Everything a run needs, passed explicitly to each stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub input: InputConfig,
    pub domain: GridSpec,
    pub output: OutputConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> FfpResult<Self> {
        let config: RunConfig =
            toml::from_str(text).map_err(|e| FfpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file, resolving relative paths against its directory
    pub fn from_file(path: &Path) -> FfpResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| FfpError::io(path, e))?;
        let config = Self::from_toml_str(&text).map_err(|e| match e {
            FfpError::Config(msg) => FfpError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Ok(config.relative_to(base))
    }

    fn validate(&self) -> FfpResult<()> {
        if self.workers.count == 0 {
            return Err(FfpError::Config(
                "workers.count must be at least 1".to_string(),
            ));
        }
        if self.compression.level > 9 {
            return Err(FfpError::Config(format!(
                "compression.level must be between 0 and 9, got {}",
                self.compression.level
            )));
        }
        Ok(())
    }

    fn relative_to(mut self, base: &Path) -> Self {
        if self.input.path.is_relative() {
            self.input.path = base.join(&self.input.path);
        }
        if self.output.directory.is_relative() {
            self.output.directory = base.join(&self.output.directory);
        }
        self
    }
}
