//! TOML configuration for the `salvage` tool.
//!
//! When no config file is given, `salvage.toml` in the user config
//! directory is used if it exists, otherwise every section takes its
//! defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use salvage_source::{BATCH_FETCH_LIMIT, InstallSourceConfig};
use salvage_types::ChunkId;
use serde::Deserialize;

/// Bounds for the in-memory install store, in chunks.
const STORE_SIZE_MIN: usize = 32;
const STORE_SIZE_MAX: usize = 2048;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Batch planning for the install source.
    pub install_source: InstallSourceSection,
    /// Install chunk store sizing and overflow.
    pub store: StoreSection,
    /// Target and installed build manifests.
    pub builds: BuildsSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[install_source]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InstallSourceSection {
    /// Fewest chunks a batch asks for.
    pub batch_fetch_minimum: Option<usize>,
    /// Most chunks a batch asks for.
    pub batch_fetch_maximum: Option<usize>,
    /// Hex chunk ids to leave to other sources unless requested at runtime.
    pub ignore: Vec<String>,
}

/// `[store]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Chunks held in memory. Defaults to the batch maximum.
    pub memory_chunks: Option<usize>,
    /// Directory for chunks booted out of memory. Booted chunks are
    /// dropped and reloaded on demand when unset.
    pub overflow_dir: Option<PathBuf>,
}

/// `[builds]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BuildsSection {
    /// Manifest of the build being installed.
    pub target: Option<PathBuf>,
    /// Target files to construct. Empty means every file.
    pub files: Vec<PathBuf>,
    /// Previously installed builds to recycle from.
    pub installed: Vec<InstalledSection>,
}

/// One `[[builds.installed]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstalledSection {
    /// Directory the build is installed in.
    pub root: PathBuf,
    /// Manifest the build was installed from.
    pub manifest: PathBuf,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, falling back to the per-user file and
    /// then to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: CliConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective batch minimum, in `[1, 1000]`. Defaults to 10.
    pub fn batch_fetch_minimum(&self) -> usize {
        self.install_source
            .batch_fetch_minimum
            .unwrap_or(10)
            .clamp(1, BATCH_FETCH_LIMIT)
    }

    /// Effective batch maximum, in `[minimum, 1000]`. Defaults to 40.
    pub fn batch_fetch_maximum(&self) -> usize {
        self.install_source
            .batch_fetch_maximum
            .unwrap_or(40)
            .clamp(self.batch_fetch_minimum(), BATCH_FETCH_LIMIT)
    }

    /// Effective in-memory store size, in `[32, 2048]`. Defaults to the
    /// batch maximum.
    pub fn memory_chunks(&self) -> usize {
        self.store
            .memory_chunks
            .unwrap_or_else(|| self.batch_fetch_maximum())
            .clamp(STORE_SIZE_MIN, STORE_SIZE_MAX)
    }

    /// Library-side install source tuning.
    pub fn install_source_config(&self) -> anyhow::Result<InstallSourceConfig> {
        let chunk_ignore_set = self
            .install_source
            .ignore
            .iter()
            .map(|s| {
                s.parse::<ChunkId>()
                    .with_context(|| format!("invalid chunk id in ignore list: {s}"))
            })
            .collect::<anyhow::Result<HashSet<_>>>()?;
        Ok(InstallSourceConfig {
            batch_fetch_minimum: self.batch_fetch_minimum(),
            batch_fetch_maximum: self.batch_fetch_maximum(),
            chunk_ignore_set,
        })
    }
}

/// `<config dir>/salvage/salvage.toml`, if the platform has a config dir.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("salvage").join("salvage.toml"))
}
