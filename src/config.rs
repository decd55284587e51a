//! Tunables for formatting and running a filesystem session.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Options supplied when formatting or opening a filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FsOptions {
    /// Size of every tree block in bytes.
    pub nodesize: u32,
    /// Minimum allocation unit for data extents.
    pub sectorsize: u32,
    /// Size of the system chunk created at format time.
    pub system_chunk_size: u64,
    /// Preferred size of each metadata chunk.
    pub metadata_chunk_size: u64,
    /// Preferred size of each data chunk.
    pub data_chunk_size: u64,
    /// Upper bound on commit passes before the pipeline declares that delayed
    /// references failed to converge.
    pub max_commit_passes: u32,
    /// Data heads holding more nodes than this skip the pre-run merge pass.
    pub data_merge_limit: usize,
    /// Number of superblock copies to maintain (1..=3).
    pub super_mirrors: u32,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            nodesize: 16 * KIB as u32,
            sectorsize: 4 * KIB as u32,
            system_chunk_size: 4 * MIB,
            metadata_chunk_size: 256 * MIB,
            data_chunk_size: 1024 * MIB,
            max_commit_passes: 32,
            data_merge_limit: 64,
            super_mirrors: 3,
        }
    }
}

impl FsOptions {
    /// Sets the tree block size.
    pub fn nodesize(mut self, bytes: u32) -> Self {
        self.nodesize = bytes;
        self
    }

    /// Sets the data sector size.
    pub fn sectorsize(mut self, bytes: u32) -> Self {
        self.sectorsize = bytes;
        self
    }

    /// Sets the system chunk size used at format time.
    pub fn system_chunk_size(mut self, bytes: u64) -> Self {
        self.system_chunk_size = bytes;
        self
    }

    /// Sets the preferred metadata chunk size.
    pub fn metadata_chunk_size(mut self, bytes: u64) -> Self {
        self.metadata_chunk_size = bytes;
        self
    }

    /// Sets the preferred data chunk size.
    pub fn data_chunk_size(mut self, bytes: u64) -> Self {
        self.data_chunk_size = bytes;
        self
    }

    /// Sets the commit convergence bound.
    pub fn max_commit_passes(mut self, passes: u32) -> Self {
        self.max_commit_passes = passes;
        self
    }

    /// Sets the data-head merge threshold.
    pub fn data_merge_limit(mut self, nodes: usize) -> Self {
        self.data_merge_limit = nodes;
        self
    }

    /// Sets how many superblock copies are written.
    pub fn super_mirrors(mut self, copies: u32) -> Self {
        self.super_mirrors = copies;
        self
    }

    /// Parses options from TOML text; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: FsOptions =
            toml::from_str(text).map_err(|source| ConfigError::ParseStr { source })?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: FsOptions = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sectorsize.is_power_of_two() || self.sectorsize < 4096 {
            return Err(ConfigError::Invalid {
                field: "sectorsize",
                reason: format!("{} is not a power of two >= 4096", self.sectorsize),
            });
        }
        if !self.nodesize.is_power_of_two()
            || self.nodesize < self.sectorsize
            || self.nodesize > 64 * KIB as u32
        {
            return Err(ConfigError::Invalid {
                field: "nodesize",
                reason: format!(
                    "{} must be a power of two between sectorsize and 64KiB",
                    self.nodesize
                ),
            });
        }
        let nodesize = u64::from(self.nodesize);
        for (field, value) in [
            ("system_chunk_size", self.system_chunk_size),
            ("metadata_chunk_size", self.metadata_chunk_size),
        ] {
            if value < nodesize || value % nodesize != 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is not a non-zero multiple of nodesize"),
                });
            }
        }
        if self.data_chunk_size < u64::from(self.sectorsize)
            || self.data_chunk_size % u64::from(self.sectorsize) != 0
        {
            return Err(ConfigError::Invalid {
                field: "data_chunk_size",
                reason: format!(
                    "{} is not a non-zero multiple of sectorsize",
                    self.data_chunk_size
                ),
            });
        }
        if self.max_commit_passes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_commit_passes",
                reason: "must be at least 1".into(),
            });
        }
        if !(1..=3).contains(&self.super_mirrors) {
            return Err(ConfigError::Invalid {
                field: "super_mirrors",
                reason: format!("{} is outside 1..=3", self.super_mirrors),
            });
        }
        Ok(())
    }
}

/// Errors raised while loading [`FsOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The config file is not valid TOML for these options.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Inline TOML text is not valid for these options.
    #[error("failed to parse config: {source}")]
    ParseStr {
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value parsed but violates a constraint.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}
