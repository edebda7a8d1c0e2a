use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pool::available_workers;

/// Where captures live and which of them to leave out, loadable from a TOML
/// file.
///
/// All fields default to their standard values. CLI flags override config file values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding the `.gz` capture files.
    pub data_dir: PathBuf,
    /// File name fragments to exclude, matched case-insensitively against the
    /// name without its `.gz` extension.
    pub blacklist: Vec<String>,
    /// Worker count for archive builds. Defaults to the processor count.
    pub workers: Option<usize>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            blacklist: Vec::new(),
            workers: None,
        }
    }
}

#[cfg(feature = "toml")]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ArchiveConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_blacklist<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = fragments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(available_workers).max(1)
    }

    /// Whether a capture name (without `.gz`) matches any blacklist fragment.
    pub fn is_excluded(&self, capture_name: &str) -> bool {
        let name = capture_name.to_lowercase();
        self.blacklist
            .iter()
            .any(|fragment| name.contains(&fragment.to_lowercase()))
    }

    /// Load config from a TOML file.
    #[cfg(feature = "toml")]
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Generate a commented default TOML config string.
    pub fn generate_default_toml() -> String {
        r#"# Capture statistics configuration
# Pass with --config <path>.

# Directory containing gzip-compressed capture files (*.gz)
data_dir = "data"

# Capture name fragments to skip (case-insensitive substring match against
# the file name without .gz)
blacklist = []

# Number of capture files decoded in parallel. Defaults to the processor count.
# workers = 8
"#
        .to_string()
    }
}
