//! Read operations offered to the HTTP layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::analyzer::aggregator::process_capture_with;
use crate::archive::{ArchivePipeline, CAPTURE_EXTENSION};
use crate::cache::{StatsCache, StatsSource};
use crate::config::ArchiveConfig;
use crate::decoder::{CaptureDecoder, StreamingDecoder};
use crate::error::{CacheError, Result};
use crate::types::PlayerStats;

/// Archive-wide lookups go through the cache; single-capture lookups decode
/// the file directly and are not cached.
pub struct StatsService {
    data_dir: PathBuf,
    decoder: Arc<dyn CaptureDecoder>,
    cache: Arc<StatsCache>,
}

impl StatsService {
    pub fn new(config: ArchiveConfig) -> Self {
        Self::with_decoder(config, Arc::new(StreamingDecoder))
    }

    pub fn with_decoder(config: ArchiveConfig, decoder: Arc<dyn CaptureDecoder>) -> Self {
        let data_dir = config.data_dir.clone();
        let pipeline = ArchivePipeline::with_decoder(config, Arc::clone(&decoder));
        Self::with_source(data_dir, decoder, pipeline)
    }

    /// Serve archive queries from an arbitrary source.
    pub fn with_source(
        data_dir: impl Into<PathBuf>,
        decoder: Arc<dyn CaptureDecoder>,
        source: impl StatsSource + 'static,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            decoder,
            cache: Arc::new(StatsCache::with_source(source)),
        }
    }

    pub fn cache(&self) -> &Arc<StatsCache> {
        &self.cache
    }

    pub fn get_all_stats(&self) -> std::result::Result<Vec<PlayerStats>, CacheError> {
        Ok(self.cache.get_all()?.players().to_vec())
    }

    pub fn get_stats_by_name(
        &self,
        name: &str,
    ) -> std::result::Result<Option<PlayerStats>, CacheError> {
        self.cache.get_by_name(name)
    }

    pub fn get_all_stats_within(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Vec<PlayerStats>, CacheError> {
        Ok(self.cache.get_all_within(timeout)?.players().to_vec())
    }

    pub fn get_stats_by_name_within(
        &self,
        name: &str,
        timeout: Duration,
    ) -> std::result::Result<Option<PlayerStats>, CacheError> {
        self.cache.get_by_name_within(name, timeout)
    }

    /// Per-player statistics for one capture, given its name without `.gz`.
    /// Returns `Ok(None)` if there is no such capture.
    pub fn get_stats_for_capture(&self, name: &str) -> Result<Option<Vec<PlayerStats>>> {
        let Some(path) = self.capture_path(name) else {
            return Ok(None);
        };
        if !path.is_file() {
            debug!("capture {} not found", path.display());
            return Ok(None);
        }
        process_capture_with(self.decoder.as_ref(), &path).map(Some)
    }

    /// Only the final path component of `name` is used, so lookups cannot
    /// leave the data directory.
    fn capture_path(&self, name: &str) -> Option<PathBuf> {
        let file_name = format!("{name}.{CAPTURE_EXTENSION}");
        let file_name = Path::new(&file_name).file_name()?;
        Some(self.data_dir.join(file_name))
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }
}

/// Tab-indented JSON, the way query responses are rendered.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    String::from_utf8(out).map_err(serde::ser::Error::custom)
}
