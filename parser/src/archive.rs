//! Archive-wide aggregation.
//!
//! Every capture in the data directory is decoded on a worker pool and its
//! players are folded into one map keyed by resolved display name. Entity ids
//! are not stable between captures, so the name is the only cross-capture
//! identity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::analyzer::aggregator::process_capture_with;
use crate::config::ArchiveConfig;
use crate::decoder::{CaptureDecoder, StreamingDecoder};
use crate::error::{Result, StatsError};
use crate::pool::WorkerPool;
use crate::types::{PlayerStats, PlayerTally, sort_by_kills};

pub const CAPTURE_EXTENSION: &str = "gz";

const PROGRESS_INTERVAL: usize = 100;

/// List the capture files in `config.data_dir`, minus blacklisted ones,
/// sorted by path. Subdirectories are not searched.
pub fn discover_captures(config: &ArchiveConfig) -> Result<Vec<PathBuf>> {
    let dir = &config.data_dir;
    let enumeration_error = |source| StatsError::DirectoryEnumeration {
        path: dir.clone(),
        source,
    };

    let mut captures = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(enumeration_error)? {
        let path = entry.map_err(enumeration_error)?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(CAPTURE_EXTENSION)
            || !path.is_file()
        {
            continue;
        }
        let Some(name) = capture_name(&path) else {
            continue;
        };
        if config.is_excluded(name) {
            debug!("skipping blacklisted capture {name}");
            continue;
        }
        captures.push(path);
    }

    captures.sort();
    Ok(captures)
}

/// File name without the `.gz` extension.
pub fn capture_name(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|stem| stem.to_str())
}

/// Shared name-keyed merge target. Workers hold the lock only while folding
/// in a finished capture.
///
/// Counters are summed, so the totals do not depend on merge order. The id and
/// side of a merged record come from the earliest capture (by archive order)
/// that contains the name, whatever order the captures finish in.
#[derive(Debug, Default)]
pub struct ArchiveMerge {
    players: Mutex<BTreeMap<String, (usize, PlayerTally)>>,
}

impl ArchiveMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the players of the capture at position `order` in the archive.
    pub fn merge_capture(&self, order: usize, players: &[PlayerStats]) {
        let mut merged = self.players.lock().unwrap_or_else(PoisonError::into_inner);
        for player in players {
            match merged.get_mut(&player.name) {
                Some((origin, tally)) => {
                    if order < *origin {
                        *origin = order;
                        tally.adopt_identity(player);
                    }
                    tally.absorb(player);
                }
                None => {
                    merged.insert(player.name.clone(), (order, PlayerTally::from_stats(player)));
                }
            }
        }
    }

    /// Merged statistics, most kills first; ties ordered by name.
    pub fn into_stats(self) -> Vec<PlayerStats> {
        let merged = self.players.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<PlayerStats> = merged
            .into_values()
            .map(|(_, tally)| tally.into_stats())
            .collect();
        sort_by_kills(&mut stats);
        stats
    }
}

/// Single-threaded merge of already computed per-capture results, given in
/// archive order.
pub fn merge_stats<I>(captures: I) -> Vec<PlayerStats>
where
    I: IntoIterator,
    I::Item: AsRef<[PlayerStats]>,
{
    let merge = ArchiveMerge::new();
    for (order, players) in captures.into_iter().enumerate() {
        merge.merge_capture(order, players.as_ref());
    }
    merge.into_stats()
}

/// Decodes every capture of an archive and merges the results.
pub struct ArchivePipeline {
    config: ArchiveConfig,
    decoder: Arc<dyn CaptureDecoder>,
}

impl ArchivePipeline {
    pub fn new(config: ArchiveConfig) -> Self {
        Self::with_decoder(config, Arc::new(StreamingDecoder))
    }

    pub fn with_decoder(config: ArchiveConfig, decoder: Arc<dyn CaptureDecoder>) -> Self {
        Self { config, decoder }
    }

    /// Process the whole archive. Captures that cannot be read are logged and
    /// left out; only a failure to list the directory is an error.
    pub fn run(&self) -> Result<Vec<PlayerStats>> {
        let captures = discover_captures(&self.config)?;
        let pool = WorkerPool::new(self.config.worker_count())?;
        let total = captures.len();
        info!(
            "processing {total} capture files using {} workers",
            pool.limit()
        );

        let merge = ArchiveMerge::new();
        let processed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        let ordered: Vec<(usize, &PathBuf)> = captures.iter().enumerate().collect();
        pool.for_each(&ordered, |&(order, path)| {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            match process_capture_with(self.decoder.as_ref(), path) {
                Ok(players) => {
                    debug!("{name}: {} players", players.len());
                    merge.merge_capture(order, &players);
                }
                Err(err) => {
                    warn!("error processing {name}: {}", error_chain(&err));
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }

            let n = processed.fetch_add(1, Ordering::Relaxed) + 1;
            if n % PROGRESS_INTERVAL == 0 || n == total {
                info!("processed {n}/{total} files");
            }
        });

        let failed = failed.into_inner();
        if failed > 0 {
            warn!("{failed} of {total} capture files could not be processed");
        }

        Ok(merge.into_stats())
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
