pub mod analyzer;
pub mod archive;
pub mod cache;
pub mod config;
pub mod decoder;
mod error;
pub mod pool;
pub mod query;
pub mod types;

pub use analyzer::aggregator::{CaptureAggregator, process_capture, process_capture_with};
pub use archive::{ArchivePipeline, merge_stats};
pub use cache::{ArchiveAggregate, CacheStatus, StatsCache, StatsSource};
pub use config::ArchiveConfig;
pub use decoder::{BufferedDecoder, CaptureDecoder, StreamingDecoder};
pub use error::*;
pub use query::{StatsService, to_pretty_json};
pub use types::{EntityId, PlayerStats, WeaponStat};
