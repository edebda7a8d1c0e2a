//! Lazily built, invalidatable archive statistics.
//!
//! The aggregate is built on the first read after construction or
//! invalidation, under the write lock, with a second readiness check once the
//! lock is held so concurrent readers trigger at most one build. Published
//! aggregates are immutable and reference counted: invalidation only drops the
//! cache's handle, never one a reader already holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{Level, info, span, warn};

use crate::archive::ArchivePipeline;
use crate::config::ArchiveConfig;
use crate::error::{CacheError, Result, StatsError};
use crate::types::PlayerStats;

/// Produces the archive-wide statistics the cache serves.
pub trait StatsSource: Send + Sync {
    fn load(&self) -> Result<Vec<PlayerStats>>;
}

impl StatsSource for ArchivePipeline {
    fn load(&self) -> Result<Vec<PlayerStats>> {
        self.run()
    }
}

/// Merged statistics plus a lowercase name index.
#[derive(Debug, Clone, Default)]
pub struct ArchiveAggregate {
    players: Vec<PlayerStats>,
    by_name: HashMap<String, usize>,
}

impl ArchiveAggregate {
    pub fn new(players: Vec<PlayerStats>) -> Self {
        let mut by_name = HashMap::with_capacity(players.len());
        for (index, player) in players.iter().enumerate() {
            // Names differing only in case share a key; the higher ranked keeps it.
            by_name.entry(player.name.to_lowercase()).or_insert(index);
        }
        Self { players, by_name }
    }

    /// All players, most kills first.
    pub fn players(&self) -> &[PlayerStats] {
        &self.players
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Case-insensitive lookup. An exact name match wins; otherwise the
    /// shortest name containing the query, then the alphabetically first.
    pub fn find(&self, query: &str) -> Option<&PlayerStats> {
        let query = query.to_lowercase();
        if let Some(&index) = self.by_name.get(&query) {
            return Some(&self.players[index]);
        }

        self.by_name
            .iter()
            .filter(|(name, _)| name.contains(&query))
            .min_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
            .map(|(_, &index)| &self.players[index])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Never built, invalidated, or the last build failed.
    Empty,
    Building,
    Ready,
}

enum Slot {
    Empty,
    Ready(Arc<ArchiveAggregate>),
    Failed { attempt: u64, error: Arc<StatsError> },
}

/// Clears the in-flight flag even if the source panics.
struct BuildingFlag<'a>(&'a AtomicBool);

impl<'a> BuildingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BuildingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct StatsCache {
    source: Box<dyn StatsSource>,
    slot: RwLock<Slot>,
    building: AtomicBool,
    /// Build attempts started so far; also the number of the latest attempt.
    attempts: AtomicU64,
}

impl StatsCache {
    /// Cache over the captures described by `config`.
    pub fn new(config: ArchiveConfig) -> Self {
        Self::with_source(ArchivePipeline::new(config))
    }

    pub fn with_source(source: impl StatsSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            slot: RwLock::new(Slot::Empty),
            building: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of builds started since construction.
    pub fn builds(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> CacheStatus {
        if self.building.load(Ordering::SeqCst) {
            return CacheStatus::Building;
        }
        match *self.read() {
            Slot::Ready(_) => CacheStatus::Ready,
            Slot::Empty | Slot::Failed { .. } => CacheStatus::Empty,
        }
    }

    fn ensure_ready(&self) -> std::result::Result<Arc<ArchiveAggregate>, CacheError> {
        // Oldest attempt whose failure this caller should report rather than
        // retry: the one in flight now, or the next one.
        let in_flight = self.building.load(Ordering::SeqCst);
        let started = self.attempts.load(Ordering::SeqCst);
        let awaited = if in_flight { started } else { started + 1 };

        if let Slot::Ready(aggregate) = &*self.read() {
            return Ok(Arc::clone(aggregate));
        }

        let mut slot = self.write();
        match &*slot {
            Slot::Ready(aggregate) => return Ok(Arc::clone(aggregate)),
            Slot::Failed { attempt, error } if *attempt >= awaited => {
                return Err(CacheError::Build(Arc::clone(error)));
            }
            Slot::Empty | Slot::Failed { .. } => {}
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let _building = BuildingFlag::raise(&self.building);
        let _span = span!(Level::INFO, "build_cache", attempt).entered();
        info!("building cache...");
        let start = Instant::now();

        match self.source.load() {
            Ok(players) => {
                let aggregate = Arc::new(ArchiveAggregate::new(players));
                info!(
                    "cache built in {:?} with {} unique players",
                    start.elapsed(),
                    aggregate.len()
                );
                *slot = Slot::Ready(Arc::clone(&aggregate));
                Ok(aggregate)
            }
            Err(err) => {
                warn!("cache build failed after {:?}: {err}", start.elapsed());
                let error = Arc::new(err);
                *slot = Slot::Failed {
                    attempt,
                    error: Arc::clone(&error),
                };
                Err(CacheError::Build(error))
            }
        }
    }

    /// The full archive aggregate, building it first if needed.
    pub fn get_all(&self) -> std::result::Result<Arc<ArchiveAggregate>, CacheError> {
        self.ensure_ready()
    }

    /// Look up one player by name. See [`ArchiveAggregate::find`].
    pub fn get_by_name(&self, query: &str) -> std::result::Result<Option<PlayerStats>, CacheError> {
        Ok(self.ensure_ready()?.find(query).cloned())
    }

    /// Drop the current aggregate so the next read rebuilds it.
    pub fn invalidate(&self) {
        *self.write() = Slot::Empty;
        info!("cache invalidated");
    }

    /// [`StatsCache::get_all`] with a deadline. Giving up does not stop a build
    /// that is already running.
    pub fn get_all_within(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> std::result::Result<Arc<ArchiveAggregate>, CacheError> {
        let cache = Arc::clone(self);
        wait_for(timeout, move || cache.get_all())
    }

    pub fn get_by_name_within(
        self: &Arc<Self>,
        query: &str,
        timeout: Duration,
    ) -> std::result::Result<Option<PlayerStats>, CacheError> {
        let cache = Arc::clone(self);
        let query = query.to_string();
        wait_for(timeout, move || cache.get_by_name(&query))
    }
}

/// Run `f` on a helper thread and wait at most `timeout` for its result.
fn wait_for<T, F>(timeout: Duration, f: F) -> std::result::Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, CacheError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("stats-cache-wait".to_string())
        .spawn(move || {
            // Ignore send errors (the caller may have given up)
            let _ = tx.send(f());
        })
        .map_err(|_| CacheError::Abandoned)?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(CacheError::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(CacheError::Abandoned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, WeaponStat};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{Receiver, Sender};
    use std::sync::{Barrier, Mutex};

    fn player(name: &str, kills: u32) -> PlayerStats {
        PlayerStats {
            id: EntityId(1),
            name: name.to_string(),
            side: "WEST".to_string(),
            kill_count: kills,
            death_count: 0,
            team_kill_count: 0,
            weapon_stats: if kills > 0 {
                vec![WeaponStat { weapon: "Rifle".into(), kills }]
            } else {
                Vec::new()
            },
        }
    }

    fn roster() -> Vec<PlayerStats> {
        vec![
            player("Bobby", 5),
            player("Bob", 3),
            player("Alice", 2),
            player("Robert", 1),
        ]
    }

    fn failure() -> StatsError {
        StatsError::DirectoryEnumeration {
            path: "missing".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        }
    }

    struct CountingSource {
        players: Vec<PlayerStats>,
        calls: AtomicUsize,
        failures_left: AtomicUsize,
        delay: Duration,
    }

    impl CountingSource {
        fn new(players: Vec<PlayerStats>) -> Self {
            Self {
                players,
                calls: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    impl StatsSource for Arc<CountingSource> {
        fn load(&self) -> Result<Vec<PlayerStats>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(failure())
            } else {
                Ok(self.players.clone())
            }
        }
    }

    /// Blocks inside `load` until released, so tests can act mid-build.
    struct GatedSource {
        started: Mutex<Sender<()>>,
        release: Mutex<Receiver<bool>>,
        calls: AtomicUsize,
    }

    impl StatsSource for Arc<GatedSource> {
        fn load(&self) -> Result<Vec<PlayerStats>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.lock().unwrap().send(());
            let succeed = self.release.lock().unwrap().recv().unwrap_or(false);
            if succeed { Ok(roster()) } else { Err(failure()) }
        }
    }

    fn gated() -> (Arc<GatedSource>, Receiver<()>, Sender<bool>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let source = Arc::new(GatedSource {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
            calls: AtomicUsize::new(0),
        });
        (source, started_rx, release_tx)
    }

    #[test]
    fn exact_match_beats_substring() {
        let aggregate = ArchiveAggregate::new(roster());
        assert_eq!(aggregate.find("Bob").unwrap().name, "Bob");
        assert_eq!(aggregate.find("bOBBY").unwrap().name, "Bobby");
    }

    #[test]
    fn substring_match_prefers_shortest_name() {
        let aggregate = ArchiveAggregate::new(roster());
        assert_eq!(aggregate.find("ob").unwrap().name, "Bob");
        assert_eq!(aggregate.find("ali").unwrap().name, "Alice");
        assert_eq!(aggregate.find("ber").unwrap().name, "Robert");
        assert!(aggregate.find("zed").is_none());
    }

    #[test]
    fn case_collision_keeps_higher_ranked_player() {
        let aggregate = ArchiveAggregate::new(vec![player("Ghost", 4), player("ghost", 1)]);
        assert_eq!(aggregate.len(), 2);
        assert_eq!(aggregate.find("GHOST").unwrap().kill_count, 4);
    }

    #[test]
    fn builds_lazily_once() {
        let source = Arc::new(CountingSource::new(roster()));
        let cache = StatsCache::with_source(Arc::clone(&source));
        assert_eq!(cache.status(), CacheStatus::Empty);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        assert_eq!(cache.get_all().unwrap().len(), 4);
        assert_eq!(cache.get_by_name("alice").unwrap().unwrap().name, "Alice");
        assert_eq!(cache.get_by_name("nobody").unwrap(), None);
        assert_eq!(cache.status(), CacheStatus::Ready);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn invalidate_rebuilds_once_under_concurrent_readers() {
        let mut source = CountingSource::new(roster());
        source.delay = Duration::from_millis(30);
        let source = Arc::new(source);
        let cache = Arc::new(StatsCache::with_source(Arc::clone(&source)));

        let before = cache.get_all().unwrap();
        cache.invalidate();
        assert_eq!(cache.status(), CacheStatus::Empty);

        let readers = 8;
        let barrier = Arc::new(Barrier::new(readers));
        let handles: Vec<_> = (0..readers)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_all().unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.builds(), 2);
        for aggregate in &results {
            assert!(Arc::ptr_eq(aggregate, &results[0]));
        }
        // The aggregate handed out before invalidation is untouched.
        assert_eq!(before.len(), 4);
        assert!(!Arc::ptr_eq(&before, &results[0]));
    }

    #[test]
    fn failed_build_is_retried_on_next_read() {
        let source = CountingSource::new(roster());
        source.failures_left.store(1, Ordering::SeqCst);
        let source = Arc::new(source);
        let cache = StatsCache::with_source(Arc::clone(&source));

        let err = cache.get_all().err().unwrap();
        assert!(matches!(err, CacheError::Build(_)));
        assert_eq!(cache.status(), CacheStatus::Empty);

        assert_eq!(cache.get_all().unwrap().len(), 4);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn waiters_share_a_failed_build() {
        let (source, started, release) = gated();
        let cache = Arc::new(StatsCache::with_source(Arc::clone(&source)));

        let first = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_all())
        };
        started.recv().unwrap();
        assert_eq!(cache.status(), CacheStatus::Building);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get_all())
            })
            .collect();
        // Give the waiters time to queue on the lock.
        thread::sleep(Duration::from_millis(50));
        release.send(false).unwrap();

        assert!(matches!(first.join().unwrap(), Err(CacheError::Build(_))));
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(CacheError::Build(_))));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status(), CacheStatus::Empty);
    }

    #[test]
    fn deadline_abandons_wait_without_cancelling_build() {
        let (source, started, release) = gated();
        let cache = Arc::new(StatsCache::with_source(Arc::clone(&source)));

        let err = cache.get_all_within(Duration::from_millis(20)).err().unwrap();
        assert!(matches!(err, CacheError::Timeout));
        started.recv().unwrap();

        release.send(true).unwrap();
        assert_eq!(
            cache
                .get_by_name_within("bob", Duration::from_secs(10))
                .unwrap()
                .unwrap()
                .name,
            "Bob"
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn cache_over_directory() {
        use crate::archive::tests::{duel, write_capture};

        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path(), "one.gz", &duel("Bob", "Bobby", &["Rifle"]));
        write_capture(dir.path(), "two.gz", &duel("Bob", "Alice", &["Rifle", "Knife"]));

        let cache = StatsCache::new(ArchiveConfig::new(dir.path()));
        let bob = cache.get_by_name("bob").unwrap().unwrap();
        assert_eq!(bob.name, "Bob");
        assert_eq!(bob.kill_count, 3);
        assert_eq!(cache.get_by_name("bbY").unwrap().unwrap().death_count, 1);

        write_capture(dir.path(), "three.gz", &duel("Bob", "Alice", &["MG"]));
        assert_eq!(cache.get_by_name("bob").unwrap().unwrap().kill_count, 3);
        cache.invalidate();
        assert_eq!(cache.get_by_name("bob").unwrap().unwrap().kill_count, 4);
    }
}
