use std::num::NonZeroUsize;
use std::thread;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::Result;

/// Fixed-size pool of capture workers.
///
/// At most `limit` items are processed at once; [`WorkerPool::for_each`]
/// returns once every item has been handled.
pub struct WorkerPool {
    pool: ThreadPool,
    limit: usize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Result<Self> {
        let limit = limit.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(limit)
            .thread_name(|i| format!("capture-worker-{i}"))
            .build()?;
        Ok(Self { pool, limit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn for_each<T, F>(&self, items: &[T], f: F)
    where
        T: Sync,
        F: Fn(&T) + Send + Sync,
    {
        self.pool.install(|| items.par_iter().with_max_len(1).for_each(f));
    }
}

pub fn available_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
