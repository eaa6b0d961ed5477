#![forbid(unsafe_code)]

//! Leaky-bucket rate limiting keyed by IP address or sender identifier.
//!
//! Buckets leak whole `leaked_tokens` increments per elapsed `leak_duration`
//! and reject an `add` that would exceed capacity. Whitelisted buckets bypass
//! the check entirely. A background reaper evicts buckets that have not been
//! touched within `bucket_max_age`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Parameters shared by every bucket in one map.
#[derive(Debug, Clone, Copy)]
pub struct MapParams {
    pub capacity: u32,
    pub leaked_tokens: u32,
    pub leak_duration: Duration,
    pub poll_duration: Duration,
    pub bucket_max_age: Duration,
}

#[derive(Debug, Clone)]
struct LeakyBucket {
    tokens: u32,
    last_leak: Instant,
    last_access: Instant,
    whitelisted: bool,
}

impl LeakyBucket {
    fn new(now: Instant) -> Self {
        LeakyBucket {
            tokens: 0,
            last_leak: now,
            last_access: now,
            whitelisted: false,
        }
    }

    fn leak(&mut self, params: &MapParams, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_leak);
        let intervals = (elapsed.as_nanos() / params.leak_duration.as_nanos().max(1)) as u32;
        if intervals == 0 {
            return;
        }
        self.tokens = self
            .tokens
            .saturating_sub(intervals.saturating_mul(params.leaked_tokens));
        // Advance in whole multiples so fractional intervals keep accruing.
        self.last_leak += params.leak_duration * intervals;
    }

    fn add(&mut self, params: &MapParams, n: u32, now: Instant) -> bool {
        self.leak(params, now);
        self.last_access = now;
        match self.tokens.checked_add(n) {
            Some(total) if total <= params.capacity => {
                self.tokens = total;
                true
            }
            _ => false,
        }
    }
}

/// Map of leaky buckets with lazy creation.
#[derive(Clone)]
pub struct BucketMap {
    params: MapParams,
    buckets: Arc<Mutex<HashMap<String, LeakyBucket>>>,
    kill: Arc<Notify>,
}

impl BucketMap {
    pub fn new(params: MapParams) -> Self {
        BucketMap {
            params,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            kill: Arc::new(Notify::new()),
        }
    }

    /// Fetch the bucket for `key`, creating it when absent. The handle keeps
    /// the map locked, serializing bucket operations.
    pub fn lookup_bucket(&self, key: &str) -> BucketHandle<'_> {
        let now = Instant::now();
        let mut guard = self.buckets.lock();
        guard
            .entry(key.to_owned())
            .or_insert_with(|| LeakyBucket::new(now));
        BucketHandle {
            guard,
            params: self.params,
            key: key.to_owned(),
        }
    }

    /// Mark `key` as exempt from rate limiting and from eviction.
    pub fn whitelist(&self, key: &str) {
        let now = Instant::now();
        self.buckets
            .lock()
            .entry(key.to_owned())
            .or_insert_with(|| LeakyBucket::new(now))
            .whitelisted = true;
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }

    /// Start the eviction task. Runs until [`BucketMap::kill`] is called.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let buckets = Arc::clone(&self.buckets);
        let kill = Arc::clone(&self.kill);
        let params = self.params;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(params.poll_duration);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = Instant::now();
                        let mut map = buckets.lock();
                        let before = map.len();
                        map.retain(|_, b| {
                            b.whitelisted
                                || now.saturating_duration_since(b.last_access)
                                    <= params.bucket_max_age
                        });
                        let evicted = before - map.len();
                        if evicted > 0 {
                            debug!(evicted, "rate limiter evicted stale buckets");
                        }
                    }
                    _ = kill.notified() => return,
                }
            }
        })
    }

    /// Stop the reaper task.
    pub fn kill(&self) {
        self.kill.notify_waiters();
    }
}

/// Locked view of one bucket inside its map.
pub struct BucketHandle<'a> {
    guard: MutexGuard<'a, HashMap<String, LeakyBucket>>,
    params: MapParams,
    key: String,
}

impl BucketHandle<'_> {
    fn bucket(&mut self) -> &mut LeakyBucket {
        // The entry is created in lookup_bucket and the map stays locked.
        self.guard
            .get_mut(&self.key)
            .expect("bucket exists while handle is held")
    }

    /// Try to add `n` tokens; false when the bucket would overflow.
    pub fn add(&mut self, n: u32) -> bool {
        let params = self.params;
        self.bucket().add(&params, n, Instant::now())
    }

    pub fn is_whitelisted(&mut self) -> bool {
        self.bucket().whitelisted
    }

    pub fn remaining(&mut self) -> u32 {
        let params = self.params;
        let bucket = self.bucket();
        bucket.leak(&params, Instant::now());
        params.capacity - bucket.tokens.min(params.capacity)
    }
}
