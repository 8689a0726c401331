//! Concurrent registry of leaky buckets.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::bucket::{Admission, LeakyBucket};
use super::key::RateLimitKey;
use super::policy::BucketParams;

/// Maps each rate limit key to its bucket, creating buckets on first use.
///
/// The map is sharded, so get-or-create only locks the shard holding the
/// key. The shard lock is released before the bucket is checked; from then
/// on only the bucket's own mutex is held. Unrelated keys therefore never
/// serialize on each other beyond a brief shard lookup.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: DashMap<RateLimitKey, Arc<LeakyBucket>>,
}

impl BucketRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Get the bucket for `key`, creating it with `params` if absent.
    ///
    /// Parameters are ignored when the bucket already exists. Concurrent
    /// callers racing on an unseen key all receive the same instance.
    pub fn get_or_create(&self, key: &RateLimitKey, params: BucketParams) -> Arc<LeakyBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = params.capacity,
                drain_amount = params.drain_amount,
                drain_period_ms = params.drain_period.as_millis() as u64,
                "Creating new leaky bucket"
            );
            Arc::new(params.build())
        });
        Arc::clone(bucket.value())
    }

    /// Look up (or create) the bucket for `key` and try to admit one request.
    pub fn check(&self, key: &RateLimitKey, params: BucketParams) -> Admission {
        let bucket = self.get_or_create(key, params);
        let admission = bucket.try_admit();

        trace!(
            key = %key,
            admitted = admission.is_admitted(),
            "Checked leaky bucket"
        );

        admission
    }

    /// Get the bucket for `key` if one exists.
    pub fn get(&self, key: &RateLimitKey) -> Option<Arc<LeakyBucket>> {
        self.buckets.get(key).map(|b| Arc::clone(b.value()))
    }

    /// Remove buckets that are fully drained and unseen for `max_idle`.
    ///
    /// Returns the number of buckets removed. A drained bucket behaves
    /// exactly like a fresh one, so eviction never lets a client exceed its
    /// limits.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Instant::now())
    }

    /// [`evict_idle`](Self::evict_idle) with an explicit clock.
    pub fn evict_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_seen());
            idle < max_idle || !bucket.is_drained_at(now)
        });
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(
                removed,
                remaining = self.buckets.len(),
                "Evicted idle leaky buckets"
            );
        }
        removed
    }

    /// Evict least recently seen buckets until at most `max_keys` remain.
    ///
    /// Unlike [`evict_idle`](Self::evict_idle) this may drop buckets that
    /// still hold state; it is the last line of defence against unbounded
    /// key growth.
    pub fn enforce_capacity(&self, max_keys: usize) -> usize {
        let len = self.buckets.len();
        if len <= max_keys {
            return 0;
        }

        let mut by_age: Vec<(RateLimitKey, Instant)> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_seen()))
            .collect();
        by_age.sort_by_key(|(_, last_seen)| *last_seen);

        let excess = len - max_keys;
        let mut removed = 0;
        for (key, _) in by_age.into_iter().take(excess) {
            if self.buckets.remove(&key).is_some() {
                removed += 1;
            }
        }

        info!(
            removed,
            max_keys,
            "Registry over capacity, evicted least recently seen buckets"
        );
        removed
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Spawn a background task that periodically evicts idle buckets and
    /// enforces the key cap.
    ///
    /// The task stops when `shutdown` is cancelled.
    pub fn spawn_eviction_task(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        max_keys: usize,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        registry.evict_idle(max_idle);
                        registry.enforce_capacity(max_keys);
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Bucket eviction task shutting down");
                        break;
                    }
                }
            }
        })
    }
}
