//! Cached access to remote collections.
//!
//! A [`Repository`] sits in front of a [`CollectionSource`] and decides, per
//! call, whether to serve the cached snapshot or fetch again:
//!
//! - cached, younger than `max_age`, not forced: served from cache
//! - otherwise fetched; a successful fetch replaces the cached snapshot
//! - a failed fetch falls back to the last good snapshot for the same key,
//!   marked [`Freshness::Stale`]; with nothing cached the call fails with
//!   [`JourneyError::DataUnavailable`]
//!
//! Forcing a refresh bypasses the age check but keeps the last good snapshot
//! around, so a manual refresh while offline still shows something.

use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{JourneyError, Result};

/// Something that can fetch one collection for a key.
pub trait CollectionSource: Send + Sync {
    type Key: Eq + Hash + Clone + Debug + Send + Sync;
    type Item: Send + Sync;

    /// Name used in logs and `DataUnavailable` errors.
    fn name(&self) -> &str;

    fn fetch<'a>(&'a self, key: &'a Self::Key) -> BoxFuture<'a, Result<Self::Item>>;
}

/// How long cached snapshots stay fresh, and how many keys are remembered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Snapshots younger than this are served without fetching. Default: 300s
    pub max_age: Duration,
    /// Distinct keys kept for degraded mode. Default: 16
    pub capacity: usize,
}

impl CachePolicy {
    /// Always fetch, but keep last-good snapshots for degraded mode.
    pub fn always_fetch(capacity: usize) -> Self {
        Self {
            max_age: Duration::ZERO,
            capacity,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(300),
            capacity: 16,
        }
    }
}

/// Where a snapshot came from. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Freshness {
    /// Fetched by this call
    Fresh,
    /// Served from cache within its max age
    Cached,
    /// Served from cache because the fetch failed
    Stale,
}

impl Freshness {
    /// The worse of two freshness values.
    pub fn combine(self, other: Freshness) -> Freshness {
        self.max(other)
    }

    pub fn is_stale(&self) -> bool {
        *self == Freshness::Stale
    }
}

/// Immutable, shared result of one fetch.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Arc<T>,
    pub fetched_at: Instant,
    pub freshness: Freshness,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            freshness: self.freshness,
        }
    }
}

impl<T> Snapshot<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value: Arc::new(value),
            fetched_at: Instant::now(),
            freshness: Freshness::Fresh,
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    fn marked(&self, freshness: Freshness) -> Self {
        Self {
            freshness,
            ..self.clone()
        }
    }
}

/// Cache-aware front for a [`CollectionSource`].
pub struct Repository<S: CollectionSource> {
    source: S,
    policy: CachePolicy,
    cache: Mutex<LruCache<S::Key, Snapshot<S::Item>>>,
}

impl<S: CollectionSource> Repository<S> {
    pub fn new(source: S, policy: CachePolicy) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(policy.capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            source,
            policy,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<S::Key, Snapshot<S::Item>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot for `key`, fetching unless a young enough one is cached.
    pub async fn get(&self, key: &S::Key, force_refresh: bool) -> Result<Snapshot<S::Item>> {
        if !force_refresh {
            let cached = self.cache().get(key).cloned();
            if let Some(cached) = cached.filter(|s| s.age() < self.policy.max_age) {
                debug!(
                    "[Repository] {} {:?}: serving cached snapshot ({:?} old)",
                    self.source.name(),
                    key,
                    cached.age()
                );
                return Ok(cached.marked(Freshness::Cached));
            }
        }

        match self.source.fetch(key).await {
            Ok(value) => {
                let snapshot = Snapshot::fresh(value);
                let evicted = self.cache().push(key.clone(), snapshot.clone());
                if let Some((evicted, _)) = evicted.filter(|(k, _)| k != key) {
                    debug!("[Repository] {} evicted {:?}", self.source.name(), evicted);
                }
                Ok(snapshot)
            }
            Err(err) => {
                let previous = self.cache().get(key).cloned();
                match previous {
                    Some(previous) => {
                        warn!(
                            "[Repository] {} {:?} fetch failed, serving snapshot from {:?} ago: {}",
                            self.source.name(),
                            key,
                            previous.age(),
                            err
                        );
                        Ok(previous.marked(Freshness::Stale))
                    }
                    None => {
                        warn!(
                            "[Repository] {} {:?} fetch failed with nothing cached: {}",
                            self.source.name(),
                            key,
                            err
                        );
                        Err(match err {
                            JourneyError::DataUnavailable { .. } => err,
                            other => JourneyError::DataUnavailable {
                                source_name: self.source.name().to_string(),
                                message: other.to_string(),
                            },
                        })
                    }
                }
            }
        }
    }

    /// Last good snapshot for `key`, without fetching.
    pub fn cached(&self, key: &S::Key) -> Option<Snapshot<S::Item>> {
        self.cache().peek(key).cloned()
    }

    /// Drop every cached snapshot.
    pub fn invalidate(&self) {
        self.cache().clear();
        debug!("[Repository] {} cache invalidated", self.source.name());
    }

    /// Drop the cached snapshot for one key.
    pub fn invalidate_key(&self, key: &S::Key) {
        self.cache().pop(key);
    }

    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }
}
