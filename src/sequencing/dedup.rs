//! Time-bounded message-id deduplication.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use tracing::debug;

use crate::clock::elapsed_between;
use crate::message::domain::MessageId;

/// How long a seen id suppresses redeliveries by default.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3600);

/// Minimum time between lazy purges of one shard.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_SHARDS: usize = 16;

/// Result of [`DedupCache::check_and_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    /// The id was not live in the cache and has now been marked.
    First,
    /// The id was marked within the TTL window.
    Duplicate,
}

impl Seen {
    /// Returns `true` for [`Seen::Duplicate`].
    #[must_use]
    pub const fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

struct Shard {
    entries: HashMap<MessageId, DateTime<Utc>>,
    last_purge: DateTime<Utc>,
}

impl Shard {
    fn purge(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, seen_at| elapsed_between(*seen_at, now) < ttl);
        self.last_purge = now;
        before.saturating_sub(self.entries.len())
    }
}

/// Process-wide cache of recently seen message ids.
///
/// The cache is sharded by id hash so concurrent deliveries for unrelated
/// messages rarely contend. TTL expiry is the only way an id leaves the
/// cache, apart from [`DedupCache::release`] after a failed dispatch.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use switchyard::clock::ManualClock;
/// use switchyard::message::domain::MessageId;
/// use switchyard::sequencing::{DedupCache, Seen};
///
/// let clock = ManualClock::default();
/// let cache = DedupCache::new(Duration::from_secs(60), Arc::new(clock.clone()));
/// let id = MessageId::from("m1");
///
/// assert_eq!(cache.check_and_mark(&id), Seen::First);
/// assert_eq!(cache.check_and_mark(&id), Seen::Duplicate);
///
/// clock.advance(Duration::from_secs(60));
/// assert_eq!(cache.check_and_mark(&id), Seen::First);
/// ```
pub struct DedupCache<C: Clock + Send + Sync> {
    shards: Vec<Mutex<Shard>>,
    ttl: RwLock<Duration>,
    purge_interval: Duration,
    clock: Arc<C>,
}

impl<C: Clock + Send + Sync> DedupCache<C> {
    /// Creates a cache with the default shard count.
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<C>) -> Self {
        Self::with_shards(DEFAULT_SHARDS, ttl, clock)
    }

    /// Creates a cache with `shards` independently locked partitions.
    #[must_use]
    pub fn with_shards(shards: usize, ttl: Duration, clock: Arc<C>) -> Self {
        let now = clock.utc();
        let shards = (0..shards.max(1))
            .map(|_| {
                Mutex::new(Shard {
                    entries: HashMap::new(),
                    last_purge: now,
                })
            })
            .collect();
        Self {
            shards,
            ttl: RwLock::new(ttl),
            purge_interval: DEFAULT_PURGE_INTERVAL,
            clock,
        }
    }

    /// Overrides how often a shard purges itself on access.
    #[must_use]
    pub const fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Returns the current TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        *self.ttl.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the TTL. Existing entries are judged against the new value.
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write().unwrap_or_else(PoisonError::into_inner) = ttl;
    }

    /// Atomically tests whether `id` is live and marks it seen.
    ///
    /// An entry older than the TTL counts as absent and is refreshed.
    #[must_use]
    pub fn check_and_mark(&self, id: &MessageId) -> Seen {
        let now = self.clock.utc();
        let ttl = self.ttl();
        let Some(mut shard) = self.shard(id) else {
            return Seen::First;
        };
        if elapsed_between(shard.last_purge, now) >= self.purge_interval {
            let purged = shard.purge(now, ttl);
            if purged > 0 {
                debug!(purged, "dedup shard purged");
            }
        }
        match shard.entries.get(id) {
            Some(seen_at) if elapsed_between(*seen_at, now) < ttl => Seen::Duplicate,
            _ => {
                shard.entries.insert(id.clone(), now);
                Seen::First
            }
        }
    }

    /// Returns `true` if `id` is live without marking it.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        let now = self.clock.utc();
        let ttl = self.ttl();
        self.shard(id).is_some_and(|shard| {
            shard
                .entries
                .get(id)
                .is_some_and(|seen_at| elapsed_between(*seen_at, now) < ttl)
        })
    }

    /// Forgets `id` so that a redelivery is processed again.
    #[must_use]
    pub fn release(&self, id: &MessageId) -> bool {
        self.shard(id)
            .is_some_and(|mut shard| shard.entries.remove(id).is_some())
    }

    /// Removes every expired entry and returns how many were dropped.
    #[must_use = "the purge count is the only result"]
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.utc();
        let ttl = self.ttl();
        self.shards
            .iter()
            .map(|shard| lock(shard).purge(now, ttl))
            .sum()
    }

    /// Returns the number of stored entries, live or not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).entries.len()).sum()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, id: &MessageId) -> Option<MutexGuard<'_, Shard>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = u64::try_from(self.shards.len())
            .ok()
            .and_then(|count| hasher.finish().checked_rem(count))
            .and_then(|index| usize::try_from(index).ok())
            .unwrap_or(0);
        self.shards.get(index).map(lock)
    }
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rstest::{fixture, rstest};

    #[fixture]
    fn clock() -> ManualClock {
        ManualClock::default()
    }

    fn cache(clock: &ManualClock) -> DedupCache<ManualClock> {
        DedupCache::with_shards(4, Duration::from_secs(10), Arc::new(clock.clone()))
            .with_purge_interval(Duration::from_secs(5))
    }

    #[rstest]
    fn duplicate_within_ttl(clock: ManualClock) {
        let cache = cache(&clock);
        let id = MessageId::from("m1");

        assert_eq!(cache.check_and_mark(&id), Seen::First);
        clock.advance(Duration::from_secs(9));
        assert!(cache.check_and_mark(&id).is_duplicate());
    }

    #[rstest]
    fn duplicate_check_does_not_extend_the_window(clock: ManualClock) {
        let cache = cache(&clock);
        let id = MessageId::from("m1");
        let _first = cache.check_and_mark(&id);

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.check_and_mark(&id), Seen::Duplicate);
        clock.advance(Duration::from_secs(4));

        assert_eq!(cache.check_and_mark(&id), Seen::First);
    }

    #[rstest]
    fn release_allows_reprocessing(clock: ManualClock) {
        let cache = cache(&clock);
        let id = MessageId::from("m1");
        let _first = cache.check_and_mark(&id);

        assert!(cache.release(&id));
        assert!(!cache.contains(&id));
        assert_eq!(cache.check_and_mark(&id), Seen::First);
    }

    #[rstest]
    fn purge_drops_only_expired_entries(clock: ManualClock) {
        let cache = cache(&clock);
        let _old = cache.check_and_mark(&MessageId::from("old"));
        clock.advance(Duration::from_secs(8));
        let _new = cache.check_and_mark(&MessageId::from("new"));
        clock.advance(Duration::from_secs(3));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&MessageId::from("new")));
    }

    #[rstest]
    fn access_purges_lazily(clock: ManualClock) {
        let cache = DedupCache::with_shards(1, Duration::from_secs(10), Arc::new(clock.clone()))
            .with_purge_interval(Duration::from_secs(5));
        for n in 0..3 {
            let _seen = cache.check_and_mark(&MessageId::from(format!("m{n}").as_str()));
        }
        clock.advance(Duration::from_secs(11));

        let _fresh = cache.check_and_mark(&MessageId::from("fresh"));

        assert_eq!(cache.len(), 1);
    }

    #[rstest]
    fn shorter_ttl_applies_to_existing_entries(clock: ManualClock) {
        let cache = cache(&clock);
        let id = MessageId::from("m1");
        let _first = cache.check_and_mark(&id);
        clock.advance(Duration::from_secs(3));

        cache.set_ttl(Duration::from_secs(2));

        assert_eq!(cache.ttl(), Duration::from_secs(2));
        assert_eq!(cache.check_and_mark(&id), Seen::First);
    }

    #[rstest]
    fn concurrent_marks_admit_exactly_one_first(clock: ManualClock) {
        let cache = Arc::new(cache(&clock));
        let id = MessageId::from("contended");

        let firsts = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let id = id.clone();
                    scope.spawn(move || cache.check_and_mark(&id))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread"))
                .filter(|seen| *seen == Seen::First)
                .count()
        });

        assert_eq!(firsts, 1);
    }
}
