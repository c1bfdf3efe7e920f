//! Time-bounded memoization for schema, facet, row and aggregate queries.
//!
//! One [`TtlCache`] exists per value class so each class carries its own ttl
//! and value type. Entries live in per-key slots backed by a
//! [`once_cell::sync::OnceCell`]; concurrent misses on the same key block on
//! the slot and share a single producer call. A producer that errors (or
//! whose request is cancelled) leaves the slot empty and the slot is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::types::*;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for ttl checks and the "today" fallback date.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn today(&self) -> NaiveDate;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            today: Mutex::new(today),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn set_today(&self, today: NaiveDate) {
        *self.today.lock() = today;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn today(&self) -> NaiveDate {
        *self.today.lock()
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Deterministic encoding of a call's logical arguments.
///
/// Field order is fixed by the call site. Free-text values are quoted with
/// embedded quotes doubled, so no value can imitate a separator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: &str) -> Self {
        Self(kind.to_string())
    }

    /// Append a fixed (non user-supplied) field.
    pub fn field(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.0.push('|');
        self.0.push_str(name);
        self.0.push('=');
        self.0.push_str(&value.to_string());
        self
    }

    /// Append a facet selection: `*` for "All", quoted text otherwise.
    pub fn facet(self, facet: Facet, value: &FacetValue) -> Self {
        let encoded = match value {
            FacetValue::All => "*".to_string(),
            FacetValue::Value(v) => format!("'{}'", v.replace('\'', "''")),
        };
        self.field(facet.param_name(), encoded)
    }

    /// Append every facet of `selection` in `facets`.
    pub fn facets(self, facets: &[Facet], selection: &FilterSelection) -> Self {
        facets
            .iter()
            .fold(self, |key, facet| key.facet(*facet, selection.get(*facet)))
    }

    pub fn date_range(self, range: DateRange) -> Self {
        self.field("from", range.start).field("to", range.end)
    }

    /// Closing field; every key carries the read mode.
    pub fn read_mode(self, mode: ReadMode) -> Self {
        self.field("dirty", u8::from(mode.is_dirty()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Cache counters for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub expirations: AtomicU64,
}

impl CacheStats {
    /// Current stats as a tuple: (hits, misses, expirations).
    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.expirations.load(Ordering::Relaxed),
        )
    }

    /// Hit rate in 0.0 - 1.0.
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses, _) = self.get();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry<V> {
    value: Arc<V>,
    created_at: Instant,
}

#[derive(Debug)]
struct Slot<V> {
    cell: OnceCell<Entry<V>>,
}

impl<V> Slot<V> {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            cell: OnceCell::new(),
        })
    }
}

/// A ttl-bounded, single-flight memo table for one value class.
pub struct TtlCache<V> {
    name: &'static str,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slots: Mutex<FxHashMap<CacheKey, Arc<Slot<V>>>>,
    stats: CacheStats,
}

impl<V: Send + Sync> TtlCache<V> {
    pub fn new(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            ttl,
            clock,
            slots: Mutex::new(FxHashMap::default()),
            stats: CacheStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now > entry.created_at + self.ttl
    }

    /// The slot for `key`, replacing it first if its entry has expired.
    fn slot(&self, key: &CacheKey) -> Arc<Slot<V>> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(key) {
            match existing.cell.get() {
                Some(entry) if self.is_expired(entry, now) => {
                    self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                    debug!(cache = self.name, key = %key, "cache entry expired");
                }
                _ => return Arc::clone(existing),
            }
        }
        let fresh = Slot::empty();
        slots.insert(key.clone(), Arc::clone(&fresh));
        fresh
    }

    /// Return the cached value for `key`, or run `producer` to fill it.
    ///
    /// Cancellation is checked before the producer runs and again before its
    /// result is stored.
    pub fn get_or_try_insert_with<F>(
        &self,
        key: &CacheKey,
        cancel: &CancelToken,
        producer: F,
    ) -> AnalyticsResult<Arc<V>>
    where
        F: FnOnce() -> AnalyticsResult<V>,
    {
        let slot = self.slot(key);
        if let Some(entry) = slot.cell.get() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(cache = self.name, key = %key, "cache hit");
            return Ok(Arc::clone(&entry.value));
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache = self.name, key = %key, "cache miss");
        let result = slot.cell.get_or_try_init(|| {
            cancel.check()?;
            let value = producer()?;
            cancel.check()?;
            Ok(Entry {
                value: Arc::new(value),
                created_at: self.clock.now(),
            })
        });

        match result {
            Ok(entry) => Ok(Arc::clone(&entry.value)),
            Err(err) => {
                self.discard_empty(key, &slot);
                Err(err)
            }
        }
    }

    fn discard_empty(&self, key: &CacheKey, slot: &Arc<Slot<V>>) {
        let mut slots = self.slots.lock();
        let same = slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if same && slot.cell.get().is_none() {
            slots.remove(key);
        }
    }

    /// Whether a live (unexpired) entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.slots
            .lock()
            .get(key)
            .and_then(|slot| slot.cell.get())
            .is_some_and(|entry| !self.is_expired(entry, now))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.slots
            .lock()
            .values()
            .filter_map(|slot| slot.cell.get())
            .filter(|entry| !self.is_expired(entry, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalidate_all(&self) {
        self.slots.lock().clear();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
