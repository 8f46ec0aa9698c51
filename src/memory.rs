use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::{
    error::{RateLimitError, Result},
    metrics::Metrics,
    store::{IncrementResult, Store},
    utils::{SystemTimeSource, TimeSource},
};

#[derive(Debug, Clone, Copy)]
struct Entry {
    counter: u64,
    // Unix seconds
    reset_timestamp: i64,
    generation: u64,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

/// In-process store shared by every task of the current process.
///
/// Each new key schedules a one-shot tokio task that removes it once its
/// window has elapsed, so memory is bounded by the set of active keys.
/// `increment` must therefore be called from within a tokio runtime.
pub struct MemoryStore {
    table: Arc<Mutex<Table>>,
    time_source: Arc<dyn TimeSource>,
    metrics: Option<Arc<Metrics>>,
}

impl MemoryStore {
    /// Create an empty store using the system clock
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// Create an empty store reading time from `time_source`
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            time_source,
            metrics: None,
        }
    }

    /// Report entry counts to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.table.lock().entries.contains_key(key)
    }

    fn schedule_expiry(&self, handle: &Handle, key: String, generation: u64, window_seconds: u64) {
        let table = Arc::downgrade(&self.table);
        let metrics = self.metrics.clone();

        handle.spawn(async move {
            tokio::time::sleep(Duration::from_secs(window_seconds)).await;
            remove_expired(&table, &key, generation, metrics.as_deref());
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Window length as a TTL, clamped to what fits in Unix seconds
fn window_ttl(window_seconds: u64) -> i64 {
    i64::try_from(window_seconds).unwrap_or(i64::MAX)
}

/// Runtime that expiry tasks are spawned on
fn runtime_handle() -> Result<Handle> {
    Handle::try_current().map_err(|e| {
        RateLimitError::Store(format!("in-process store needs a tokio runtime: {}", e))
    })
}

/// Drop `key` if it still holds the entry this expiry was scheduled for.
fn remove_expired(
    table: &Weak<Mutex<Table>>,
    key: &str,
    generation: u64,
    metrics: Option<&Metrics>,
) {
    // The store itself is gone
    let Some(table) = table.upgrade() else {
        return;
    };

    let mut table = table.lock();
    let current = table.entries.get(key).map(|e| e.generation);
    if current == Some(generation) {
        table.entries.remove(key);
        trace!("Expired in-process entry {}", key);
    }
    if let Some(metrics) = metrics {
        metrics.set_memory_entries(table.entries.len());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment(
        &self,
        key: &str,
        _limit: u64,
        window_seconds: u64,
    ) -> Result<IncrementResult> {
        // Checked before touching the table so no entry is left without an expiry
        let handle = runtime_handle()?;
        let now = self.time_source.unix_now();

        let (entry, created, live) = {
            let mut table = self.table.lock();
            let generation = table.next_generation;

            let mut created = false;
            let entry = table
                .entries
                .entry(key.to_string())
                .and_modify(|e| e.counter += 1)
                .or_insert_with(|| {
                    created = true;
                    Entry {
                        counter: 1,
                        reset_timestamp: now.saturating_add(window_ttl(window_seconds)),
                        generation,
                    }
                });
            let entry = *entry;

            if created {
                table.next_generation += 1;
            }
            (entry, created, table.entries.len())
        };

        if created {
            debug!("Created in-process entry {} expiring in {}s", key, window_seconds);
            self.schedule_expiry(&handle, key.to_string(), entry.generation, window_seconds);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_store_operation("memory", "incr", "success");
            metrics.set_memory_entries(live);
        }

        Ok(IncrementResult {
            counter: entry.counter,
            ttl_seconds: entry.reset_timestamp.saturating_sub(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualTimeSource;
    use tokio_test::{assert_err, assert_ready, task::spawn};

    #[tokio::test]
    async fn test_first_increment_creates_entry() {
        let store = MemoryStore::new();
        let result = store.increment("k:1", 10, 60).await.unwrap();

        assert_eq!(result.counter, 1);
        assert_eq!(result.ttl_seconds, 60);
        assert!(store.contains_key("k:1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_counts_down_from_creation() {
        let clock = Arc::new(ManualTimeSource::new(1_000));
        let store = MemoryStore::with_time_source(clock.clone());

        assert_eq!(store.increment("k", 5, 60).await.unwrap().ttl_seconds, 60);
        clock.advance(15);
        let result = store.increment("k", 5, 60).await.unwrap();
        assert_eq!(result.counter, 2);
        assert_eq!(result.ttl_seconds, 45);

        // Expiry task has not fired yet: the entry reads as about to reset.
        clock.advance(50);
        assert_eq!(store.increment("k", 5, 60).await.unwrap().ttl_seconds, -5);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryStore::new();
        store.increment("a", 10, 60).await.unwrap();
        store.increment("a", 10, 60).await.unwrap();
        let b = store.increment("b", 10, 60).await.unwrap();

        assert_eq!(b.counter, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_counter_is_not_capped_at_limit() {
        let store = MemoryStore::new();
        let mut last = 0;
        for _ in 0..5 {
            last = store.increment("k", 2, 60).await.unwrap().counter;
        }
        assert_eq!(last, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.increment("hot", 1000, 60).await.unwrap().counter
                })
            })
            .collect();

        let mut counters = Vec::new();
        for handle in handles {
            counters.push(handle.await.unwrap());
        }
        counters.sort_unstable();

        let expected: Vec<u64> = (1..=200).collect();
        assert_eq!(counters, expected);
    }

    #[tokio::test]
    async fn test_entry_removed_after_window() {
        let store = MemoryStore::new();
        store.increment("short", 10, 1).await.unwrap();
        assert!(store.contains_key("short"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!store.contains_key("short"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_many_distinct_keys_are_reclaimed() {
        let store = MemoryStore::new();
        for i in 0..500 {
            store.increment(&format!("client-{}", i), 10, 1).await.unwrap();
        }
        assert_eq!(store.len(), 500);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow() {
        let clock = Arc::new(ManualTimeSource::new(1_700_000_000));
        let store = MemoryStore::with_time_source(clock.clone());

        let first = store.increment("k", 10, u64::MAX).await.unwrap();
        assert_eq!(first.counter, 1);
        assert_eq!(first.ttl_seconds, i64::MAX - 1_700_000_000);

        clock.advance(10);
        let second = store.increment("k", 10, u64::MAX).await.unwrap();
        assert_eq!(second.counter, 2);
        assert_eq!(second.ttl_seconds, i64::MAX - 1_700_000_010);
    }

    #[test]
    fn test_increment_outside_runtime_is_an_error() {
        let store = MemoryStore::new();
        {
            let mut task = spawn(store.increment("k", 10, 60));
            let err = assert_err!(assert_ready!(task.poll()));
            assert!(err.is_store_error());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_expiry_keeps_newer_entry() {
        let table = Arc::new(Mutex::new(Table::default()));
        table.lock().entries.insert(
            "k".to_string(),
            Entry {
                counter: 3,
                reset_timestamp: 0,
                generation: 7,
            },
        );
        let weak = Arc::downgrade(&table);

        remove_expired(&weak, "k", 6, None);
        assert!(table.lock().entries.contains_key("k"));

        remove_expired(&weak, "k", 7, None);
        assert!(!table.lock().entries.contains_key("k"));

        // Already gone
        remove_expired(&weak, "k", 7, None);
        assert!(table.lock().entries.is_empty());
    }

    #[test]
    fn test_expiry_after_store_dropped_is_noop() {
        let table = Arc::new(Mutex::new(Table::default()));
        let weak = Arc::downgrade(&table);
        drop(table);

        remove_expired(&weak, "k", 0, None);
    }

    #[tokio::test]
    async fn test_entry_gauge_tracks_live_entries() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = MemoryStore::new().with_metrics(metrics.clone());

        store.increment("a", 10, 60).await.unwrap();
        store.increment("b", 10, 60).await.unwrap();

        let families = metrics.registry().gather();
        let gauge = families
            .iter()
            .find(|f| f.get_name() == "ratelimit_memory_entries")
            .unwrap();
        assert_eq!(gauge.get_metric()[0].get_gauge().get_value(), 2.0);
    }
}
