//! Per-topic byte/message counters with a 60s rollup (spec §3, §4.6).
//!
//! Resolves the §9 open question on unbounded growth: entries beyond
//! `max_tracked_topics` are evicted LRU-style in the same rollup tick that
//! recomputes `rate1m`, in the spirit of `lruttl`'s bounded tracked maps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

struct TopicCounters {
    bytes: AtomicU64,
    msgs: AtomicU64,
    rate1m: AtomicU64,
    last_sample_bytes: AtomicU64,
}

impl TopicCounters {
    fn new() -> Self {
        TopicCounters {
            bytes: AtomicU64::new(0),
            msgs: AtomicU64::new(0),
            rate1m: AtomicU64::new(0),
            last_sample_bytes: AtomicU64::new(0),
        }
    }
}

/// Snapshot returned to callers; avoids exposing the atomics directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicStatsSnapshot {
    pub bytes: u64,
    pub msgs: u64,
    pub rate1m_bytes_per_sec: u64,
}

struct Inner {
    counters: DashMap<String, Arc<TopicCounters>>,
    lru: Mutex<VecDeque<String>>,
    max_tracked_topics: usize,
}

/// Process-lifetime registry of per-topic stats (spec §3: `TopicStats`).
#[derive(Clone)]
pub struct TopicStatsRegistry {
    inner: Arc<Inner>,
}

impl TopicStatsRegistry {
    pub fn new(max_tracked_topics: usize) -> Self {
        TopicStatsRegistry {
            inner: Arc::new(Inner {
                counters: DashMap::new(),
                lru: Mutex::new(VecDeque::new()),
                max_tracked_topics,
            }),
        }
    }

    fn get_or_create(&self, topic: &str) -> Arc<TopicCounters> {
        if let Some(existing) = self.inner.counters.get(topic) {
            self.touch(topic);
            return existing.clone();
        }
        let counters = Arc::new(TopicCounters::new());
        self.inner
            .counters
            .insert(topic.to_string(), counters.clone());
        self.touch(topic);
        self.evict_if_needed();
        counters
    }

    fn touch(&self, topic: &str) {
        let mut lru = self.inner.lru.lock();
        lru.retain(|t| t != topic);
        lru.push_back(topic.to_string());
    }

    fn evict_if_needed(&self) {
        let mut lru = self.inner.lru.lock();
        while lru.len() > self.inner.max_tracked_topics {
            if let Some(oldest) = lru.pop_front() {
                self.inner.counters.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Updates counters "per frame" as a `Send` frame's topic is known
    /// (spec §4.6).
    pub fn record(&self, topic: &str, bytes: u64, msgs: u64) {
        let counters = self.get_or_create(topic);
        counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        counters.msgs.fetch_add(msgs, Ordering::Relaxed);
    }

    pub fn snapshot(&self, topic: &str) -> Option<TopicStatsSnapshot> {
        self.inner.counters.get(topic).map(|c| TopicStatsSnapshot {
            bytes: c.bytes.load(Ordering::Relaxed),
            msgs: c.msgs.load(Ordering::Relaxed),
            rate1m_bytes_per_sec: c.rate1m.load(Ordering::Relaxed),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.counters.is_empty()
    }

    /// Recomputes `rate1m` for every tracked topic from the delta in bytes
    /// since the previous rollup tick, and evicts least-recently-touched
    /// entries down to `max_tracked_topics` (spec §3, §9). Intended to be
    /// driven by a `tokio::time::interval` ticking every 60s.
    pub fn rollup(&self, elapsed: Duration) {
        let secs = elapsed.as_secs().max(1);
        for entry in self.inner.counters.iter() {
            let counters = entry.value();
            let current = counters.bytes.load(Ordering::Relaxed);
            let previous = counters.last_sample_bytes.swap(current, Ordering::Relaxed);
            let delta = current.saturating_sub(previous);
            counters.rate1m.store(delta / secs, Ordering::Relaxed);
        }
        self.evict_if_needed();
    }

    /// Spawns the periodic rollup task; returns its `JoinHandle` so
    /// `ProxyService::shutdown` can abort it.
    pub fn spawn_rollup_task(self, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut last = Instant::now();
            loop {
                interval.tick().await;
                let now = Instant::now();
                self.rollup(now.duration_since(last));
                last = now;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_per_topic() {
        let reg = TopicStatsRegistry::new(100);
        reg.record("t1", 10, 1);
        reg.record("t1", 5, 1);
        reg.record("t2", 1, 1);
        let snap = reg.snapshot("t1").unwrap();
        assert_eq!(snap.bytes, 15);
        assert_eq!(snap.msgs, 2);
        assert_eq!(reg.snapshot("t2").unwrap().bytes, 1);
    }

    #[test]
    fn rollup_computes_rate() {
        let reg = TopicStatsRegistry::new(100);
        reg.record("t1", 600, 1);
        reg.rollup(Duration::from_secs(60));
        assert_eq!(reg.snapshot("t1").unwrap().rate1m_bytes_per_sec, 10);
    }

    #[test]
    fn lru_eviction_caps_tracked_topics() {
        let reg = TopicStatsRegistry::new(2);
        reg.record("t1", 1, 1);
        reg.record("t2", 1, 1);
        reg.record("t3", 1, 1);
        assert_eq!(reg.len(), 2);
        assert!(reg.snapshot("t1").is_none());
        assert!(reg.snapshot("t3").is_some());
    }
}
