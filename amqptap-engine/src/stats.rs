//! Per-source counters, shared between the source tasks and the caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::session::SessionState;

/// Thread-safe counters for a single tap source.
#[derive(Debug, Default)]
pub struct SourceStats {
    /// Redacted broker URI.
    pub uri: String,
    /// Deliveries read from the broker, malformed ones included.
    pub received: AtomicU64,
    /// Messages handed to the merge channel.
    pub forwarded: AtomicU64,
    /// Messages dropped because the merge channel stayed full.
    pub dropped: AtomicU64,
    /// Deliveries that could not be turned into a message.
    pub decode_errors: AtomicU64,
    /// Reconnect attempts after the first connect.
    pub reconnects: AtomicU64,
    pub state: RwLock<SessionState>,
}

impl SourceStats {
    fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Copy the counters into a plain value.
    pub fn snapshot(&self, index: usize) -> SourceSnapshot {
        SourceSnapshot {
            index,
            uri: self.uri.clone(),
            state: self.state(),
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one source's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceSnapshot {
    pub index: usize,
    pub uri: String,
    pub state: SessionState,
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
}

/// Registry of all sources of one engine run.
#[derive(Debug, Default)]
pub struct TapStats {
    sources: RwLock<BTreeMap<usize, Arc<SourceStats>>>,
}

impl TapStats {
    /// Register a source or get the existing one.
    pub fn register_source(&self, index: usize, uri: &str) -> Arc<SourceStats> {
        {
            let sources = self.sources.read();
            if let Some(stats) = sources.get(&index) {
                return stats.clone();
            }
        }

        let mut sources = self.sources.write();
        sources
            .entry(index)
            .or_insert_with(|| Arc::new(SourceStats::new(uri)))
            .clone()
    }

    /// Counters of one source.
    pub fn source(&self, index: usize) -> Option<Arc<SourceStats>> {
        self.sources.read().get(&index).cloned()
    }

    /// Snapshot of every source, ordered by index.
    pub fn snapshot(&self) -> Vec<SourceSnapshot> {
        self.sources
            .read()
            .iter()
            .map(|(index, stats)| stats.snapshot(*index))
            .collect()
    }

    /// Total messages forwarded across all sources.
    pub fn total_forwarded(&self) -> u64 {
        self.sources
            .read()
            .values()
            .map(|s| s.forwarded.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_returns_same_arc() {
        let stats = TapStats::default();
        let a = stats.register_source(0, "amqp://a");
        let b = stats.register_source(0, "amqp://ignored");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.uri, "amqp://a");
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = TapStats::default();
        let source = stats.register_source(1, "amqp://b");
        SourceStats::incr(&source.received);
        SourceStats::incr(&source.received);
        SourceStats::incr(&source.forwarded);
        SourceStats::incr(&source.decode_errors);
        source.set_state(SessionState::Consuming);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 1);
        let s = &snapshot[0];
        assert_eq!(s.index, 1);
        assert_eq!(s.received, 2);
        assert_eq!(s.forwarded, 1);
        assert_eq!(s.decode_errors, 1);
        assert_eq!(s.state, SessionState::Consuming);
    }

    #[test]
    fn snapshot_is_ordered_by_index() {
        let stats = TapStats::default();
        stats.register_source(2, "amqp://c");
        stats.register_source(0, "amqp://a");
        stats.register_source(1, "amqp://b");

        let order: Vec<usize> = stats.snapshot().iter().map(|s| s.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn concurrent_increments_are_thread_safe() {
        use std::thread;

        let stats = Arc::new(TapStats::default());
        let source = stats.register_source(0, "amqp://a");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = source.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        SourceStats::incr(&s.forwarded);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.total_forwarded(), 800);
    }
}
