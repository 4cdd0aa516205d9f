//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Process-lifetime counters, shared across tasks.
///
/// Plain relaxed atomics: the counts are observability, nothing orders on
/// them.
#[derive(Debug)]
pub struct RelayStats {
    duplicates: AtomicU64,
    forwarded: AtomicU64,
    pings: AtomicU64,
    pongs: AtomicU64,
    missed_pongs: AtomicU64,
    max_queue_depth: AtomicU64,
    started_at: DateTime<Utc>,
}

/// Serializable point-in-time view, for `@stats` and the debug server.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub duplicates: u64,
    pub forwarded: u64,
    pub pings: u64,
    pub pongs: u64,
    pub missed_pongs: u64,
    pub max_queue_depth: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            duplicates: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            pings: AtomicU64::new(0),
            pongs: AtomicU64::new(0),
            missed_pongs: AtomicU64::new(0),
            max_queue_depth: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn incr_duplicates(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_pings(&self) {
        self.pings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_pongs(&self) {
        self.pongs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_missed_pongs(&self) {
        self.missed_pongs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_queue_depth(&self, depth: usize) {
        self.max_queue_depth
            .fetch_max(depth as u64, Ordering::Relaxed);
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn missed_pongs(&self) -> u64 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Utc::now();
        StatsSnapshot {
            duplicates: self.duplicates.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            pings: self.pings.load(Ordering::Relaxed),
            pongs: self.pongs.load(Ordering::Relaxed),
            missed_pongs: self.missed_pongs.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_seconds: (now - self.started_at).num_seconds(),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RelayStats::new();
        stats.incr_duplicates();
        stats.incr_duplicates();
        stats.incr_forwarded();
        stats.note_queue_depth(3);
        stats.note_queue_depth(7);
        stats.note_queue_depth(5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.duplicates, 2);
        assert_eq!(snapshot.forwarded, 1);
        assert_eq!(snapshot.max_queue_depth, 7);
        assert!(snapshot.uptime_seconds >= 0);
    }
}
