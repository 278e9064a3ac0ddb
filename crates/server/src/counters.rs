//! Ambient observability: plain atomic counters logged periodically and
//! exposed for tests, rather than a full metrics pipeline — the original
//! spec's Non-goals exclude a metrics *surface*, but the engine still
//! needs to know when it is dropping work.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub queries_received: AtomicU64,
    pub queries_forwarded: AtomicU64,
    pub answered_locally: AtomicU64,
    pub replies_relayed: AtomicU64,
    /// Replies that didn't correlate to any live forwarding-table entry
    /// (late, duplicate, or spoofed).
    pub replies_unmatched: AtomicU64,
    /// Replies dropped for failing the bogus-answer/recursion checks.
    pub replies_bogus: AtomicU64,
    /// `get_new` evicted a live-but-stale entry to make room.
    pub table_abandoned: AtomicU64,
    /// `get_new` found no slot at all (every live entry still fresh).
    pub table_full: AtomicU64,
    /// `allocate_id` exhausted its retry budget.
    pub id_collisions_exhausted: AtomicU64,
    pub tcp_connections: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            queries_received: self.queries_received.load(Ordering::Relaxed),
            queries_forwarded: self.queries_forwarded.load(Ordering::Relaxed),
            answered_locally: self.answered_locally.load(Ordering::Relaxed),
            replies_relayed: self.replies_relayed.load(Ordering::Relaxed),
            replies_unmatched: self.replies_unmatched.load(Ordering::Relaxed),
            replies_bogus: self.replies_bogus.load(Ordering::Relaxed),
            table_abandoned: self.table_abandoned.load(Ordering::Relaxed),
            table_full: self.table_full.load(Ordering::Relaxed),
            id_collisions_exhausted: self.id_collisions_exhausted.load(Ordering::Relaxed),
            tcp_connections: self.tcp_connections.load(Ordering::Relaxed),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub queries_received: u64,
    pub queries_forwarded: u64,
    pub answered_locally: u64,
    pub replies_relayed: u64,
    pub replies_unmatched: u64,
    pub replies_bogus: u64,
    pub table_abandoned: u64,
    pub table_full: u64,
    pub id_collisions_exhausted: u64,
    pub tcp_connections: u64,
}
