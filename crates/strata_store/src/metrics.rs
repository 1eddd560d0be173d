//! Process-wide replication event counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for replication events across all tables in the
/// process.
#[derive(Debug, Default)]
pub struct ProfileEvents {
    pub replicated_part_merges: AtomicU64,
    pub replicated_part_fetches: AtomicU64,
    pub replicated_part_fetches_of_merged: AtomicU64,
    pub replicated_part_failed_fetches: AtomicU64,
    pub obsolete_replicated_parts: AtomicU64,
}

static PROFILE_EVENTS: ProfileEvents = ProfileEvents {
    replicated_part_merges: AtomicU64::new(0),
    replicated_part_fetches: AtomicU64::new(0),
    replicated_part_fetches_of_merged: AtomicU64::new(0),
    replicated_part_failed_fetches: AtomicU64::new(0),
    obsolete_replicated_parts: AtomicU64::new(0),
};

pub fn profile_events() -> &'static ProfileEvents {
    &PROFILE_EVENTS
}

impl ProfileEvents {
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}
