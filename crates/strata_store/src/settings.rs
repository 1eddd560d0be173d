//! Tuning knobs for the replication control plane.

use std::time::Duration;

/// Configuration for one replicated table.
///
/// Periods are configurable so tests can shrink them; every background sleep
/// still observes shutdown at least once per second regardless of the period.
#[derive(Clone, Debug)]
pub struct ReplicationSettings {
    /// How many recent insert blocks keep deduplication records under
    /// `/blocks`. Once a block falls out of this window, a duplicate insert
    /// reusing its insert id is accepted again.
    pub replicated_deduplication_window: usize,
    /// Leader stops proposing merges while at least this many merge entries
    /// sit in the queue.
    pub max_replicated_merges_in_queue: usize,
    /// Upper bound on parts merged by one proposal.
    pub max_parts_to_merge_at_once: usize,
    /// The unforced planner pass only proposes runs at least this long; the
    /// relaxed second pass accepts any pair.
    pub merge_min_parts: usize,
    /// Inputs larger than this (rows x index granularity) count as big
    /// merges and make the leader back off.
    pub big_merge_threshold_bytes: u64,
    /// How long a superseded part lingers locally before it is dropped and
    /// its coordinator record removed.
    pub old_parts_lifetime: Duration,

    /// Reconciliation sanity gate: more surprises than this fail startup
    /// unless the operator planted the force_restore_data flag.
    pub max_unexpected_parts: usize,
    pub max_covered_unexpected_parts: usize,
    pub max_obsolete_parts: usize,
    pub max_missing_parts: usize,

    /// Period of the queue-updating task (log pull + old-part cleanup).
    pub queue_update_period: Duration,
    /// Idle period of the leader's merge-selection loop; committing a part
    /// wakes it early.
    pub merge_selecting_period: Duration,
    /// Period of log truncation and deduplication-window cleanup.
    pub cleanup_period: Duration,
    /// How often the session supervisor probes for expiration.
    pub supervisor_check_period: Duration,
    /// Poll interval while waiting for peers to acknowledge a new replica.
    pub bootstrap_ack_poll: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            replicated_deduplication_window: 100,
            max_replicated_merges_in_queue: 6,
            max_parts_to_merge_at_once: 10,
            merge_min_parts: 4,
            big_merge_threshold_bytes: 25 * 1024 * 1024,
            old_parts_lifetime: Duration::from_secs(480),
            max_unexpected_parts: 2,
            max_covered_unexpected_parts: 2,
            max_obsolete_parts: 20,
            max_missing_parts: 2,
            queue_update_period: Duration::from_secs(5),
            merge_selecting_period: Duration::from_secs(5),
            cleanup_period: Duration::from_secs(60),
            supervisor_check_period: Duration::from_secs(2),
            bootstrap_ack_poll: Duration::from_secs(5),
        }
    }
}

impl ReplicationSettings {
    /// Settings scaled down for integration tests: short periods, no
    /// old-part grace.
    pub fn fast() -> Self {
        Self {
            old_parts_lifetime: Duration::from_millis(0),
            queue_update_period: Duration::from_millis(50),
            merge_selecting_period: Duration::from_millis(50),
            cleanup_period: Duration::from_millis(100),
            supervisor_check_period: Duration::from_millis(25),
            bootstrap_ack_poll: Duration::from_millis(25),
            ..Self::default()
        }
    }
}
