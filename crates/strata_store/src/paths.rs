//! Path schema of the coordinator tree.
//!
//! Everything durable lives under `<root>/...` and `<root>/replicas/<r>/...`;
//! these builders are the only place path literals appear. Sequential nodes
//! use 10-digit zero-padded suffixes so lexical child order equals numeric
//! order.

use strata_keeper::client::{format_seq, parse_seq};

use crate::part::PartName;

#[derive(Clone, Debug)]
pub struct TablePaths {
    root: String,
}

impl TablePaths {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn metadata(&self) -> String {
        format!("{}/metadata", self.root)
    }

    pub fn replicas(&self) -> String {
        format!("{}/replicas", self.root)
    }

    pub fn replica_root(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}", self.root)
    }

    pub fn is_active(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/is_active", self.root)
    }

    pub fn host(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/host", self.root)
    }

    pub fn parts(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/parts", self.root)
    }

    pub fn part(&self, replica: &str, name: &PartName) -> String {
        format!("{}/replicas/{replica}/parts/{name}", self.root)
    }

    pub fn part_checksums(&self, replica: &str, name: &PartName) -> String {
        format!("{}/replicas/{replica}/parts/{name}/checksums", self.root)
    }

    pub fn log_root(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/log", self.root)
    }

    /// Prefix handed to sequential creates; the coordinator appends the index.
    pub fn log_seq_prefix(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/log/log-", self.root)
    }

    pub fn log_entry(&self, replica: &str, index: u64) -> String {
        format!("{}/replicas/{replica}/log/log-{}", self.root, format_seq(index))
    }

    pub fn log_pointers(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/log_pointers", self.root)
    }

    /// Next log index `replica` will read from `peer`.
    pub fn log_pointer(&self, replica: &str, peer: &str) -> String {
        format!("{}/replicas/{replica}/log_pointers/{peer}", self.root)
    }

    pub fn queue_root(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/queue", self.root)
    }

    pub fn queue_seq_prefix(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/queue/queue-", self.root)
    }

    pub fn queue_entry(&self, replica: &str, child: &str) -> String {
        format!("{}/replicas/{replica}/queue/{child}", self.root)
    }

    pub fn flags(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/flags", self.root)
    }

    pub fn force_restore_flag(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}/flags/force_restore_data", self.root)
    }

    pub fn blocks(&self) -> String {
        format!("{}/blocks", self.root)
    }

    pub fn block(&self, block_id: &str) -> String {
        format!("{}/blocks/{block_id}", self.root)
    }

    pub fn block_number_field(&self, block_id: &str) -> String {
        format!("{}/blocks/{block_id}/number", self.root)
    }

    pub fn block_checksums_field(&self, block_id: &str) -> String {
        format!("{}/blocks/{block_id}/checksums", self.root)
    }

    pub fn block_numbers(&self) -> String {
        format!("{}/block_numbers", self.root)
    }

    pub fn block_numbers_month(&self, month: &str) -> String {
        format!("{}/block_numbers/{month}", self.root)
    }

    pub fn block_number(&self, month: &str, number: u64) -> String {
        format!("{}/block_numbers/{month}/block-{}", self.root, format_seq(number))
    }

    pub fn block_number_seq_prefix(&self, month: &str) -> String {
        format!("{}/block_numbers/{month}/block-", self.root)
    }

    pub fn leader_election(&self) -> String {
        format!("{}/leader_election", self.root)
    }

    pub fn temp(&self) -> String {
        format!("{}/temp", self.root)
    }
}

/// Index of a `log-XXXXXXXXXX` child name.
pub fn log_index(child: &str) -> Option<u64> {
    parse_seq(child, "log-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_compose_under_root() {
        let paths = TablePaths::new("/tables/visits/");
        assert_eq!(paths.root(), "/tables/visits");
        assert_eq!(paths.is_active("r1"), "/tables/visits/replicas/r1/is_active");
        assert_eq!(paths.log_entry("r1", 7), "/tables/visits/replicas/r1/log/log-0000000007");
        assert_eq!(paths.log_pointer("r2", "r1"), "/tables/visits/replicas/r2/log_pointers/r1");
        assert_eq!(
            paths.block_number("202608", 12),
            "/tables/visits/block_numbers/202608/block-0000000012"
        );
    }

    #[test]
    fn log_index_parses_sequential_suffix() {
        assert_eq!(log_index("log-0000000042"), Some(42));
        assert_eq!(log_index("queue-0000000042"), None);
    }
}
