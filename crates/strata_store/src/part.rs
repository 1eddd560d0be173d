//! Part naming and the maximal-cover part set.
//!
//! A part name encodes a month bucket and a contiguous block-number range:
//! `<YYYYMM>_<left>_<right>_<level>`. Part `q` covers part `p` when they
//! share a month and `q`'s range contains `p`'s. Merges always produce a
//! part covering all of its inputs, so the set of "current" parts at any
//! point is the maximal-cover reduction of everything ever committed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReplicationError;

/// Structured form of a part name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartName {
    /// Month bucket, `YYYYMM`.
    pub month: String,
    /// First block number covered, inclusive.
    pub left: u64,
    /// Last block number covered, inclusive.
    pub right: u64,
    /// Merge depth; single-block inserts are level 0.
    pub level: u32,
}

impl PartName {
    pub fn new(month: impl Into<String>, left: u64, right: u64, level: u32) -> Self {
        Self {
            month: month.into(),
            left,
            right,
            level,
        }
    }

    /// Whether `self` covers `other` (inclusive on both ends).
    pub fn covers(&self, other: &PartName) -> bool {
        self.month == other.month && self.left <= other.left && self.right >= other.right
    }

    /// Name of the part produced by merging `parts`, which must be sorted
    /// and share one month.
    pub fn merged(parts: &[PartName]) -> PartName {
        let level = parts.iter().map(|p| p.level).max().unwrap_or(0) + 1;
        PartName {
            month: parts[0].month.clone(),
            left: parts[0].left,
            right: parts[parts.len() - 1].right,
            level,
        }
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.month, self.left, self.right, self.level)
    }
}

impl FromStr for PartName {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ReplicationError::BadPartName(s.to_string());
        let mut fields = s.split('_');
        let month = fields.next().ok_or_else(bad)?;
        if month.len() != 6 || !month.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let left: u64 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let right: u64 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let level: u32 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if fields.next().is_some() || left > right {
            return Err(bad());
        }
        Ok(PartName {
            month: month.to_string(),
            left,
            right,
            level,
        })
    }
}

/// A set of part names reduced to its maximal covering elements.
///
/// Adding a part that is already covered is a no-op; adding a part that
/// covers existing members absorbs them. Members of one month never overlap
/// without nesting, so at most one member can contain any given name.
#[derive(Clone, Debug, Default)]
pub struct ActivePartSet {
    /// month -> left -> part, at most one entry per distinct left bound.
    by_month: BTreeMap<String, BTreeMap<u64, PartName>>,
}

impl ActivePartSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `name`, keeping the set maximal. Returns whether the set
    /// changed (false when an existing member already covers `name`).
    pub fn add(&mut self, name: PartName) -> bool {
        if self.containing_part(&name).is_some() {
            return false;
        }
        let month = self.by_month.entry(name.month.clone()).or_default();
        let absorbed: Vec<u64> = month
            .range(name.left..=name.right)
            .filter(|(_, p)| name.covers(p))
            .map(|(left, _)| *left)
            .collect();
        for left in absorbed {
            month.remove(&left);
        }
        month.insert(name.left, name);
        true
    }

    /// The member covering `name`, if any (possibly `name` itself).
    pub fn containing_part(&self, name: &PartName) -> Option<PartName> {
        let month = self.by_month.get(&name.month)?;
        let (_, candidate) = month.range(..=name.left).next_back()?;
        candidate.covers(name).then(|| candidate.clone())
    }

    /// Members in (month, left) order.
    pub fn parts(&self) -> Vec<PartName> {
        self.by_month
            .values()
            .flat_map(|month| month.values().cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        self.by_month.clear();
    }

    pub fn len(&self) -> usize {
        self.by_month.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_month.is_empty()
    }
}
