//! Text codec for replication log and queue entries.
//!
//! Entries travel through the coordinator as version-tagged line-oriented
//! text; the format is a wire-compatibility boundary and must stay symmetric
//! (`parse(to_text(e)) == e`).

use std::fmt;

use crate::error::ReplicationError;
use crate::part::PartName;

const FORMAT_HEADER: &str = "format version: 1";
const SOURCE_PREFIX: &str = "source replica: ";

/// What a log entry instructs a replica to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogAction {
    /// The part should exist here: fetch it from a peer, or otherwise obtain
    /// a cover of it.
    GetPart { new_part_name: PartName },
    /// Merge the listed parts into one.
    MergeParts {
        parts_to_merge: Vec<PartName>,
        new_part_name: PartName,
    },
}

/// One replication log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Replica that originated the entry; empty for bootstrap-generated
    /// fetches.
    pub source_replica: String,
    pub action: LogAction,
}

impl LogEntry {
    pub fn get_part(source_replica: impl Into<String>, new_part_name: PartName) -> Self {
        Self {
            source_replica: source_replica.into(),
            action: LogAction::GetPart { new_part_name },
        }
    }

    pub fn merge_parts(
        source_replica: impl Into<String>,
        parts_to_merge: Vec<PartName>,
        new_part_name: PartName,
    ) -> Self {
        Self {
            source_replica: source_replica.into(),
            action: LogAction::MergeParts {
                parts_to_merge,
                new_part_name,
            },
        }
    }

    /// The part this entry promises will exist once executed.
    pub fn new_part_name(&self) -> &PartName {
        match &self.action {
            LogAction::GetPart { new_part_name } => new_part_name,
            LogAction::MergeParts { new_part_name, .. } => new_part_name,
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self.action, LogAction::MergeParts { .. })
    }

    pub fn to_text(&self) -> String {
        self.to_string()
    }

    pub fn parse(text: &str) -> Result<Self, ReplicationError> {
        let malformed = |what: &str| ReplicationError::MalformedLogEntry(what.to_string());
        let mut lines = text.lines();

        match lines.next() {
            Some(FORMAT_HEADER) => {}
            Some(other) => return Err(ReplicationError::UnsupportedLogFormat(other.to_string())),
            None => return Err(malformed("empty entry")),
        }
        let source_replica = lines
            .next()
            .and_then(|line| line.strip_prefix(SOURCE_PREFIX))
            .ok_or_else(|| malformed("missing source replica"))?
            .to_string();

        let action = match lines.next() {
            Some("get") => {
                let name = lines.next().ok_or_else(|| malformed("missing part name"))?;
                LogAction::GetPart {
                    new_part_name: name.parse()?,
                }
            }
            Some("merge") => {
                let mut parts_to_merge = Vec::new();
                let new_part_name = loop {
                    let line = lines
                        .next()
                        .ok_or_else(|| malformed("merge entry without terminator"))?;
                    if line == "into" {
                        let name = lines.next().ok_or_else(|| malformed("missing merged name"))?;
                        break name.parse()?;
                    }
                    parts_to_merge.push(line.parse()?);
                };
                if parts_to_merge.is_empty() {
                    return Err(malformed("merge entry without inputs"));
                }
                LogAction::MergeParts {
                    parts_to_merge,
                    new_part_name,
                }
            }
            Some(other) => return Err(malformed(&format!("unknown action {other:?}"))),
            None => return Err(malformed("missing action")),
        };

        if lines.next().is_some() {
            return Err(malformed("trailing data"));
        }
        Ok(LogEntry {
            source_replica,
            action,
        })
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{FORMAT_HEADER}")?;
        writeln!(f, "{SOURCE_PREFIX}{}", self.source_replica)?;
        match &self.action {
            LogAction::GetPart { new_part_name } => {
                writeln!(f, "get")?;
                writeln!(f, "{new_part_name}")?;
            }
            LogAction::MergeParts {
                parts_to_merge,
                new_part_name,
            } => {
                writeln!(f, "merge")?;
                for part in parts_to_merge {
                    writeln!(f, "{part}")?;
                }
                writeln!(f, "into")?;
                writeln!(f, "{new_part_name}")?;
            }
        }
        Ok(())
    }
}

/// A log entry sitting in this replica's queue, with the coordinator node
/// that backs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub entry: LogEntry,
    /// Child name under `queue/`, e.g. `queue-0000000003`.
    pub znode_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PartName {
        s.parse().unwrap()
    }

    #[test]
    fn get_entry_roundtrip() {
        let entry = LogEntry::get_part("r1", p("202608_0_0_0"));
        let text = entry.to_text();
        assert_eq!(text, "format version: 1\nsource replica: r1\nget\n202608_0_0_0\n");
        assert_eq!(LogEntry::parse(&text).unwrap(), entry);
    }

    #[test]
    fn merge_entry_roundtrip() {
        let entry = LogEntry::merge_parts(
            "r2",
            vec![p("202608_0_0_0"), p("202608_1_1_0"), p("202608_2_2_0")],
            p("202608_0_2_1"),
        );
        let text = entry.to_text();
        assert_eq!(
            text,
            "format version: 1\nsource replica: r2\nmerge\n202608_0_0_0\n202608_1_1_0\n202608_2_2_0\ninto\n202608_0_2_1\n"
        );
        assert_eq!(LogEntry::parse(&text).unwrap(), entry);
    }

    #[test]
    fn empty_source_replica_roundtrip() {
        let entry = LogEntry::get_part("", p("202608_5_5_0"));
        assert_eq!(LogEntry::parse(&entry.to_text()).unwrap(), entry);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = LogEntry::parse("format version: 2\nsource replica: r1\nget\n202608_0_0_0\n")
            .unwrap_err();
        assert!(matches!(err, ReplicationError::UnsupportedLogFormat(_)));
    }

    #[test]
    fn merge_without_terminator_is_rejected() {
        let err = LogEntry::parse("format version: 1\nsource replica: r1\nmerge\n202608_0_0_0\n")
            .unwrap_err();
        assert!(matches!(err, ReplicationError::MalformedLogEntry(_)));
    }

    #[test]
    fn part_named_into_cannot_be_smuggled() {
        // "into" terminates the input list; a malformed part name after it
        // must fail loudly rather than parse.
        let err = LogEntry::parse("format version: 1\nsource replica: r1\nmerge\ninto\ninto\n")
            .unwrap_err();
        assert!(matches!(err, ReplicationError::MalformedLogEntry(_) | ReplicationError::BadPartName(_)));
    }
}
