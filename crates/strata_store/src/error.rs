//! Error taxonomy of the replication layer.

use strata_keeper::KeeperError;

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Coordinator transport or logical failure; `SessionExpired` inside is
    /// what the session supervisor reacts to.
    #[error(transparent)]
    Keeper(#[from] KeeperError),

    #[error("replica {0} appears to be already active; if you are sure it is not, retry in a minute or remove its is_active node manually")]
    ReplicaAlreadyActive(String),

    /// Normal, retriable: the part is committed but nobody serves it yet.
    #[error("no active replica has part {0}")]
    NoReplicaHasPart(String),

    #[error("the local set of parts does not look like the set in the coordinator: {0}")]
    TooManyUnexpectedParts(String),

    #[error("unsupported log entry format: {0:?}")]
    UnsupportedLogFormat(String),

    #[error("malformed log entry: {0}")]
    MalformedLogEntry(String),

    #[error("bad part name {0:?}")]
    BadPartName(String),

    #[error("table is in read-only mode")]
    TableReadOnly,

    #[error("metadata mismatch for {field}: coordinator has {expected:?}, local table has {found:?}")]
    MetadataMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("unexpected column in coordinator metadata: expected {expected:?}, found {found:?}")]
    UnknownColumn { expected: String, found: String },

    #[error("checksums of part {part} differ from replica {replica}")]
    ChecksumMismatch { part: String, replica: String },

    #[error("insert id {0} was already used for a block with different contents")]
    DuplicateInsertId(String),

    /// Retriable: an in-flight merge was cancelled by shutdown.
    #[error("merge was cancelled")]
    MergeCancelled,

    #[error("fetching part {part} from {host} failed: {reason}")]
    FetchFailed {
        part: String,
        host: String,
        reason: String,
    },

    #[error("cannot read the system clock")]
    Clock,

    #[error("local part store error: {0}")]
    Storage(String),
}

impl ReplicationError {
    /// Conditions that are part of normal operation and logged at info
    /// rather than error.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ReplicationError::NoReplicaHasPart(_) | ReplicationError::MergeCancelled
        )
    }
}

impl From<fjall::Error> for ReplicationError {
    fn from(err: fjall::Error) -> Self {
        ReplicationError::Storage(err.to_string())
    }
}
