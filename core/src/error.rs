use thiserror::Error;

/// Errors surfaced by the journal and its collaborators.
///
/// Convergence retries (locked or shared buffers met in the middle of a
/// commit phase) are never reported here; they are looped on internally.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filesystem is mounted read-only")]
    ReadOnly,

    #[error("Journal has been aborted")]
    Aborted,

    #[error("Transaction too large: requested {requested} credits, maximum is {max}")]
    TransactionTooLarge { requested: u32, max: u32 },

    #[error("No space left in the journal")]
    NoSpace,

    #[error("Handle has no buffer credits left")]
    CreditsExhausted,

    #[error("Corrupt journal: {0}")]
    CorruptJournal(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Block {block} out of range (device has {len} blocks)")]
    OutOfRange { block: u64, len: u64 },

    #[error("Invalid block size: expected {expected}, got {actual}")]
    InvalidBlockSize { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl JournalError {
    /// Whether this error means the journal can no longer persist commits.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JournalError::Aborted | JournalError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;
