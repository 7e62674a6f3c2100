use crate::consts::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuadError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Persist: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Bad magic or version")]
    BadHeader,

    #[error("Corrupt record")]
    Corrupt,

    #[error("Unsupported kind")]
    Unsupported,

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Unknown node #{0}")]
    UnknownNode(NodeId),

    #[error("Invalid node value: {0}")]
    InvalidValue(String),

    #[error("Limit values have no lexical form")]
    NoLexicalForm,

    #[error("Duplicate variable found during resolution: {0}")]
    RepeatingConstraint(String),

    #[error("Invalid constraint element: {0}")]
    InvalidConstraint(String),

    #[error("Prefix error: {0}")]
    Prefix(String),

    #[error("Internal consistency failure: {0}")]
    Consistency(String),

    #[error("Relation already closed")]
    AlreadyClosed,

    #[error("Suffix truncation is not supported")]
    SuffixTruncation,

    #[error("Unknown comparator id {0}")]
    UnknownComparator(u32),

    #[error("Transaction: {0}")]
    Transaction(String),

    #[error("Transaction rolled back: {0}")]
    RolledBack(String),

    #[error("Another write transaction is active")]
    WriterBusy,

    #[error("Backup line {line}: {msg}")]
    Backup { line: usize, msg: String },
}

pub type Result<T> = std::result::Result<T, QuadError>;

impl QuadError {
    pub(crate) fn txn(msg: impl Into<String>) -> Self {
        QuadError::Transaction(msg.into())
    }

    /// Logs and builds a consistency failure.
    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "consistency failure");
        QuadError::Consistency(msg)
    }
}
