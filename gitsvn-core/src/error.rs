use gix_hash::ObjectId;
use thiserror::Error;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors raised by the versioned filesystem and commit builder.
///
/// Per-command kinds are framed to the client with their canonical SVN
/// error code and leave the session alive; `Io`/`Internal` are fatal.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("revision r{0} does not exist")]
    RevisionNotFound(u64),

    #[error("path '{path}' not found in r{rev}")]
    PathNotFound { path: String, rev: u64 },

    #[error("path '{path}' is not a {expected} in r{rev}")]
    NodeKindMismatch {
        path: String,
        rev: u64,
        expected: &'static str,
    },

    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("object {id} is a {actual}, expected {expected}")]
    ObjectKindMismatch {
        id: ObjectId,
        actual: &'static str,
        expected: &'static str,
    },

    #[error("transaction out of date: {}", paths.join(", "))]
    OutOfDate { paths: Vec<String> },

    #[error("property '{name}' on '{path}' conflicts with .gitattributes")]
    PropertyConflict { path: String, name: String },

    #[error("path '{0}' is locked and no matching token was supplied")]
    LockDenied(String),

    #[error("no such lock on path '{0}'")]
    NoSuchLock(String),

    #[error("path '{0}' already exists")]
    AlreadyExists(String),

    #[error("editor protocol violation: {0}")]
    IllegalEditorState(String),

    #[error("checksum mismatch for '{path}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("unknown content filter '{0}'")]
    UnknownFilter(String),

    #[error("content filter failed: {0}")]
    Filter(String),

    #[error("repository data is corrupt: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    /// Canonical SVN error code for failure frames.
    pub fn svn_code(&self) -> u64 {
        use gitsvn_protocol::codes::*;
        match self {
            RepoError::RevisionNotFound(_) => SVN_ERR_FS_NO_SUCH_REVISION,
            RepoError::PathNotFound { .. } => SVN_ERR_FS_NOT_FOUND,
            RepoError::NodeKindMismatch { expected, .. } => {
                if *expected == "file" {
                    SVN_ERR_FS_NOT_FILE
                } else {
                    SVN_ERR_FS_NOT_DIRECTORY
                }
            }
            RepoError::OutOfDate { .. } => SVN_ERR_FS_TXN_OUT_OF_DATE,
            RepoError::PropertyConflict { .. } => SVN_ERR_BAD_PROPERTY_VALUE,
            RepoError::LockDenied(_) => SVN_ERR_FS_PATH_ALREADY_LOCKED,
            RepoError::NoSuchLock(_) => SVN_ERR_FS_NO_SUCH_LOCK,
            RepoError::AlreadyExists(_) => SVN_ERR_FS_ALREADY_EXISTS,
            RepoError::IllegalEditorState(_) => SVN_ERR_RA_SVN_EDIT_ABORTED,
            RepoError::ChecksumMismatch { .. } => SVN_ERR_CHECKSUM_MISMATCH,
            _ => SVN_ERR_FS_GENERAL,
        }
    }

    /// True when the client may continue issuing commands on the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            RepoError::Io(_) | RepoError::Database(_) | RepoError::Corrupt(_)
        )
    }
}
