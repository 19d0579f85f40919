use thiserror::Error;

/// Errors raised below the session layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// The byte stream deviated from the item grammar. Fatal to the
    /// connection; there is no way to resynchronize.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer closed the stream mid-item.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A svndiff stream could not be decoded or applied.
    #[error("invalid svndiff data: {0}")]
    Svndiff(String),
}

impl WireError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        WireError::MalformedFrame(msg.into())
    }
}

/// Canonical SVN error codes, as sent in `failure` frames.
///
/// Values match Subversion's `svn_error_codes.h`.
pub mod codes {
    pub const SVN_ERR_FS_GENERAL: u64 = 160001;
    pub const SVN_ERR_FS_NO_SUCH_REVISION: u64 = 160006;
    pub const SVN_ERR_FS_NOT_FOUND: u64 = 160013;
    pub const SVN_ERR_FS_NOT_DIRECTORY: u64 = 160016;
    pub const SVN_ERR_FS_NOT_FILE: u64 = 160017;
    pub const SVN_ERR_FS_ALREADY_EXISTS: u64 = 160020;
    pub const SVN_ERR_FS_TXN_OUT_OF_DATE: u64 = 160028;
    pub const SVN_ERR_FS_PATH_ALREADY_LOCKED: u64 = 160035;
    pub const SVN_ERR_FS_NO_SUCH_LOCK: u64 = 160040;
    pub const SVN_ERR_RA_NOT_AUTHORIZED: u64 = 170001;
    pub const SVN_ERR_RA_SVN_UNKNOWN_CMD: u64 = 210001;
    pub const SVN_ERR_RA_SVN_CONNECTION_CLOSED: u64 = 210003;
    pub const SVN_ERR_RA_SVN_MALFORMED_DATA: u64 = 210004;
    pub const SVN_ERR_RA_SVN_REPOS_NOT_FOUND: u64 = 210005;
    pub const SVN_ERR_RA_SVN_BAD_VERSION: u64 = 210006;
    pub const SVN_ERR_RA_SVN_EDIT_ABORTED: u64 = 210007;
    pub const SVN_ERR_BAD_PROPERTY_VALUE: u64 = 125005;
    pub const SVN_ERR_CHECKSUM_MISMATCH: u64 = 200014;
    pub const SVN_ERR_UNSUPPORTED_FEATURE: u64 = 200007;
    pub const SVN_ERR_BASE: u64 = 200001;
}
