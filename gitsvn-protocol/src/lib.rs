//! Wire-level building blocks for the `svn://` (`ra_svn`) protocol.
//!
//! This crate contains everything below the session layer:
//! - The tuple/list/word/number/string item grammar (encode and decode)
//! - Buffered async reader/writer over arbitrary byte streams
//! - The svndiff0/svndiff1 binary delta format
//! - Canonical SVN error codes used when framing failures

pub mod error;
pub mod item;
pub mod reader;
pub mod svndiff;
pub mod writer;

pub use error::{codes, WireError};
pub use item::Item;
pub use reader::ItemReader;
pub use svndiff::{DeltaApplier, SvndiffEncoder, SvndiffVersion};
pub use writer::ItemWriter;

/// Convenience alias for wire-level results.
pub type Result<T> = std::result::Result<T, WireError>;
