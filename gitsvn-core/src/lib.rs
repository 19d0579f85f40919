//! gitsvn core library.
//!
//! The Git-backed versioned filesystem behind the SVN protocol surface:
//! - Object database access (loose git objects, ref compare-and-swap)
//! - Revision index (SVN revision <-> git commit, changed paths)
//! - Content filter chains and property synthesis from `.gitattributes`
//! - Path-oriented read API (stat, list, read, log, blame, history)
//! - Editor-driven commit builder
//! - Lock table, authentication and authorization providers

pub mod auth;
pub mod authz;
pub mod commit;
pub mod db;
pub mod error;
pub mod filter;
pub mod gitprops;
pub mod locks;
pub mod odb;
pub mod paths;
pub mod revindex;
pub mod treewalk;
pub mod vfs;

pub use auth::{AuthAttempt, AuthOutcome, AuthProvider, AnonymousProvider, PasswordFileProvider};
pub use authz::{AccessLevel, AllowAll, AuthzProvider, Operation, SvnAuthz};
pub use commit::{CommitOptions, CommitResult, EditorSession};
pub use db::Database;
pub use error::{RepoError, Result};
pub use filter::{FilterChain, FilterContext, FilterKind};
pub use gitprops::{props, PropertyMap};
pub use locks::{Lock, LockTable};
pub use odb::{CasOutcome, LooseStore, MemoryStore, ObjectStore};
pub use revindex::{ChangeAction, ChangedPath, RevisionIndex, RevisionRecord};
pub use vfs::{svn_date, BlameLine, Dirent, FileRev, GitFs, LogEntry, Node, NodeKind};
