#![warn(missing_docs)]

//! Archive and output modules for the logvault daemon.
//!
//! `archive` holds the `file` module: the filesystem watcher, the per-file
//! state machine and the bounded worker pools. `cos` is the `output.cos`
//! module that ships files to a COS-style object store, and `store` is the
//! thin put-side client abstraction behind it.

pub mod archive;
mod cache;
pub mod cos;
pub mod store;

pub use archive::{CollectRule, FileArchive, TerminalPolicy, DISCARD_REASON_MAX_RETRY};
pub use cos::{
    archive_prefix, ArchiveRule, CosOutput, UploadRule, CODE_CALL_API_FAILED,
    CODE_COMPRESS_FAILED, CODE_INVALID_PARAM, CODE_SUCCESS,
};
pub use store::{HttpObjectStore, MockObjectStore, MockStoreStats, ObjectPutter, StoreError};
