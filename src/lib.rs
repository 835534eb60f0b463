//! dataprov - multi-backend file storage with a local cache
//!
//! Registered files live on one of several storage backends (local disk,
//! remote hosts over ssh, object stores, read-only content repositories).
//! Each backend keeps a sharded local cache whose per-file sync state is
//! tracked in a shared store, so unrelated processes can fill, push and
//! erase the same files without stepping on each other. Reconciliation
//! finds and repairs drift between the catalog and what a backend holds.

pub mod backend;
pub mod cli;
pub mod domain;
pub mod error;
pub mod provider;
pub mod reconcile;
pub mod storage;
pub mod workspace;

pub use domain::{BackendId, FileId, RegisteredFile, ShardingScheme, SyncState};
pub use error::{Error, Result};
pub use provider::Provider;
pub use workspace::Workspace;
