//! Domain models for dataprov
//!
//! Contains identities, layouts and states without any I/O concerns.

mod file;
mod issue;
mod shard;
mod state;

pub use file::{is_legal_filename, is_legal_sub_path, BackendId, FileId, FileKind, IdError, RegisteredFile};
pub use issue::{Issue, IssueKind, IssueTarget, RepairAction, Severity};
pub use shard::{shard_key, ShardingScheme, FAN_OUT};
pub use state::{SyncKey, SyncRecord, SyncState};
