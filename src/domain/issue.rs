//! Drift between the catalog and a backend
//!
//! Issues are self-contained: each carries the path, object key or file id
//! it refers to, so any subset can be repaired in any order.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{BackendId, FileId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Registered in the catalog, absent from the backend
    Missing,
    /// Present on the backend, not registered
    Orphan,
    /// Left in a `Syncing*` state by a holder whose lock expired
    InterruptedSync,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Missing => "missing",
            IssueKind::Orphan => "orphan",
            IssueKind::InterruptedSync => "interrupted_sync",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Trivial,
    Minor,
    Major,
    Critical,
}

/// What repair will do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Delete the stray path or object
    Delete,
    /// Mark the catalog entry for administrative removal
    FlagForRemoval,
    /// Invalidate the stale sync state
    ResetState,
}

/// What the issue points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum IssueTarget {
    /// Absolute path on the backend host
    Path(PathBuf),
    /// Object key inside the backend's bucket
    Key(String),
    File(FileId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub action: RepairAction,
    pub backend_id: BackendId,
    pub target: IssueTarget,
    pub message: String,
}

impl Issue {
    pub fn missing(backend_id: BackendId, file_id: FileId, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Missing,
            severity: Severity::Major,
            action: RepairAction::FlagForRemoval,
            backend_id,
            target: IssueTarget::File(file_id),
            message: message.into(),
        }
    }

    pub fn orphan_path(backend_id: BackendId, path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Orphan,
            severity: Severity::Major,
            action: RepairAction::Delete,
            backend_id,
            target: IssueTarget::Path(path),
            message: message.into(),
        }
    }

    pub fn orphan_key(backend_id: BackendId, key: String, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Orphan,
            severity: Severity::Major,
            action: RepairAction::Delete,
            backend_id,
            target: IssueTarget::Key(key),
            message: message.into(),
        }
    }

    pub fn interrupted(backend_id: BackendId, file_id: FileId, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::InterruptedSync,
            severity: Severity::Major,
            action: RepairAction::ResetState,
            backend_id,
            target: IssueTarget::File(file_id),
            message: message.into(),
        }
    }
}
