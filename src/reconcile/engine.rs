//! Report and repair drift on one backend

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::backend::StorageBackend;
use crate::domain::{Issue, IssueKind, IssueTarget, SyncKey};
use crate::error::{Error, Result};
use crate::storage::{Catalog, SyncStateTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    Repaired,
    /// Someone (or an earlier repair) already fixed it
    AlreadyResolved,
}

/// Result of one repair within [`ReconciliationEngine::repair_all`]
#[derive(Debug, Serialize)]
pub struct RepairResult {
    pub issue: Issue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RepairOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ReconciliationEngine {
    catalog: Arc<dyn Catalog>,
    tracker: Arc<SyncStateTracker>,
}

impl ReconciliationEngine {
    pub fn new(catalog: Arc<dyn Catalog>, tracker: Arc<SyncStateTracker>) -> Self {
        Self { catalog, tracker }
    }

    /// Lists every Missing, Orphan and InterruptedSync issue on `backend`
    pub fn report(&self, backend: &dyn StorageBackend) -> Result<Vec<Issue>> {
        let backend_id = backend.config().id;
        let files = self.catalog.files_on_backend(backend_id)?;

        // Flagged files still own their paths, but are already handled
        let mut issues: Vec<Issue> = backend
            .report(&files)?
            .into_iter()
            .filter(|issue| match (&issue.kind, &issue.target) {
                (IssueKind::Missing, IssueTarget::File(id)) => !files
                    .iter()
                    .any(|f| f.id == *id && f.flagged_for_removal),
                _ => true,
            })
            .collect();

        let now = Utc::now();
        for record in self.tracker.store().records_for_backend(backend_id)? {
            if record.state.is_syncing() && record.has_stale_lock_at(now) {
                issues.push(Issue::interrupted(
                    backend_id,
                    record.file_id,
                    format!(
                        "file {} was left {} by {}",
                        record.file_id,
                        record.state,
                        record.lock_holder.as_deref().unwrap_or("unknown holder")
                    ),
                ));
            }
        }

        tracing::info!(
            backend = %backend.config().name,
            files = files.len(),
            issues = issues.len(),
            "Reconciliation report"
        );
        Ok(issues)
    }

    /// Applies the suggested action of `issue`. Repairing an issue that is
    /// already fixed is not an error.
    pub fn repair(&self, backend: &dyn StorageBackend, issue: &Issue) -> Result<RepairOutcome> {
        if issue.backend_id != backend.config().id {
            return Err(Error::Integrity(format!(
                "issue belongs to backend {}, not '{}'",
                issue.backend_id,
                backend.config().name
            )));
        }

        let repaired = match (issue.kind, &issue.target) {
            (IssueKind::Missing, IssueTarget::File(id)) => self.catalog.flag_for_removal(*id)?,
            (IssueKind::InterruptedSync, IssueTarget::File(id)) => self
                .tracker
                .recover(SyncKey::new(*id, issue.backend_id))?
                .is_some(),
            (IssueKind::Orphan, _) => backend.repair(issue)?,
            (kind, target) => {
                return Err(Error::Unsupported(format!(
                    "cannot repair {} issue targeting {:?}",
                    kind, target
                )))
            }
        };

        tracing::debug!(kind = %issue.kind, repaired, "Repaired issue");
        Ok(if repaired {
            RepairOutcome::Repaired
        } else {
            RepairOutcome::AlreadyResolved
        })
    }

    /// Repairs every issue, collecting failures instead of stopping
    pub fn repair_all(&self, backend: &dyn StorageBackend, issues: Vec<Issue>) -> Vec<RepairResult> {
        issues
            .into_iter()
            .map(|issue| match self.repair(backend, &issue) {
                Ok(outcome) => RepairResult {
                    issue,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(kind = %issue.kind, error = %e, "Repair failed");
                    RepairResult {
                        issue,
                        outcome: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect()
    }
}
