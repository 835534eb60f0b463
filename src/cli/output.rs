//! Output formatting for CLI commands

use serde::Serialize;

use crate::domain::{Issue, IssueTarget};
use crate::reconcile::RepairResult;
use crate::storage;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl From<storage::OutputFormat> for OutputFormat {
    fn from(format: storage::OutputFormat) -> Self {
        match format {
            storage::OutputFormat::Text => OutputFormat::Text,
            storage::OutputFormat::Json => OutputFormat::Json,
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    format: OutputFormat,
    verbose: bool,
}

impl Output {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    /// Reports a completed operation on a file or backend
    pub fn done(&self, message: &str) {
        match self.format {
            OutputFormat::Text => println!("{}", message),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "ok": true, "message": message }));
            }
        }
    }

    /// Reports a failure that does not end the command, such as one failed
    /// pass of a periodic check
    pub fn warn(&self, message: &str) {
        match self.format {
            OutputFormat::Text => eprintln!("warning: {}", message),
            OutputFormat::Json => {
                eprintln!("{}", serde_json::json!({ "ok": false, "warning": message }));
            }
        }
    }

    /// Prints structured data
    pub fn data<T: Serialize>(&self, data: &T) {
        match self.format {
            OutputFormat::Text => {
                if let Ok(json) = serde_json::to_string_pretty(data) {
                    println!("{}", json);
                }
            }
            OutputFormat::Json => {
                if let Ok(json) = serde_json::to_string(data) {
                    println!("{}", json);
                }
            }
        }
    }

    /// Prints a table row (text only, ignored in JSON mode)
    pub fn row(&self, columns: &[&str]) {
        if self.format == OutputFormat::Text {
            println!("{}", columns.join("\t"));
        }
    }

    /// Prints the issues found on `backend`
    pub fn issues(&self, backend: &str, issues: &[Issue]) {
        if self.is_json() {
            self.data(&serde_json::json!({ "backend": backend, "issues": issues }));
            return;
        }
        if issues.is_empty() {
            println!("No issues on '{}'", backend);
            return;
        }

        self.row(&["KIND", "SEVERITY", "TARGET"]);
        for issue in issues {
            let severity = format!("{:?}", issue.severity).to_lowercase();
            self.row(&[issue.kind.as_str(), &severity, &target(issue)]);
        }
        println!();
        println!("{} issue(s) on '{}'", issues.len(), backend);
    }

    /// Prints the outcome of each repair attempted on `backend`
    pub fn repairs(&self, backend: &str, results: &[RepairResult]) {
        if self.is_json() {
            self.data(&serde_json::json!({ "backend": backend, "repairs": results }));
            return;
        }
        if results.is_empty() {
            println!("No issues on '{}'", backend);
            return;
        }

        for result in results {
            let status = match (&result.outcome, &result.error) {
                (Some(outcome), _) => format!("{:?}", outcome).to_lowercase(),
                (None, Some(error)) => format!("failed: {}", error),
                (None, None) => "skipped".to_string(),
            };
            self.row(&[result.issue.kind.as_str(), &target(&result.issue), &status]);
        }
    }

    /// Returns true if using JSON format
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Prints a verbose debug message with context (only when --verbose is set)
    pub fn verbose_ctx(&self, context: &str, message: &str) {
        if self.verbose {
            eprintln!("[verbose:{}] {}", context, message);
        }
    }
}

fn target(issue: &Issue) -> String {
    match &issue.target {
        IssueTarget::Path(path) => path.display().to_string(),
        IssueTarget::Key(key) => key.clone(),
        IssueTarget::File(id) => format!("file {}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackendId, FileId};
    use std::path::PathBuf;

    #[test]
    fn targets_render_by_kind() {
        let backend = BackendId::new(1);
        let path = Issue::orphan_path(backend, PathBuf::from("/data/bob/12"), "x");
        let key = Issue::orphan_key(backend, "7_alpha".into(), "x");
        let file = Issue::missing(backend, FileId::new(7), "x");

        assert_eq!(target(&path), "/data/bob/12");
        assert_eq!(target(&key), "7_alpha");
        assert_eq!(target(&file), "file 7");
    }
}
