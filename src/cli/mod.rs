//! # Command-Line Interface
//!
//! User-facing CLI commands and output formatting.
//!
//! ## Command Groups
//!
//! | Group | Purpose | Examples |
//! |-------|---------|----------|
//! | Core | Workspace setup | `init` |
//! | Backend | Inspect backends | `backend list`, `backend status`, `backend ls` |
//! | File | Catalog and transfers | `file register`, `file put`, `file get`, `file move` |
//! | Check | Reconciliation | `check main`, `check main --repair --every 600` |
//!
//! ## Output Formats
//!
//! All commands support the `--format` flag:
//! - `text` (default) - Human-readable output
//! - `json` - Machine-parseable JSON
//!
//! The default comes from `default_format` in the global configuration.
//!
//! ## Logging
//!
//! Diagnostics go to stderr through `tracing`. `RUST_LOG` selects the
//! level; `--verbose` turns on debug output for dataprov itself.
//!
//! ## Entry Point
//!
//! Call [`run()`] to parse arguments and execute the appropriate command.

mod app;
mod backend_cmd;
mod check_cmd;
mod file_cmd;
mod output;

pub use app::{run, Cli, Commands};
pub use output::{Output, OutputFormat};
