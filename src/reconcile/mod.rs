//! # Reconciliation
//!
//! Detects drift between the catalog and what a backend physically holds,
//! and repairs it one self-contained [`Issue`](crate::domain::Issue) at a
//! time.
//!
//! - [`diff()`]: pure comparison of expected paths and physical entries
//! - [`ReconciliationEngine`]: report and repair across catalog, state
//!   store and backend

mod diff;
mod engine;

pub use diff::{diff, walk_local, Drift, ExpectedPath, PhysicalEntry};
pub use engine::{ReconciliationEngine, RepairOutcome, RepairResult};
