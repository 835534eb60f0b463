//! # Storage Layer
//!
//! Local state shared by every backend: configuration, the file catalog,
//! the cross-process sync-state store and the sharded cache.
//!
//! ## Storage Formats
//!
//! | Data | Format | Location |
//! |------|--------|----------|
//! | Catalog | JSONL (one JSON per line) | `.dataprov/catalog.jsonl` |
//! | Sync state | SQLite (WAL) | `.dataprov/state.db` |
//! | Config | TOML | `.dataprov/config.toml` |
//! | Cache | Sharded directory tree | `.dataprov/cache/<backend>/` |
//!
//! ## Concurrency Safety
//!
//! - [`JsonlCatalog`] uses file locking (`fs2`); writes are atomic (temp file + rename)
//! - [`SqliteStateStore`] runs every compare-and-set in a `BEGIN IMMEDIATE` transaction
//! - [`SyncStateTracker`] serializes state changes per (file, backend) across processes
//!
//! ## Workspace Structure
//!
//! ```text
//! .dataprov/
//! ├── config.toml           # Backends and sync timing
//! ├── catalog.jsonl         # Registered files
//! ├── state.db              # Sync states and locks
//! ├── cache/                # One sharded tree per backend
//! ├── ssh/                  # ssh control sockets
//! └── .gitignore            # Ignores state, cache and sockets
//! ```

pub(crate) mod cache;
mod catalog;
mod config;
mod state_store;
mod tracker;

pub use cache::{prune_empty_ancestors, LocalCacheManager};
pub use catalog::{name_taken, same_slot, Catalog, JsonlCatalog};
pub use config::{
    BackendConfig, BackendKind, Config, ConfigError, GlobalConfig, OutputFormat, SyncSettings,
    WorkspaceConfig, WORKSPACE_DIR,
};
pub use state_store::{Release, SqliteStateStore, StateStore};
pub use tracker::{Finish, SyncStateTracker};
