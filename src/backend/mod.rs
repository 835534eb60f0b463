//! # Storage Backends
//!
//! Every backend kind implements [`StorageBackend`], one narrow interface
//! over the places authoritative bytes can live.
//!
//! | Kind | Type | Transfers |
//! |------|------|-----------|
//! | `local` | [`LocalBackend`] | none, the cache is the backend |
//! | `remote_shell` | [`RemoteShellBackend`] | rsync over multiplexed ssh |
//! | `object_store` | [`ObjectStoreBackend`] | one object per file on S3 or a directory store, collections as `.tgz` |
//! | `repository` | [`RepositoryBackend`] | read-only, fetched through a [`ContentResolver`] |
//! | `smart` | [`CompositeBackend`] | local or remote, decided once at construction |
//!
//! Backend operations are raw primitives. They do not take the sync lock;
//! [`Provider`](crate::provider::Provider) runs them under
//! [`SyncStateTracker`](crate::storage::SyncStateTracker).

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{is_legal_sub_path, Issue, RegisteredFile};
use crate::error::{Error, Result};
use crate::storage::{BackendConfig, BackendKind, LocalCacheManager, SyncStateTracker};

mod bucket;
mod composite;
mod identity;
mod local;
mod object;
mod remote;
mod repository;
mod transport;

pub use bucket::{BucketStore, ObjectInfo, ObjectStoreBuckets};
pub use composite::{CompositeBackend, Selection};
pub use identity::{IdentityCache, IdentityLookup, SystemLookup};
pub use local::LocalBackend;
pub use object::{decode_key, encode_key, ObjectStoreBackend};
pub use remote::RemoteShellBackend;
pub use repository::{ContentResolver, DataladResolver, RepositoryBackend};
pub use transport::{
    classify_rsync_exit, shell_escape, CommandOutput, Direction, SshChannel, SshConnectionPool,
    SshTransport, Transport,
};

/// Capability flags of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub browsable: bool,
    pub fast_syncing: bool,
    pub allow_owner_change: bool,
    pub content_shared: bool,
}

impl Capabilities {
    /// Applies the overrides set in `config`
    pub fn with_overrides(self, config: &BackendConfig) -> Self {
        Self {
            browsable: config.browsable.unwrap_or(self.browsable),
            fast_syncing: config.fast_syncing.unwrap_or(self.fast_syncing),
            allow_owner_change: config.allow_owner_change.unwrap_or(self.allow_owner_change),
            content_shared: config.content_shared.unwrap_or(self.content_shared),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Regular => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink => "link",
            EntryKind::Other => "other",
        }
    }
}

/// One entry of a backend listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    /// Path relative to the listed directory
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Permission bits (`mode & 0o7777`)
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
}

/// Shared interface of every backend kind
pub trait StorageBackend: Send + Sync {
    fn config(&self) -> &BackendConfig;

    fn capabilities(&self) -> Capabilities;

    fn is_browsable(&self) -> bool {
        self.capabilities().browsable
    }

    fn is_fast_syncing(&self) -> bool {
        self.capabilities().fast_syncing
    }

    fn allow_owner_change(&self) -> bool {
        self.capabilities().allow_owner_change
    }

    fn content_shared_between_owners(&self) -> bool {
        self.capabilities().content_shared
    }

    /// True if the backend answers right now
    fn is_alive(&self) -> bool;

    /// Cache holding the working copy of this backend's files
    fn cache(&self) -> &LocalCacheManager;

    /// True if the cache and the authoritative copy are the same bytes
    fn cache_is_authoritative(&self) -> bool {
        false
    }

    /// Copies the authoritative content into the cache
    fn sync_to_cache(&self, file: &RegisteredFile) -> Result<()>;

    /// Copies the cached content to the backend
    fn sync_to_provider(&self, file: &RegisteredFile) -> Result<()>;

    /// Deletes the authoritative content and prunes empty shard directories
    fn erase(&self, file: &RegisteredFile) -> Result<()>;

    /// Moves the authoritative content to `new_name`; never overwrites
    fn rename(&self, file: &RegisteredFile, new_name: &str) -> Result<()>;

    /// Lists `sub_path` below the backend root, sorted by name
    fn list(&self, sub_path: &Path, recursive: bool) -> Result<Vec<FileInfo>>;

    /// Compares `files` (everything the catalog assigns here) with the
    /// backend's content
    fn report(&self, files: &[RegisteredFile]) -> Result<Vec<Issue>>;

    /// Applies the backend side of `issue`. Returns false if there was
    /// nothing left to do.
    fn repair(&self, issue: &Issue) -> Result<bool>;
}

/// An empty `sub_path` is the root; anything else must be plain names
pub(crate) fn check_sub_path(sub_path: &Path) -> Result<()> {
    if sub_path.as_os_str().is_empty() || is_legal_sub_path(sub_path) {
        Ok(())
    } else {
        Err(Error::InvalidName(sub_path.display().to_string()))
    }
}

/// `path` must name something strictly below `root` and never climb back
/// out through `..`
pub(crate) fn check_below(root: &Path, path: &Path) -> Result<()> {
    let inside = path.strip_prefix(root).is_ok_and(|rest| {
        rest.components().next().is_some()
            && rest.components().all(|c| matches!(c, Component::Normal(_)))
    });
    if inside {
        Ok(())
    } else {
        Err(Error::Integrity(format!(
            "{} is not below {}",
            path.display(),
            root.display()
        )))
    }
}

pub(crate) fn not_browsable(config: &BackendConfig) -> Error {
    Error::Unsupported(format!("backend '{}' cannot be browsed", config.name))
}

/// Everything a backend needs beyond its own configuration
#[derive(Clone)]
pub struct BackendContext {
    /// Parent of the per-backend cache directories
    pub cache_dir: PathBuf,
    pub tracker: Arc<SyncStateTracker>,
    pub ssh_pool: Arc<SshConnectionPool>,
}

impl BackendContext {
    /// Cache manager rooted at `<cache_dir>/<backend name>`
    pub fn cache_for(&self, config: &BackendConfig) -> LocalCacheManager {
        self.cache_at(config, self.cache_dir.join(&config.name))
    }

    pub fn cache_at(&self, config: &BackendConfig, root: PathBuf) -> LocalCacheManager {
        LocalCacheManager::new(root, config.layout, config.id, Arc::clone(&self.tracker))
    }
}

/// Builds the backend described by `config`
pub fn build(config: &BackendConfig, ctx: &BackendContext) -> Result<Box<dyn StorageBackend>> {
    config.validate()?;

    let backend: Box<dyn StorageBackend> = match config.kind {
        BackendKind::Local => Box::new(LocalBackend::new(config.clone(), ctx)?),
        BackendKind::RemoteShell => Box::new(RemoteShellBackend::over_ssh(config.clone(), ctx)?),
        BackendKind::ObjectStore => Box::new(ObjectStoreBackend::from_config(config.clone(), ctx)?),
        BackendKind::Repository => Box::new(RepositoryBackend::with_datalad(config.clone(), ctx)?),
        BackendKind::Smart => Box::new(CompositeBackend::new(config.clone(), ctx)?),
    };

    tracing::debug!(
        backend = %config.name,
        kind = config.kind.as_str(),
        layout = config.layout.as_str(),
        "Built backend"
    );
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ShardingScheme;

    #[test]
    fn overrides_replace_defaults() {
        let mut config = BackendConfig::new(1, "main", BackendKind::Local, ShardingScheme::Flat);
        config.browsable = Some(true);

        let caps = Capabilities {
            browsable: false,
            fast_syncing: true,
            allow_owner_change: false,
            content_shared: false,
        }
        .with_overrides(&config);

        assert!(caps.browsable);
        assert!(caps.fast_syncing);
    }

    #[test]
    fn sub_path_checks() {
        assert!(check_sub_path(Path::new("")).is_ok());
        assert!(check_sub_path(Path::new("a/b")).is_ok());
        assert!(matches!(
            check_sub_path(Path::new("../x")),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn deletion_targets_stay_below_the_root() {
        let root = Path::new("/data/main");
        assert!(check_below(root, Path::new("/data/main/bob/12/stray")).is_ok());
        assert!(check_below(root, Path::new("/data/main/.partial-x1")).is_ok());

        for outside in ["/data/main", "/data/other", "/data/main/../x", "/data/main/bob/../../x"] {
            assert!(
                matches!(check_below(root, Path::new(outside)), Err(Error::Integrity(_))),
                "{outside}"
            );
        }
    }
}
