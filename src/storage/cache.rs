//! Local cache of backend content
//!
//! Each backend owns a cache directory laid out with the backend's sharding
//! scheme, so a file's cache path is a pure function of its identity.
//! Operations that change the cache run under the sync-state lock.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::domain::{BackendId, RegisteredFile, ShardingScheme, SyncKey, SyncState};
use crate::error::{Error, Result};
use crate::storage::tracker::{Finish, SyncStateTracker};

pub struct LocalCacheManager {
    root: PathBuf,
    scheme: ShardingScheme,
    backend_id: BackendId,
    tracker: Arc<SyncStateTracker>,
}

impl LocalCacheManager {
    pub fn new(
        root: impl Into<PathBuf>,
        scheme: ShardingScheme,
        backend_id: BackendId,
        tracker: Arc<SyncStateTracker>,
    ) -> Self {
        Self {
            root: root.into(),
            scheme,
            backend_id,
            tracker,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scheme(&self) -> ShardingScheme {
        self.scheme
    }

    pub fn tracker(&self) -> &Arc<SyncStateTracker> {
        &self.tracker
    }

    pub fn key(&self, file: &RegisteredFile) -> SyncKey {
        SyncKey::new(file.id, self.backend_id)
    }

    /// Path of the cached copy. Pure, no I/O.
    pub fn full_path(&self, file: &RegisteredFile) -> PathBuf {
        self.root.join(self.scheme.relative_path(file))
    }

    /// Directory holding the cached copy
    pub fn dir_path(&self, file: &RegisteredFile) -> PathBuf {
        self.root.join(self.scheme.relative_dir(file))
    }

    /// Topmost path owned by this file alone; erase removes it whole
    pub fn leaf_path(&self, file: &RegisteredFile) -> PathBuf {
        self.root.join(self.scheme.relative_leaf(file))
    }

    /// Pruning stops here
    pub fn floor_path(&self, file: &RegisteredFile) -> PathBuf {
        self.root.join(self.scheme.relative_floor(file))
    }

    /// Creates the shard directories for `file` under the sync lock
    pub fn prepare(&self, file: &RegisteredFile) -> Result<PathBuf> {
        self.tracker
            .ready_to_modify(self.key(file), Finish::Keep, |_| self.ensure_dirs(file))
    }

    /// Unguarded [`prepare`](Self::prepare) for callers already holding the lock
    pub(crate) fn ensure_dirs(&self, file: &RegisteredFile) -> Result<PathBuf> {
        let dir = self.dir_path(file);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Deletes the cached copy and prunes empty shard directories
    pub fn erase(&self, file: &RegisteredFile) -> Result<()> {
        self.tracker
            .ready_to_modify(self.key(file), Finish::Destroy, |_| self.remove_content(file))
    }

    /// Unguarded [`erase`](Self::erase)
    pub(crate) fn remove_content(&self, file: &RegisteredFile) -> Result<()> {
        let leaf = self.leaf_path(file);
        remove_path(&leaf)?;

        if let Some(parent) = leaf.parent() {
            prune_empty_ancestors(parent, &self.floor_path(file));
        }
        Ok(())
    }

    /// Moves the cached copy of `file` to where `renamed` lives. Unguarded;
    /// absent content is fine.
    pub(crate) fn relocate(&self, file: &RegisteredFile, renamed: &RegisteredFile) -> Result<()> {
        let from = self.full_path(file);
        if fs::symlink_metadata(&from).is_err() {
            return Ok(());
        }

        let to = self.full_path(renamed);
        self.ensure_dirs(renamed)?;
        remove_path(&to)?;
        fs::rename(&from, &to)?;

        if let Some(parent) = from.parent() {
            prune_empty_ancestors(parent, &self.floor_path(file));
        }
        Ok(())
    }

    /// Copies local content into the cache, leaving it `CacheNewer`.
    ///
    /// Returns the new size: bytes for a single file, entries for a
    /// collection.
    pub fn copy_from_local(&self, file: &RegisteredFile, source: &Path) -> Result<u64> {
        let source_is_dir = fs::metadata(source)?.is_dir();
        if source_is_dir != file.kind.is_collection() {
            return Err(Error::Integrity(format!(
                "{} is {} but file {} is a {:?}",
                source.display(),
                if source_is_dir { "a directory" } else { "not a directory" },
                file.id,
                file.kind
            )));
        }

        self.tracker.ready_to_modify(
            self.key(file),
            Finish::State(SyncState::CacheNewer),
            |_| {
                self.ensure_dirs(file)?;
                let dest = self.full_path(file);
                remove_path(&dest)?;

                let size = if file.kind.is_collection() {
                    copy_tree(source, &dest)?
                } else {
                    copy_file(source, &dest)?
                };
                tracing::debug!(file_id = %file.id, dest = %dest.display(), size, "Copied into cache");
                Ok(size)
            },
        )
    }

    /// Copies the cached content out to `dest`
    pub fn copy_to_local(&self, file: &RegisteredFile, dest: &Path) -> Result<u64> {
        self.tracker
            .ready_to_modify(self.key(file), Finish::Keep, |state| {
                if !matches!(state, SyncState::InSync | SyncState::CacheNewer) {
                    return Err(Error::InvalidState {
                        file_id: file.id,
                        state,
                        operation: "copy out",
                    });
                }

                let source = self.full_path(file);
                if !source.exists() {
                    return Err(Error::NotFound(source.display().to_string()));
                }

                remove_path(dest)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }

                let size = if file.kind.is_collection() {
                    copy_tree(&source, dest)?
                } else {
                    copy_file(&source, dest)?
                };
                Ok(size)
            })
    }
}

/// Removes empty directories from `start` upward, stopping before `floor`.
///
/// Directories already removed by someone else are skipped; a non-empty
/// directory ends the walk.
pub fn prune_empty_ancestors(start: &Path, floor: &Path) {
    let mut current = start;

    while current != floor && current.starts_with(floor) {
        match fs::remove_dir(current) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(_) => return,
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => return,
        }
    }
}

/// Removes a file, symlink or directory tree; absent paths are fine
pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Streams one file; returns bytes copied
pub(crate) fn copy_file(source: &Path, dest: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(dest)?);
    let copied = io::copy(&mut reader, &mut writer)?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(copied)
}

/// Copies a directory tree; returns the number of files copied
pub(crate) fn copy_tree(source: &Path, dest: &Path) -> io::Result<u64> {
    let mut files = 0;

    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_file(entry.path(), &target)?;
            files += 1;
        }
    }

    Ok(files)
}
