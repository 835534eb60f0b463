//! Caller-facing facade over one backend
//!
//! A [`Provider`] pairs a [`StorageBackend`] with the sync-state tracker and
//! the catalog. Backend primitives never lock; every state-changing call
//! here runs under the tracker, and the catalog is only written after the
//! backend side succeeded.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{FileInfo, StorageBackend};
use crate::domain::{is_legal_filename, RegisteredFile, SyncKey, SyncState};
use crate::error::{Error, Result};
use crate::storage::{name_taken, BackendConfig, Catalog, Finish, SyncStateTracker};

pub struct Provider {
    backend: Box<dyn StorageBackend>,
    catalog: Arc<dyn Catalog>,
    tracker: Arc<SyncStateTracker>,
}

impl Provider {
    pub fn new(
        backend: Box<dyn StorageBackend>,
        catalog: Arc<dyn Catalog>,
        tracker: Arc<SyncStateTracker>,
    ) -> Self {
        Self {
            backend,
            catalog,
            tracker,
        }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &BackendConfig {
        self.backend.config()
    }

    pub fn name(&self) -> &str {
        &self.config().name
    }

    pub fn is_alive(&self) -> bool {
        self.backend.is_alive()
    }

    fn key(&self, file: &RegisteredFile) -> SyncKey {
        SyncKey::new(file.id, self.config().id)
    }

    fn check_online(&self) -> Result<()> {
        if self.config().online {
            Ok(())
        } else {
            Err(Error::Offline(self.name().to_string()))
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_online()?;
        if self.config().read_only {
            return Err(Error::ReadOnly(self.name().to_string()));
        }
        Ok(())
    }

    fn check_assigned(&self, file: &RegisteredFile) -> Result<()> {
        if file.backend_id == self.config().id {
            Ok(())
        } else {
            Err(Error::Integrity(format!(
                "file {} is assigned to backend {}, not '{}'",
                file.id,
                file.backend_id,
                self.name()
            )))
        }
    }

    pub fn state(&self, file: &RegisteredFile) -> Result<SyncState> {
        self.tracker.state(self.key(file))
    }

    pub fn cache_full_path(&self, file: &RegisteredFile) -> PathBuf {
        self.backend.cache().full_path(file)
    }

    /// Creates the cache directories for `file`
    pub fn cache_prepare(&self, file: &RegisteredFile) -> Result<PathBuf> {
        self.check_assigned(file)?;
        self.backend.cache().prepare(file)
    }

    /// Brings the cache up to date. Returns false if it already was.
    pub fn sync_to_cache(&self, file: &RegisteredFile) -> Result<bool> {
        self.check_online()?;
        self.check_assigned(file)?;

        let filled = self
            .tracker
            .fill(self.key(file), || self.backend.sync_to_cache(file))?;
        Ok(filled.is_some())
    }

    /// Uploads the cached content to the backend
    pub fn sync_to_provider(&self, file: &RegisteredFile) -> Result<()> {
        self.check_writable()?;
        self.check_assigned(file)?;

        self.tracker
            .push(self.key(file), || self.backend.sync_to_provider(file))
    }

    /// Drops the cached copy. On backends whose cache is the authoritative
    /// copy only the sync record is dropped.
    pub fn cache_erase(&self, file: &RegisteredFile) -> Result<()> {
        if self.backend.cache_is_authoritative() {
            return self
                .tracker
                .ready_to_modify(self.key(file), Finish::Destroy, |_| Ok(()));
        }
        self.backend.cache().erase(file)
    }

    /// Stores local content as `file` and uploads it. Returns the catalog
    /// record with the new size.
    pub fn copy_from_local(&self, file: &RegisteredFile, source: &Path) -> Result<RegisteredFile> {
        self.check_writable()?;
        self.check_assigned(file)?;

        let size = self.backend.cache().copy_from_local(file, source)?;
        self.sync_to_provider(file)?;

        let mut updated = file.clone();
        updated.size = Some(size);
        self.catalog.update(&updated)?;

        tracing::info!(file_id = %file.id, backend = %self.name(), size, "Stored file");
        Ok(updated)
    }

    /// Fetches `file` if needed and copies it to `dest`
    pub fn copy_to_local(&self, file: &RegisteredFile, dest: &Path) -> Result<u64> {
        self.sync_to_cache(file)?;
        self.backend.cache().copy_to_local(file, dest)
    }

    fn check_single(&self, file: &RegisteredFile) -> Result<()> {
        if file.kind.is_collection() {
            return Err(Error::Unsupported(format!(
                "file {} is a collection and cannot be streamed",
                file.id
            )));
        }
        Ok(())
    }

    /// Fetches `file` if needed and hands `read` the cached bytes. The lock
    /// is held until `read` returns.
    pub fn with_reader<T>(
        &self,
        file: &RegisteredFile,
        read: impl FnOnce(&mut dyn Read) -> Result<T>,
    ) -> Result<T> {
        self.check_single(file)?;
        self.sync_to_cache(file)?;

        self.tracker
            .ready_to_modify(self.key(file), Finish::Keep, |state| {
                if !matches!(state, SyncState::InSync | SyncState::CacheNewer) {
                    return Err(Error::InvalidState {
                        file_id: file.id,
                        state,
                        operation: "read",
                    });
                }
                let mut reader = BufReader::new(File::open(self.cache_full_path(file))?);
                read(&mut reader)
            })
    }

    /// Lets `write` produce new content for `file` in the cache, then
    /// uploads it. A failed `write` leaves the previous content in place.
    pub fn with_writer(
        &self,
        file: &RegisteredFile,
        write: impl FnOnce(&mut dyn Write) -> Result<()>,
    ) -> Result<RegisteredFile> {
        self.check_writable()?;
        self.check_assigned(file)?;
        self.check_single(file)?;

        let cache = self.backend.cache();
        let size = self.tracker.ready_to_modify(
            self.key(file),
            Finish::State(SyncState::CacheNewer),
            |_| {
                let dir = cache.ensure_dirs(file)?;
                let mut staged = tempfile::Builder::new()
                    .prefix(".partial-")
                    .tempfile_in(&dir)?;
                {
                    let mut writer = BufWriter::new(staged.as_file_mut());
                    write(&mut writer)?;
                    writer.flush()?;
                }
                let size = staged.as_file().metadata()?.len();
                staged
                    .persist(cache.full_path(file))
                    .map_err(|e| e.error)?;
                Ok(size)
            },
        )?;
        self.sync_to_provider(file)?;

        let mut updated = file.clone();
        updated.size = Some(size);
        self.catalog.update(&updated)?;

        tracing::info!(file_id = %file.id, backend = %self.name(), size, "Wrote file");
        Ok(updated)
    }

    /// Deletes the authoritative content and the cached copy
    pub fn erase(&self, file: &RegisteredFile) -> Result<()> {
        self.check_writable()?;
        self.check_assigned(file)?;

        self.tracker
            .ready_to_modify(self.key(file), Finish::Destroy, |_| {
                self.backend.erase(file)?;
                if !self.backend.cache_is_authoritative() {
                    self.backend.cache().remove_content(file)?;
                }
                Ok(())
            })?;

        tracing::info!(file_id = %file.id, backend = %self.name(), "Erased file");
        Ok(())
    }

    /// Renames `file` on the backend and in the catalog; never overwrites
    pub fn rename(&self, file: &RegisteredFile, new_name: &str) -> Result<RegisteredFile> {
        self.check_writable()?;
        self.check_assigned(file)?;

        if !is_legal_filename(new_name) {
            return Err(Error::InvalidName(new_name.to_string()));
        }
        if new_name == file.name {
            return Ok(file.clone());
        }

        let renamed = file.renamed(new_name);
        if let Some(other) = name_taken(self.catalog.as_ref(), self.config().layout, &renamed)? {
            return Err(Error::Integrity(format!(
                "cannot rename file {} to '{}': taken by file {}",
                file.id, new_name, other.id
            )));
        }

        self.tracker.ready_to_settle(self.key(file), |state| {
            self.backend.rename(file, new_name)?;
            if self.backend.cache_is_authoritative() {
                return Ok(((), Finish::Keep));
            }

            let cache = self.backend.cache();
            match cache.relocate(file, &renamed) {
                Ok(()) => Ok(((), Finish::Keep)),
                Err(e) => {
                    tracing::warn!(
                        file_id = %file.id,
                        state = %state,
                        error = %e,
                        "Renamed file but could not move its cached copy, dropping it"
                    );
                    for stale in [file, &renamed] {
                        if let Err(e) = cache.remove_content(stale) {
                            tracing::warn!(
                                file_id = %file.id,
                                path = %cache.leaf_path(stale).display(),
                                error = %e,
                                "Could not drop cached copy"
                            );
                        }
                    }
                    Ok(((), Finish::Destroy))
                }
            }
        })?;

        self.catalog.update(&renamed)?;
        tracing::info!(file_id = %file.id, from = %file.name, to = new_name, "Renamed file");
        Ok(renamed)
    }

    pub fn list(&self, sub_path: &Path, recursive: bool) -> Result<Vec<FileInfo>> {
        self.check_online()?;
        self.backend.list(sub_path, recursive)
    }

    /// Moves `file` onto `target`, keeping its id. The source copy is
    /// erased last; if that fails the file is still moved and the leftover
    /// shows up as an orphan.
    pub fn move_to(&self, file: &RegisteredFile, target: &Provider) -> Result<RegisteredFile> {
        self.check_writable()?;
        target.check_writable()?;
        self.check_assigned(file)?;

        if target.config().id == self.config().id {
            return Err(Error::Integrity(format!(
                "file {} is already on '{}'",
                file.id,
                self.name()
            )));
        }

        let mut moved = file.clone();
        moved.backend_id = target.config().id;
        if let Some(other) = name_taken(self.catalog.as_ref(), target.config().layout, &moved)? {
            return Err(Error::Integrity(format!(
                "cannot move file {} to '{}': name taken by file {}",
                file.id,
                target.name(),
                other.id
            )));
        }

        self.sync_to_cache(file)?;
        let moved = target.copy_from_local(&moved, &self.cache_full_path(file))?;

        if let Err(e) = self.erase(file) {
            tracing::warn!(
                file_id = %file.id,
                backend = %self.name(),
                error = %e,
                "Moved file but could not erase the source copy"
            );
        }

        tracing::info!(file_id = %file.id, from = %self.name(), to = %target.name(), "Moved file");
        Ok(moved)
    }

    /// Copies the content of `file` into `copy`, a file registered on
    /// `target`
    pub fn copy_to(
        &self,
        file: &RegisteredFile,
        target: &Provider,
        copy: &RegisteredFile,
    ) -> Result<RegisteredFile> {
        self.check_assigned(file)?;
        target.check_assigned(copy)?;
        if copy.kind != file.kind {
            return Err(Error::Integrity(format!(
                "file {} is a {:?} but file {} is a {:?}",
                file.id, file.kind, copy.id, copy.kind
            )));
        }

        self.sync_to_cache(file)?;
        target.copy_from_local(copy, &self.cache_full_path(file))
    }
}
