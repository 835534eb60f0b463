//! Backend on an object-store bucket
//!
//! Each file is one object keyed `<id>_<name>`; collections are packed as
//! tar+gzip under `<id>_<name>.tgz`. The bucket has no directories, so
//! the layout only shapes the local cache.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::bucket::{BucketStore, ObjectStoreBuckets};
use super::{not_browsable, BackendContext, Capabilities, EntryKind, FileInfo, StorageBackend};
use crate::domain::{FileId, FileKind, Issue, IssueTarget, RegisteredFile};
use crate::error::{Error, Result};
use crate::storage::cache::remove_path;
use crate::storage::{BackendConfig, LocalCacheManager};

const COLLECTION_SUFFIX: &str = ".tgz";

/// Object key of `file`
pub fn encode_key(file: &RegisteredFile) -> String {
    let suffix = if file.kind.is_collection() {
        COLLECTION_SUFFIX
    } else {
        ""
    };
    format!("{}_{}{}", file.id, file.name, suffix)
}

/// Recovers `(id, name)` from a key of a file of `kind`
pub fn decode_key(key: &str, kind: FileKind) -> Option<(FileId, String)> {
    let stem = match kind {
        FileKind::Collection => key.strip_suffix(COLLECTION_SUFFIX)?,
        FileKind::Single => key,
    };
    let (id, name) = stem.split_once('_')?;
    if name.is_empty() {
        return None;
    }
    Some((id.parse().ok()?, name.to_string()))
}

/// Id prefix of a key, if it has one
fn key_id(key: &str) -> Option<FileId> {
    key.split_once('_')?.0.parse().ok()
}

pub struct ObjectStoreBackend {
    config: BackendConfig,
    bucket: String,
    store: Arc<dyn BucketStore>,
    cache: LocalCacheManager,
}

impl ObjectStoreBackend {
    pub fn new(config: BackendConfig, store: Arc<dyn BucketStore>, cache: LocalCacheManager) -> Result<Self> {
        let bucket = config.require_bucket()?.to_string();

        Ok(Self {
            config,
            bucket,
            store,
            cache,
        })
    }

    /// Builds the backend on the store its configuration names
    pub fn from_config(config: BackendConfig, ctx: &BackendContext) -> Result<Self> {
        let store = ObjectStoreBuckets::from_config(&config)?;
        let cache = ctx.cache_for(&config);
        Self::new(config, Arc::new(store), cache)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn ensure_bucket(&self) -> Result<()> {
        if !self.store.bucket_exists(&self.bucket)? {
            self.store.create_bucket(&self.bucket)?;
        }
        Ok(())
    }

    fn default_capabilities() -> Capabilities {
        Capabilities {
            browsable: true,
            fast_syncing: false,
            allow_owner_change: false,
            content_shared: false,
        }
    }

    /// Packs a cached collection into an anonymous temp file
    fn pack(source: &Path) -> io::Result<File> {
        let mut archive = tempfile::tempfile()?;
        {
            let encoder = GzEncoder::new(&mut archive, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(true);
            builder.append_dir_all(".", source)?;
            builder.into_inner()?.finish()?;
        }
        archive.seek(SeekFrom::Start(0))?;
        Ok(archive)
    }
}

impl StorageBackend for ObjectStoreBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn capabilities(&self) -> Capabilities {
        Self::default_capabilities().with_overrides(&self.config)
    }

    fn is_alive(&self) -> bool {
        self.store.bucket_exists(&self.bucket).is_ok()
    }

    fn cache(&self) -> &LocalCacheManager {
        &self.cache
    }

    fn sync_to_cache(&self, file: &RegisteredFile) -> Result<()> {
        let key = encode_key(file);
        let reader = self.store.get(&self.bucket, &key)?;

        self.cache.ensure_dirs(file)?;
        let dest = self.cache.full_path(file);
        remove_path(&dest)?;

        if file.kind.is_collection() {
            let mut archive = tar::Archive::new(GzDecoder::new(reader));
            std::fs::create_dir_all(&dest)?;
            archive
                .unpack(&dest)
                .map_err(|e| Error::partial(&dest, e.to_string()))?;
        } else {
            let mut reader = reader;
            let mut writer = BufWriter::new(File::create(&dest)?);
            io::copy(&mut reader, &mut writer)
                .and_then(|_| writer.flush())
                .map_err(|e| Error::partial(&dest, e.to_string()))?;
        }

        tracing::debug!(file_id = %file.id, bucket = %self.bucket, key = %key, "Downloaded object");
        Ok(())
    }

    fn sync_to_provider(&self, file: &RegisteredFile) -> Result<()> {
        self.ensure_bucket()?;

        let source = self.cache.full_path(file);
        let key = encode_key(file);

        let size = if file.kind.is_collection() {
            let mut archive = Self::pack(&source)?;
            self.store.put(&self.bucket, &key, &mut archive)?
        } else {
            let mut reader = File::open(&source)?;
            self.store.put(&self.bucket, &key, &mut reader)?
        };

        tracing::debug!(file_id = %file.id, bucket = %self.bucket, key = %key, size, "Uploaded object");
        Ok(())
    }

    fn erase(&self, file: &RegisteredFile) -> Result<()> {
        self.store.delete(&self.bucket, &encode_key(file))
    }

    fn rename(&self, file: &RegisteredFile, new_name: &str) -> Result<()> {
        let from = encode_key(file);
        let to = encode_key(&file.renamed(new_name));

        if self.store.exists(&self.bucket, &to)? {
            return Err(Error::Integrity(format!(
                "cannot rename file {}: object '{}' already exists",
                file.id, to
            )));
        }

        let mut reader = self.store.get(&self.bucket, &from)?;
        self.store.put(&self.bucket, &to, &mut reader)?;
        self.store.delete(&self.bucket, &from)?;
        Ok(())
    }

    fn list(&self, sub_path: &Path, _recursive: bool) -> Result<Vec<FileInfo>> {
        if !self.is_browsable() {
            return Err(not_browsable(&self.config));
        }
        if !sub_path.as_os_str().is_empty() {
            return Err(Error::Unsupported(format!(
                "object store '{}' has no subdirectories",
                self.config.name
            )));
        }

        Ok(self
            .store
            .list(&self.bucket)?
            .into_iter()
            .map(|object| FileInfo {
                name: object.key,
                kind: EntryKind::Regular,
                size: object.size,
                permissions: 0o644,
                uid: 0,
                gid: 0,
                owner: None,
                group: None,
                atime: object.modified,
                mtime: object.modified,
                ctime: object.modified,
            })
            .collect())
    }

    fn report(&self, files: &[RegisteredFile]) -> Result<Vec<Issue>> {
        let objects = if self.store.bucket_exists(&self.bucket)? {
            self.store.list(&self.bucket)?
        } else {
            Vec::new()
        };
        let keys: HashSet<&str> = objects.iter().map(|o| o.key.as_str()).collect();

        let mut issues: Vec<Issue> = files
            .iter()
            .filter(|f| !keys.contains(encode_key(f).as_str()))
            .map(|f| {
                Issue::missing(
                    self.config.id,
                    f.id,
                    format!("object '{}' is absent", encode_key(f)),
                )
            })
            .collect();

        for object in &objects {
            let registered = key_id(&object.key)
                .and_then(|id| files.iter().find(|f| f.id == id))
                .filter(|f| encode_key(f) == object.key);

            if registered.is_none() {
                issues.push(Issue::orphan_key(
                    self.config.id,
                    object.key.clone(),
                    format!("object '{}' is not registered", object.key),
                ));
            }
        }

        Ok(issues)
    }

    fn repair(&self, issue: &Issue) -> Result<bool> {
        let IssueTarget::Key(key) = &issue.target else {
            return Err(Error::Unsupported(format!(
                "object store '{}' cannot repair {} issues",
                self.config.name, issue.kind
            )));
        };

        if !self.store.exists(&self.bucket, key)? {
            return Ok(false);
        }
        self.store.delete(&self.bucket, key)?;
        Ok(true)
    }
}
