//! Backend on a local (or locally mounted) directory
//!
//! The cache manager is rooted at the backend root, so the cached copy and
//! the authoritative copy are the same bytes and transfers are no-ops.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use super::identity::{IdentityCache, IdentityLookup, SystemLookup};
use super::{
    check_below, check_sub_path, not_browsable, BackendContext, Capabilities, EntryKind, FileInfo,
    StorageBackend,
};
use crate::domain::{Issue, IssueTarget, RegisteredFile, ShardingScheme};
use crate::error::{Error, Result};
use crate::reconcile::{diff, walk_local, ExpectedPath};
use crate::storage::cache::{prune_empty_ancestors, remove_path};
use crate::storage::{BackendConfig, LocalCacheManager};

pub struct LocalBackend {
    config: BackendConfig,
    root: PathBuf,
    cache: LocalCacheManager,
}

impl LocalBackend {
    pub fn new(config: BackendConfig, ctx: &BackendContext) -> Result<Self> {
        let root = config.require_root()?.to_path_buf();
        let cache = ctx.cache_at(&config, root.clone());

        Ok(Self {
            config,
            root,
            cache,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn default_capabilities() -> Capabilities {
        Capabilities {
            browsable: false,
            fast_syncing: true,
            allow_owner_change: false,
            content_shared: false,
        }
    }
}

impl StorageBackend for LocalBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn capabilities(&self) -> Capabilities {
        Self::default_capabilities().with_overrides(&self.config)
    }

    fn is_alive(&self) -> bool {
        self.root.is_dir()
    }

    fn cache(&self) -> &LocalCacheManager {
        &self.cache
    }

    fn cache_is_authoritative(&self) -> bool {
        true
    }

    fn sync_to_cache(&self, _file: &RegisteredFile) -> Result<()> {
        Ok(())
    }

    fn sync_to_provider(&self, _file: &RegisteredFile) -> Result<()> {
        Ok(())
    }

    fn erase(&self, file: &RegisteredFile) -> Result<()> {
        self.cache.remove_content(file)
    }

    fn rename(&self, file: &RegisteredFile, new_name: &str) -> Result<()> {
        let renamed = file.renamed(new_name);
        let from = self.cache.full_path(file);
        let to = self.cache.full_path(&renamed);

        if fs::symlink_metadata(&to).is_ok() {
            return Err(Error::Integrity(format!(
                "cannot rename file {}: {} already exists",
                file.id,
                to.display()
            )));
        }
        if fs::symlink_metadata(&from).is_err() {
            return Err(Error::NotFound(from.display().to_string()));
        }

        self.cache.ensure_dirs(&renamed)?;
        fs::rename(&from, &to)?;
        tracing::debug!(file_id = %file.id, from = %from.display(), to = %to.display(), "Renamed");

        if let Some(parent) = from.parent() {
            prune_empty_ancestors(parent, &self.cache.floor_path(file));
        }
        Ok(())
    }

    fn list(&self, sub_path: &Path, recursive: bool) -> Result<Vec<FileInfo>> {
        if self.config.layout != ShardingScheme::Flat || !self.is_browsable() {
            return Err(not_browsable(&self.config));
        }
        check_sub_path(sub_path)?;

        let dir = self.root.join(sub_path);
        Ok(list_dir(&dir, recursive, &mut IdentityCache::new(SystemLookup))?)
    }

    fn report(&self, files: &[RegisteredFile]) -> Result<Vec<Issue>> {
        let expected: Vec<ExpectedPath> = files
            .iter()
            .map(|f| ExpectedPath::for_file(self.config.layout, f))
            .collect();
        let physical = walk_local(&self.root)?;

        Ok(diff(self.config.layout, &expected, &physical).into_issues(self.config.id, &self.root))
    }

    fn repair(&self, issue: &Issue) -> Result<bool> {
        match &issue.target {
            IssueTarget::Path(path) => delete_below(&self.root, path),
            _ => Err(Error::Unsupported(format!(
                "local backend '{}' cannot repair {} issues",
                self.config.name, issue.kind
            ))),
        }
    }
}

/// Deletes `path` (which must sit below `root`) and prunes up to `root`.
/// Returns false if it was already gone.
pub(crate) fn delete_below(root: &Path, path: &Path) -> Result<bool> {
    check_below(root, path)?;

    let existed = fs::symlink_metadata(path).is_ok();
    remove_path(path)?;
    if let Some(parent) = path.parent() {
        prune_empty_ancestors(parent, root);
    }
    Ok(existed)
}

fn timestamp(secs: i64, nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nanos.clamp(0, 999_999_999) as u32).unwrap_or_default()
}

/// Lists `dir` with metadata, names relative to `dir`, sorted by name
pub(crate) fn list_dir<L: IdentityLookup>(
    dir: &Path,
    recursive: bool,
    identities: &mut IdentityCache<L>,
) -> io::Result<Vec<FileInfo>> {
    if !fs::metadata(dir)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name();

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let metadata = entry.path().symlink_metadata()?;

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::Regular
        } else {
            EntryKind::Other
        };

        let name = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .to_string_lossy()
            .into_owned();

        entries.push(FileInfo {
            name,
            kind,
            size: metadata.len(),
            permissions: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            owner: identities.user(metadata.uid()),
            group: identities.group(metadata.gid()),
            atime: timestamp(metadata.atime(), metadata.atime_nsec()),
            mtime: timestamp(metadata.mtime(), metadata.mtime_nsec()),
            ctime: timestamp(metadata.ctime(), metadata.ctime_nsec()),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackendId, FileId, IssueKind};
    use crate::storage::{BackendKind, SqliteStateStore, SyncSettings, SyncStateTracker};
    use crate::backend::SshConnectionPool;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn backend(dir: &TempDir, layout: ShardingScheme) -> LocalBackend {
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();

        let store = SqliteStateStore::open(dir.path().join("state.db")).unwrap();
        let ctx = BackendContext {
            cache_dir: dir.path().join("cache"),
            tracker: Arc::new(SyncStateTracker::new(Arc::new(store), SyncSettings::default())),
            ssh_pool: Arc::new(SshConnectionPool::new(dir.path().join("ssh"))),
        };
        let config = BackendConfig::new(1, "main", BackendKind::Local, layout).with_root(root);
        LocalBackend::new(config, &ctx).unwrap()
    }

    fn file(id: u64, name: &str) -> RegisteredFile {
        RegisteredFile::new(FileId::new(id), name, "bob", BackendId::new(1))
    }

    fn write(backend: &LocalBackend, file: &RegisteredFile, content: &[u8]) {
        backend.cache().ensure_dirs(file).unwrap();
        fs::write(backend.cache().full_path(file), content).unwrap();
    }

    #[test]
    fn cache_is_the_backend_root() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, ShardingScheme::NameSharded);

        assert!(backend.cache_is_authoritative());
        assert!(backend.is_fast_syncing());
        assert!(backend.is_alive());
        assert!(backend
            .cache()
            .full_path(&file(1, "alpha"))
            .starts_with(dir.path().join("data").join("bob")));
    }

    #[test]
    fn rename_moves_between_shards_and_prunes() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, ShardingScheme::NameSharded);
        let alpha = file(1, "alpha");
        write(&backend, &alpha, b"content");

        backend.rename(&alpha, "omega").unwrap();

        let moved = backend.cache().full_path(&alpha.renamed("omega"));
        assert_eq!(fs::read(&moved).unwrap(), b"content");
        assert!(!backend.cache().full_path(&alpha).exists());
        assert!(dir.path().join("data").join("bob").is_dir());
    }

    #[test]
    fn rename_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, ShardingScheme::NameSharded);
        let alpha = file(1, "alpha");
        let beta = file(2, "beta");
        write(&backend, &alpha, b"a");
        write(&backend, &beta, b"b");

        let err = backend.rename(&alpha, "beta").unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(fs::read(backend.cache().full_path(&alpha)).unwrap(), b"a");
        assert_eq!(fs::read(backend.cache().full_path(&beta)).unwrap(), b"b");
    }

    #[test]
    fn listing_requires_browsable_flat_layout() {
        let dir = TempDir::new().unwrap();
        let sharded = backend(&dir, ShardingScheme::NameSharded);
        let err = sharded.list(Path::new(""), false).unwrap_err();
        assert!(err.to_string().contains("cannot be browsed"));

        let flat = backend(&dir, ShardingScheme::Flat);
        assert!(matches!(flat.list(Path::new(""), false), Err(Error::Unsupported(_))));
    }

    #[test]
    fn browsable_listing_has_metadata() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("sub/b.txt"), b"12345").unwrap();
        fs::write(root.join("a.txt"), b"1").unwrap();

        let mut identities = IdentityCache::new(SystemLookup);
        let top = list_dir(&root, false, &mut identities).unwrap();
        let names: Vec<_> = top.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert_eq!(top[1].kind, EntryKind::Directory);

        let all = list_dir(&root, true, &mut identities).unwrap();
        let b = all.iter().find(|e| e.name == "sub/b.txt").unwrap();
        assert_eq!(b.size, 5);
        assert_eq!(b.kind, EntryKind::Regular);
        assert!(b.mtime.timestamp() > 0);
    }

    #[test]
    fn report_and_repair() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, ShardingScheme::NameSharded);
        let alpha = file(1, "alpha");
        let ghost = file(2, "ghost");
        write(&backend, &alpha, b"a");

        let stray = backend.cache().dir_path(&alpha).join("stray");
        fs::write(&stray, b"?").unwrap();

        let issues = backend.report(&[alpha.clone(), ghost]).unwrap();
        assert_eq!(issues.len(), 2);
        let orphan = issues.iter().find(|i| i.kind == IssueKind::Orphan).unwrap();
        assert_eq!(orphan.target, IssueTarget::Path(stray.clone()));

        assert!(backend.repair(orphan).unwrap());
        assert!(!stray.exists());
        assert!(!backend.repair(orphan).unwrap());
        assert!(backend.cache().full_path(&alpha).exists());
    }

    #[test]
    fn repair_refuses_paths_outside_root() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, ShardingScheme::Flat);
        let issue = Issue::orphan_path(BackendId::new(1), dir.path().join("state.db"), "x");

        assert!(matches!(backend.repair(&issue), Err(Error::Integrity(_))));
        assert!(dir.path().join("state.db").exists());

        // Lexically below the root, physically beside it
        let climbing = backend.root().join("../state.db");
        let issue = Issue::orphan_path(BackendId::new(1), climbing, "x");
        assert!(matches!(backend.repair(&issue), Err(Error::Integrity(_))));
        assert!(dir.path().join("state.db").exists());
    }
}
