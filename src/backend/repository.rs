//! Read-only backend on a version-controlled content repository
//!
//! Content is materialized on demand by a [`ContentResolver`]. Walking the
//! whole repository is expensive, so the backend walks it at most once
//! and answers recursive queries from that listing.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;

use super::identity::{IdentityCache, SystemLookup};
use super::local::list_dir;
use super::{check_sub_path, not_browsable, BackendContext, Capabilities, FileInfo, StorageBackend};
use crate::domain::{Issue, RegisteredFile};
use crate::error::{Error, Result};
use crate::storage::cache::{copy_file, copy_tree, remove_path};
use crate::storage::{BackendConfig, LocalCacheManager};

/// Materializes repository content
pub trait ContentResolver: Send + Sync {
    fn url(&self) -> &str;

    /// Places the content at `relative` at `dest`
    fn fetch(&self, relative: &Path, dest: &Path) -> Result<()>;

    /// Lists `dir` (relative to the repository root)
    fn list(&self, dir: &Path, recursive: bool) -> Result<Vec<FileInfo>>;
}

/// [`ContentResolver`] driving the `datalad` command line
pub struct DataladResolver {
    url: String,
    dataset: PathBuf,
}

impl DataladResolver {
    /// `dataset` is where the repository is (or will be) cloned
    pub fn new(url: impl Into<String>, dataset: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dataset: dataset.into(),
        }
    }

    pub fn dataset(&self) -> &Path {
        &self.dataset
    }

    fn datalad(&self, args: &[&str]) -> Result<()> {
        tracing::debug!(?args, "datalad");
        let output = Command::new("datalad").args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Configuration("datalad is not installed".to_string())
            } else {
                Error::Io(e)
            }
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Transient(format!(
                "datalad {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn ensure_installed(&self) -> Result<()> {
        if self.dataset.join(".datalad").is_dir() || self.dataset.join(".git").exists() {
            return Ok(());
        }

        tracing::info!(url = %self.url, dataset = %self.dataset.display(), "Cloning dataset");
        let dataset = self.dataset.display().to_string();
        self.datalad(&["clone", &self.url, &dataset])
    }
}

impl ContentResolver for DataladResolver {
    fn url(&self) -> &str {
        &self.url
    }

    fn fetch(&self, relative: &Path, dest: &Path) -> Result<()> {
        self.ensure_installed()?;

        let source = self.dataset.join(relative);
        let dataset = self.dataset.display().to_string();
        let target = source.display().to_string();
        self.datalad(&["get", "-d", &dataset, "--", &target])?;

        // Annexed content sits behind symlinks; a dangling link means absent
        let metadata = std::fs::metadata(&source).map_err(|_| {
            Error::Integrity(format!("content of {} is absent after fetch", relative.display()))
        })?;

        if metadata.is_dir() {
            copy_tree(&source, dest)?;
        } else {
            copy_file(&source, dest)?;
        }
        Ok(())
    }

    fn list(&self, dir: &Path, recursive: bool) -> Result<Vec<FileInfo>> {
        self.ensure_installed()?;

        let mut entries = list_dir(
            &self.dataset.join(dir),
            recursive,
            &mut IdentityCache::new(SystemLookup),
        )?;
        entries.retain(|e| {
            !Path::new(&e.name)
                .components()
                .any(|c| matches!(c.as_os_str().to_str(), Some(".git" | ".datalad")))
        });
        Ok(entries)
    }
}

pub struct RepositoryBackend {
    config: BackendConfig,
    resolver: Arc<dyn ContentResolver>,
    cache: LocalCacheManager,
    listing: Mutex<Option<Arc<Vec<FileInfo>>>>,
}

impl RepositoryBackend {
    pub fn new(config: BackendConfig, resolver: Arc<dyn ContentResolver>, cache: LocalCacheManager) -> Self {
        Self {
            config,
            resolver,
            cache,
            listing: Mutex::new(None),
        }
    }

    /// Builds the backend on a datalad clone at `root`, or next to the
    /// cache when no root is configured
    pub fn with_datalad(config: BackendConfig, ctx: &BackendContext) -> Result<Self> {
        let url = config.require_url()?.to_string();
        let dataset = match &config.root {
            Some(root) => root.clone(),
            None => ctx.cache_dir.join(format!("{}.dataset", config.name)),
        };

        let cache = ctx.cache_for(&config);
        Ok(Self::new(config, Arc::new(DataladResolver::new(url, dataset)), cache))
    }

    fn read_only(&self) -> Error {
        Error::Unsupported(format!(
            "repository backend '{}' is read-only",
            self.config.name
        ))
    }

    /// The one recursive listing, built on first use
    fn full_listing(&self) -> Result<Arc<Vec<FileInfo>>> {
        let mut listing = self.listing.lock();
        if let Some(entries) = listing.as_ref() {
            return Ok(Arc::clone(entries));
        }

        tracing::debug!(backend = %self.config.name, url = self.resolver.url(), "Walking repository");
        let entries = Arc::new(self.resolver.list(Path::new(""), true)?);
        *listing = Some(Arc::clone(&entries));
        Ok(entries)
    }

    fn default_capabilities() -> Capabilities {
        Capabilities {
            browsable: true,
            fast_syncing: false,
            allow_owner_change: false,
            content_shared: true,
        }
    }
}

impl StorageBackend for RepositoryBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn capabilities(&self) -> Capabilities {
        Self::default_capabilities().with_overrides(&self.config)
    }

    fn is_alive(&self) -> bool {
        self.resolver.list(Path::new(""), false).is_ok()
    }

    fn cache(&self) -> &LocalCacheManager {
        &self.cache
    }

    fn sync_to_cache(&self, file: &RegisteredFile) -> Result<()> {
        self.cache.ensure_dirs(file)?;
        let dest = self.cache.full_path(file);
        remove_path(&dest)?;

        self.resolver
            .fetch(&self.config.layout.relative_path(file), &dest)?;

        if std::fs::symlink_metadata(&dest).is_err() {
            return Err(Error::Integrity(format!(
                "fetching file {} from {} left nothing at {}",
                file.id,
                self.resolver.url(),
                dest.display()
            )));
        }
        Ok(())
    }

    fn sync_to_provider(&self, _file: &RegisteredFile) -> Result<()> {
        Err(self.read_only())
    }

    fn erase(&self, _file: &RegisteredFile) -> Result<()> {
        Err(self.read_only())
    }

    fn rename(&self, _file: &RegisteredFile, _new_name: &str) -> Result<()> {
        Err(self.read_only())
    }

    fn list(&self, sub_path: &Path, recursive: bool) -> Result<Vec<FileInfo>> {
        if !self.is_browsable() {
            return Err(not_browsable(&self.config));
        }
        check_sub_path(sub_path)?;

        if !recursive {
            return self.resolver.list(sub_path, false);
        }

        let listing = self.full_listing()?;
        if sub_path.as_os_str().is_empty() {
            return Ok(listing.as_ref().clone());
        }

        Ok(listing
            .iter()
            .filter_map(|entry| {
                let relative = Path::new(&entry.name).strip_prefix(sub_path).ok()?;
                if relative.as_os_str().is_empty() {
                    return None;
                }
                Some(FileInfo {
                    name: relative.to_string_lossy().into_owned(),
                    ..entry.clone()
                })
            })
            .collect())
    }

    fn report(&self, files: &[RegisteredFile]) -> Result<Vec<Issue>> {
        let listing = self.full_listing()?;

        Ok(files
            .iter()
            .filter(|file| {
                let path = self.config.layout.relative_path(file);
                !listing.iter().any(|entry| Path::new(&entry.name) == path)
            })
            .map(|file| {
                Issue::missing(
                    self.config.id,
                    file.id,
                    format!("file {} is not in {}", file.id, self.resolver.url()),
                )
            })
            .collect())
    }

    fn repair(&self, _issue: &Issue) -> Result<bool> {
        Err(self.read_only())
    }
}
