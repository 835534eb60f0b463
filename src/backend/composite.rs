//! Backend that is local on its own host and remote everywhere else
//!
//! The choice is made once, when the backend is built: if the configured
//! host is this machine and the root exists, every call goes straight to
//! the filesystem. Otherwise it goes over ssh.

use std::path::Path;

use serde::Serialize;

use super::local::LocalBackend;
use super::remote::RemoteShellBackend;
use super::{BackendContext, Capabilities, FileInfo, StorageBackend};
use crate::domain::{Issue, RegisteredFile};
use crate::error::Result;
use crate::storage::{BackendConfig, LocalCacheManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Local,
    Remote,
}

/// Picks the implementation for `host`/`root` when running on `local_host`
pub fn decide(host: &str, root_exists: bool, local_host: &str) -> Selection {
    if root_exists && host.eq_ignore_ascii_case(local_host) {
        Selection::Local
    } else {
        Selection::Remote
    }
}

pub struct CompositeBackend {
    config: BackendConfig,
    selection: Selection,
    inner: Box<dyn StorageBackend>,
}

impl CompositeBackend {
    pub fn new(config: BackendConfig, ctx: &BackendContext) -> Result<Self> {
        let host = config.require_host()?.to_string();
        let root = config.require_root()?;

        let local_host = hostname::get()?.to_string_lossy().into_owned();
        let selection = decide(&host, root.is_dir(), &local_host);

        let inner: Box<dyn StorageBackend> = match selection {
            Selection::Local => Box::new(LocalBackend::new(config.clone(), ctx)?),
            Selection::Remote => Box::new(RemoteShellBackend::over_ssh(config.clone(), ctx)?),
        };

        tracing::debug!(
            backend = %config.name,
            host = %host,
            local_host = %local_host,
            ?selection,
            "Selected implementation"
        );

        Ok(Self {
            config,
            selection,
            inner,
        })
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// The implementation every call is forwarded to
    pub fn selected(&self) -> &dyn StorageBackend {
        self.inner.as_ref()
    }
}

impl StorageBackend for CompositeBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    fn cache(&self) -> &LocalCacheManager {
        self.inner.cache()
    }

    fn cache_is_authoritative(&self) -> bool {
        self.inner.cache_is_authoritative()
    }

    fn sync_to_cache(&self, file: &RegisteredFile) -> Result<()> {
        self.inner.sync_to_cache(file)
    }

    fn sync_to_provider(&self, file: &RegisteredFile) -> Result<()> {
        self.inner.sync_to_provider(file)
    }

    fn erase(&self, file: &RegisteredFile) -> Result<()> {
        self.inner.erase(file)
    }

    fn rename(&self, file: &RegisteredFile, new_name: &str) -> Result<()> {
        self.inner.rename(file, new_name)
    }

    fn list(&self, sub_path: &Path, recursive: bool) -> Result<Vec<FileInfo>> {
        self.inner.list(sub_path, recursive)
    }

    fn report(&self, files: &[RegisteredFile]) -> Result<Vec<Issue>> {
        self.inner.report(files)
    }

    fn repair(&self, issue: &Issue) -> Result<bool> {
        self.inner.repair(issue)
    }
}
