//! Configuration handling for dataprov
//!
//! Configuration is stored in `.dataprov/config.toml` (workspace) and
//! `~/.config/dataprov/config.toml` (global).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{is_legal_filename, BackendId, ShardingScheme};
use crate::error::Error;

/// Name of the workspace directory
pub const WORKSPACE_DIR: &str = ".dataprov";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Which family of storage a backend belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Authoritative bytes on a local (or locally mounted) disk
    Local,
    /// Remote host reached over ssh, transfers with rsync
    RemoteShell,
    /// Bucket of flat keys
    ObjectStore,
    /// Read-only version-controlled content repository
    Repository,
    /// Local when running on the configured host, remote otherwise
    Smart,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::RemoteShell => "remote_shell",
            BackendKind::ObjectStore => "object_store",
            BackendKind::Repository => "repository",
            BackendKind::Smart => "smart",
        }
    }
}

fn default_online() -> bool {
    true
}

/// Configuration of one storage backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub id: BackendId,

    /// Unique name, also used as the cache subdirectory
    pub name: String,

    pub kind: BackendKind,

    #[serde(default)]
    pub layout: ShardingScheme,

    /// Root directory of the authoritative copy (local disk or remote host)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Reference to credentials (an ssh identity file for remote backends)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Repository URL for repository backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_online")]
    pub online: bool,

    #[serde(default)]
    pub read_only: bool,

    // Capability overrides; each backend kind has its own defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browsable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_syncing: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_owner_change: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_shared: Option<bool>,
}

impl BackendConfig {
    /// Creates a minimal online, writable configuration
    pub fn new(id: u32, name: impl Into<String>, kind: BackendKind, layout: ShardingScheme) -> Self {
        Self {
            id: BackendId::new(id),
            name: name.into(),
            kind,
            layout,
            root: None,
            host: None,
            port: None,
            user: None,
            credentials: None,
            bucket: None,
            url: None,
            online: true,
            read_only: false,
            browsable: None,
            fast_syncing: None,
            allow_owner_change: None,
            content_shared: None,
        }
    }

    /// Builder-style setter for the root directory
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Builder-style setter for the remote host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn require_root(&self) -> crate::Result<&Path> {
        self.root
            .as_deref()
            .ok_or_else(|| self.missing("root"))
    }

    pub fn require_host(&self) -> crate::Result<&str> {
        self.host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| self.missing("host"))
    }

    pub fn require_bucket(&self) -> crate::Result<&str> {
        self.bucket
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| self.missing("bucket"))
    }

    pub fn require_url(&self) -> crate::Result<&str> {
        self.url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| self.missing("url"))
    }

    fn missing(&self, attribute: &str) -> Error {
        Error::Configuration(format!(
            "backend '{}' ({}) requires '{}'",
            self.name,
            self.kind.as_str(),
            attribute
        ))
    }

    /// Checks the attributes every backend of this kind needs
    pub fn validate(&self) -> crate::Result<()> {
        if !is_legal_filename(&self.name) {
            return Err(Error::Configuration(format!(
                "invalid backend name '{}'",
                self.name
            )));
        }

        match self.kind {
            BackendKind::Local => {
                self.require_root()?;
            }
            BackendKind::RemoteShell | BackendKind::Smart => {
                self.require_root()?;
                self.require_host()?;
            }
            BackendKind::ObjectStore => {
                // S3 endpoint on `host`, or a directory store on `root`
                if self.require_host().is_err() {
                    self.require_root()?;
                }
                self.require_bucket()?;
            }
            BackendKind::Repository => {
                self.require_url()?;
            }
        }

        if let Some(root) = &self.root {
            if !root.is_absolute() {
                return Err(Error::Configuration(format!(
                    "backend '{}' root must be absolute: {}",
                    self.name,
                    root.display()
                )));
            }
        }

        Ok(())
    }
}

/// Timing of the sync-state lock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Delay between two attempts to take a busy lock
    pub poll_interval_ms: u64,

    /// Give up waiting for a lock after this long
    pub max_wait_secs: u64,

    /// Lifetime of a lock; an expired lock may be stolen
    pub lock_ttl_secs: u64,

    /// Distrust `in_sync` records older than this
    pub cache_trust_expire_secs: Option<u64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            max_wait_secs: 3600,
            lock_ttl_secs: 12 * 3600,
            cache_trust_expire_secs: None,
        }
    }
}

impl SyncSettings {
    const MIN_TRUST_SECS: u64 = 3600;
    const MAX_TRUST_SECS: u64 = 2 * 365 * 24 * 3600;

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    /// Trust window for `in_sync`; thresholds under an hour are ignored
    pub fn cache_trust_expire(&self) -> Option<Duration> {
        self.cache_trust_expire_secs
            .filter(|secs| *secs >= Self::MIN_TRUST_SECS)
            .map(|secs| Duration::from_secs(secs.min(Self::MAX_TRUST_SECS)))
    }
}

/// Workspace-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Cache directory, relative to `.dataprov/` unless absolute
    pub cache_dir: Option<PathBuf>,

    pub sync: SyncSettings,

    pub backends: Vec<BackendConfig>,
}

impl WorkspaceConfig {
    /// Finds a backend by name or numeric id
    pub fn backend(&self, name_or_id: &str) -> Option<&BackendConfig> {
        let by_id = name_or_id.parse::<BackendId>().ok();
        self.backends
            .iter()
            .find(|b| b.name == name_or_id || Some(b.id) == by_id)
    }

    pub fn backend_by_id(&self, id: BackendId) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Rejects duplicate backend ids or names
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();

        for backend in &self.backends {
            if !ids.insert(backend.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend id {}",
                    backend.id
                )));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
        }

        Ok(())
    }
}

/// Global user configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GlobalConfig {
    /// Default output format (text or json)
    pub default_format: OutputFormat,

    /// Where ssh control sockets live (defaults to the workspace)
    pub ssh_control_dir: Option<PathBuf>,
}

/// Output format for commands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Combined configuration (global + workspace)
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub global: GlobalConfig,
    pub workspace_root: Option<PathBuf>,
}

impl Config {
    /// Loads configuration for a specific workspace
    pub fn for_workspace(workspace_root: &Path) -> Result<Self> {
        let global = Self::load_global()?;
        let workspace = Self::load_workspace_config(workspace_root)?;

        Ok(Self {
            workspace,
            global,
            workspace_root: Some(workspace_root.to_path_buf()),
        })
    }

    /// Returns the global config directory
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "dataprov", "dataprov").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Loads global configuration
    pub fn load_global() -> Result<GlobalConfig> {
        let config_dir = match Self::global_config_dir() {
            Some(dir) => dir,
            None => return Ok(GlobalConfig::default()),
        };

        let config_path = config_dir.join("config.toml");
        if !config_path.exists() {
            return Ok(GlobalConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read global config: {}", config_path.display()))?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .context("Failed to parse global config")
    }

    /// Loads workspace configuration from a specific root
    fn load_workspace_config(workspace_root: &Path) -> Result<WorkspaceConfig> {
        let config_path = workspace_root.join(WORKSPACE_DIR).join("config.toml");

        if !config_path.exists() {
            return Ok(WorkspaceConfig::default());
        }

        let content = fs::read_to_string(&config_path).with_context(|| {
            format!("Failed to read workspace config: {}", config_path.display())
        })?;

        let config: WorkspaceConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .context("Failed to parse workspace config")?;

        config.validate()?;
        Ok(config)
    }

    /// Finds the workspace root by looking for a `.dataprov/` directory
    pub fn find_workspace_root() -> Option<PathBuf> {
        let mut current = std::env::current_dir().ok()?;

        loop {
            if current.join(WORKSPACE_DIR).is_dir() {
                return Some(current);
            }

            if !current.pop() {
                return None;
            }
        }
    }

    /// Returns the workspace root, or an error if not in a workspace
    pub fn require_workspace_root(&self) -> Result<&Path> {
        self.workspace_root
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Not in a dataprov workspace. Run 'dataprov init' first."))
    }

    /// Saves the workspace configuration
    pub fn save_workspace(&self) -> Result<()> {
        let root = self.require_workspace_root()?;
        let config_path = root.join(WORKSPACE_DIR).join("config.toml");

        let content = toml::to_string_pretty(&self.workspace)
            .context("Failed to serialize workspace config")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write workspace config: {}", config_path.display()))
    }
}
