//! Workspace management
//!
//! A workspace is a directory holding `.dataprov/`: the configuration, the
//! file catalog, the sync-state database, the caches and the ssh control
//! sockets. It wires those into [`Provider`]s.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::backend::{self, BackendContext, SshConnectionPool};
use crate::domain::{FileId, FileKind, RegisteredFile};
use crate::provider::Provider;
use crate::reconcile::ReconciliationEngine;
use crate::storage::{Catalog, Config, JsonlCatalog, SqliteStateStore, SyncStateTracker, WORKSPACE_DIR};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Not in a dataprov workspace. Run 'dataprov init' first.")]
    NotInWorkspace,

    #[error("Unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("File {0} is not registered")]
    UnknownFile(FileId),
}

const DEFAULT_CONFIG: &str = r#"# dataprov workspace configuration

# Cache directory, relative to .dataprov/ unless absolute
cache_dir = "cache"

[sync]
poll_interval_ms = 250
max_wait_secs = 3600
lock_ttl_secs = 43200
# cache_trust_expire_secs = 86400

# [[backends]]
# id = 1
# name = "main"
# kind = "local"            # local | remote_shell | object_store | repository | smart
# layout = "name_sharded"   # flat | name_sharded | id_sharded
# root = "/data/main"

# [[backends]]
# id = 2
# name = "archive"
# kind = "object_store"
# layout = "id_sharded"
# host = "s3.eu-west-1.amazonaws.com"
# bucket = "archive"
# credentials = "/etc/dataprov/archive-keys.toml"   # access_key_id, secret_access_key, region
"#;

const GITIGNORE: &str = r#"# Cached content and runtime state are local to this machine
cache/
ssh/
state.db*
*.lock
"#;

pub struct Workspace {
    root: PathBuf,
    config: Config,
    catalog: Arc<JsonlCatalog>,
    tracker: Arc<SyncStateTracker>,
    ssh_pool: Arc<SshConnectionPool>,
}

impl Workspace {
    /// Opens an existing workspace at the given path
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let dir = root.join(WORKSPACE_DIR);

        if !dir.is_dir() {
            return Err(WorkspaceError::NotInWorkspace.into());
        }

        let config = Config::for_workspace(&root)?;

        let db_path = dir.join("state.db");
        let store = SqliteStateStore::open(&db_path)
            .with_context(|| format!("Failed to open state store: {}", db_path.display()))?;
        let tracker = Arc::new(SyncStateTracker::new(
            Arc::new(store),
            config.workspace.sync.clone(),
        ));

        let control_dir = config
            .global
            .ssh_control_dir
            .clone()
            .unwrap_or_else(|| dir.join("ssh"));

        Ok(Self {
            catalog: Arc::new(JsonlCatalog::for_workspace(&root)),
            tracker,
            ssh_pool: Arc::new(SshConnectionPool::new(control_dir)),
            root,
            config,
        })
    }

    /// Opens the workspace at the current directory or a parent
    pub fn open_current() -> Result<Self> {
        let root = Config::find_workspace_root().ok_or(WorkspaceError::NotInWorkspace)?;

        Self::open(root)
    }

    /// Initializes a workspace at the given path. Existing files are kept.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let dir = root.join(WORKSPACE_DIR);

        for sub in [dir.clone(), dir.join("cache"), dir.join("ssh")] {
            fs::create_dir_all(&sub)
                .with_context(|| format!("Failed to create directory: {}", sub.display()))?;
        }

        let config_path = dir.join("config.toml");
        if !config_path.exists() {
            fs::write(&config_path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        let gitignore_path = dir.join(".gitignore");
        if !gitignore_path.exists() {
            fs::write(&gitignore_path, GITIGNORE).with_context(|| {
                format!("Failed to write .gitignore: {}", gitignore_path.display())
            })?;
        }

        Self::open(root)
    }

    /// Returns the workspace root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the `.dataprov` directory path
    pub fn dir(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parent directory of the per-backend caches
    pub fn cache_dir(&self) -> PathBuf {
        match &self.config.workspace.cache_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.dir().join(dir),
            None => self.dir().join("cache"),
        }
    }

    pub fn catalog(&self) -> Arc<JsonlCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn tracker(&self) -> Arc<SyncStateTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn backend_context(&self) -> BackendContext {
        BackendContext {
            cache_dir: self.cache_dir(),
            tracker: self.tracker(),
            ssh_pool: Arc::clone(&self.ssh_pool),
        }
    }

    fn shared_catalog(&self) -> Arc<dyn Catalog> {
        self.catalog.clone()
    }

    /// Builds the provider for a backend given by name or id
    pub fn provider(&self, name_or_id: &str) -> Result<Provider> {
        let config = self
            .config
            .workspace
            .backend(name_or_id)
            .ok_or_else(|| WorkspaceError::UnknownBackend(name_or_id.to_string()))?;

        let backend = backend::build(config, &self.backend_context())
            .with_context(|| format!("Failed to build backend '{}'", config.name))?;

        Ok(Provider::new(backend, self.shared_catalog(), self.tracker()))
    }

    /// Builds the provider holding `file`
    pub fn provider_for(&self, file: &RegisteredFile) -> Result<Provider> {
        self.provider(&file.backend_id.to_string())
    }

    pub fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(self.shared_catalog(), self.tracker())
    }

    /// Looks up a registered file
    pub fn file(&self, id: FileId) -> Result<RegisteredFile> {
        self.catalog
            .get(id)?
            .ok_or_else(|| WorkspaceError::UnknownFile(id).into())
    }

    /// Registers a file on a backend, using that backend's layout for the
    /// uniqueness check
    pub fn register(
        &self,
        backend: &str,
        name: &str,
        owner: &str,
        kind: FileKind,
        sub_path: Option<&Path>,
    ) -> Result<RegisteredFile> {
        let config = self
            .config
            .workspace
            .backend(backend)
            .ok_or_else(|| WorkspaceError::UnknownBackend(backend.to_string()))?;

        let file = self
            .catalog
            .register(name, owner, config.id, config.layout, kind, sub_path)
            .with_context(|| format!("Failed to register '{}' on '{}'", name, config.name))?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BackendId;
    use tempfile::TempDir;

    fn with_backend(dir: &TempDir) -> Workspace {
        Workspace::init(dir.path()).unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();

        let config = format!(
            "{}\n[[backends]]\nid = 1\nname = \"main\"\nkind = \"local\"\nlayout = \"name_sharded\"\nroot = \"{}\"\n",
            DEFAULT_CONFIG,
            data.display()
        );
        fs::write(dir.path().join(WORKSPACE_DIR).join("config.toml"), config).unwrap();
        Workspace::open(dir.path()).unwrap()
    }

    #[test]
    fn init_creates_layout() {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path()).unwrap();

        assert!(workspace.dir().join("config.toml").is_file());
        assert!(workspace.dir().join(".gitignore").is_file());
        assert!(workspace.dir().join("state.db").is_file());
        assert_eq!(workspace.cache_dir(), workspace.dir().join("cache"));
        assert!(workspace.cache_dir().is_dir());
        assert!(workspace.config().workspace.backends.is_empty());

        // Second init keeps everything
        Workspace::init(dir.path()).unwrap();
    }

    #[test]
    fn open_outside_workspace_fails() {
        let dir = TempDir::new().unwrap();
        let err = Workspace::open(dir.path()).err().unwrap();
        assert!(err.to_string().contains("dataprov init"));
    }

    #[test]
    fn provider_by_name_or_id() {
        let dir = TempDir::new().unwrap();
        let workspace = with_backend(&dir);

        assert_eq!(workspace.provider("main").unwrap().config().id, BackendId::new(1));
        assert_eq!(workspace.provider("1").unwrap().name(), "main");
        assert!(workspace.provider("nope").is_err());
    }

    #[test]
    fn register_and_look_up() {
        let dir = TempDir::new().unwrap();
        let workspace = with_backend(&dir);

        let file = workspace
            .register("main", "alpha", "bob", FileKind::Single, None)
            .unwrap();
        assert_eq!(workspace.file(file.id).unwrap().name, "alpha");
        assert_eq!(workspace.provider_for(&file).unwrap().name(), "main");

        // Sub-paths need a flat layout
        assert!(workspace
            .register("main", "beta", "bob", FileKind::Single, Some(Path::new("x")))
            .is_err());
        assert!(workspace.file(FileId::new(99)).is_err());
    }
}
