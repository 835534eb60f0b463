//! End-to-end storage scenarios through the library API
//!
//! Each test wires catalog, state store, backends and providers by hand,
//! the way a workspace does, and checks one behavior across all of them.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dataprov::backend::{
    BackendContext, BucketStore, CompositeBackend, LocalBackend, ObjectInfo, ObjectStoreBackend,
    ObjectStoreBuckets, Selection, SshConnectionPool, StorageBackend,
};
use dataprov::domain::{FileKind, IssueKind, RegisteredFile, ShardingScheme, SyncState};
use dataprov::reconcile::{ReconciliationEngine, RepairOutcome};
use dataprov::storage::{
    BackendConfig, BackendKind, Catalog, JsonlCatalog, LocalCacheManager, SqliteStateStore,
    SyncSettings, SyncStateTracker,
};
use dataprov::Provider;
use tempfile::TempDir;
use walkdir::WalkDir;

fn settings() -> SyncSettings {
    SyncSettings {
        poll_interval_ms: 10,
        max_wait_secs: 30,
        ..SyncSettings::default()
    }
}

/// A fresh tracker on the shared database, standing in for one process
fn tracker(dir: &Path) -> Arc<SyncStateTracker> {
    let store = SqliteStateStore::open(dir.join("state.db")).unwrap();
    Arc::new(SyncStateTracker::new(Arc::new(store), settings()))
}

fn context(dir: &Path, tracker: &Arc<SyncStateTracker>) -> BackendContext {
    BackendContext {
        cache_dir: dir.join("cache"),
        tracker: Arc::clone(tracker),
        ssh_pool: Arc::new(SshConnectionPool::new(dir.join("ssh"))),
    }
}

fn catalog(dir: &Path) -> Arc<JsonlCatalog> {
    Arc::new(JsonlCatalog::new(dir.join("catalog.jsonl")))
}

fn local_provider(dir: &Path, catalog: &Arc<JsonlCatalog>, tracker: &Arc<SyncStateTracker>) -> Provider {
    let root = dir.join("data");
    fs::create_dir_all(&root).unwrap();

    let config = BackendConfig::new(1, "main", BackendKind::Local, ShardingScheme::NameSharded)
        .with_root(root);
    let backend = LocalBackend::new(config, &context(dir, tracker)).unwrap();
    let shared: Arc<dyn Catalog> = catalog.clone();
    Provider::new(Box::new(backend), shared, Arc::clone(tracker))
}

fn register(catalog: &JsonlCatalog, provider: &Provider, name: &str) -> RegisteredFile {
    catalog
        .register(
            name,
            "bob",
            provider.config().id,
            provider.config().layout,
            FileKind::Single,
            None,
        )
        .unwrap()
}

/// Object store that counts downloads and makes them slow
struct SlowStore {
    inner: ObjectStoreBuckets,
    gets: Arc<AtomicUsize>,
}

impl BucketStore for SlowStore {
    fn bucket_exists(&self, bucket: &str) -> dataprov::Result<bool> {
        self.inner.bucket_exists(bucket)
    }

    fn create_bucket(&self, bucket: &str) -> dataprov::Result<()> {
        self.inner.create_bucket(bucket)
    }

    fn put(&self, bucket: &str, key: &str, reader: &mut dyn Read) -> dataprov::Result<u64> {
        self.inner.put(bucket, key, reader)
    }

    fn get(&self, bucket: &str, key: &str) -> dataprov::Result<Box<dyn Read + Send>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        self.inner.get(bucket, key)
    }

    fn delete(&self, bucket: &str, key: &str) -> dataprov::Result<()> {
        self.inner.delete(bucket, key)
    }

    fn exists(&self, bucket: &str, key: &str) -> dataprov::Result<bool> {
        self.inner.exists(bucket, key)
    }

    fn list(&self, bucket: &str) -> dataprov::Result<Vec<ObjectInfo>> {
        self.inner.list(bucket)
    }
}

#[test]
fn concurrent_fills_transfer_once() {
    let dir = TempDir::new().unwrap();
    let store_root = dir.path().join("objects");
    fs::create_dir_all(&store_root).unwrap();

    let mut config = BackendConfig::new(3, "bucket", BackendKind::ObjectStore, ShardingScheme::IdSharded)
        .with_root(&store_root);
    config.bucket = Some("b".into());

    let catalog = catalog(dir.path());
    let file = catalog
        .register("alpha", "bob", config.id, config.layout, FileKind::Single, None)
        .unwrap();

    let seed = ObjectStoreBuckets::on_filesystem(&store_root).unwrap();
    seed.create_bucket("b").unwrap();
    seed.put("b", &dataprov::backend::encode_key(&file), &mut &b"payload"[..])
        .unwrap();

    // Create the schema before the "processes" start
    tracker(dir.path());

    let gets = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let dir = dir.path().to_path_buf();
            let config = config.clone();
            let catalog = Arc::clone(&catalog);
            let gets = Arc::clone(&gets);
            let file = file.clone();
            let store_root = store_root.clone();

            thread::spawn(move || {
                let tracker = tracker(&dir);
                let cache = LocalCacheManager::new(dir.join("cache"), config.layout, config.id, Arc::clone(&tracker));
                let store = SlowStore {
                    inner: ObjectStoreBuckets::on_filesystem(store_root).unwrap(),
                    gets,
                };
                let backend = ObjectStoreBackend::new(config, Arc::new(store), cache).unwrap();
                let shared: Arc<dyn Catalog> = catalog;
                let provider = Provider::new(Box::new(backend), shared, Arc::clone(&tracker));

                let filled = provider.sync_to_cache(&file).unwrap();
                (filled, provider.state(&file).unwrap(), provider.cache_full_path(&file))
            })
        })
        .collect();

    let results: Vec<(bool, SyncState, PathBuf)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(gets.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|(filled, _, _)| *filled).count(), 1);
    for (_, state, path) in &results {
        assert_eq!(*state, SyncState::InSync);
        assert_eq!(fs::read(path).unwrap(), b"payload");
    }
}

#[test]
fn reconciliation_finds_exact_drift_and_repairs_it() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog(dir.path());
    let tracker = tracker(dir.path());
    let provider = local_provider(dir.path(), &catalog, &tracker);
    let root = dir.path().join("data");

    // N = 3 legitimate files
    let source = dir.path().join("source.bin");
    fs::write(&source, b"content").unwrap();
    let legit: Vec<RegisteredFile> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| {
            let file = register(&catalog, &provider, name);
            provider.copy_from_local(&file, &source).unwrap()
        })
        .collect();

    // K = 2 missing
    register(&catalog, &provider, "lost-1");
    register(&catalog, &provider, "lost-2");

    // M = 2 orphans: a stray subtree under the owner and a stray top-level file
    fs::create_dir_all(root.join("bob/zz/zz")).unwrap();
    fs::write(root.join("bob/zz/zz/stray"), b"x").unwrap();
    fs::write(root.join("junk"), b"x").unwrap();

    let engine = ReconciliationEngine::new(catalog.clone(), Arc::clone(&tracker));
    let issues = engine.report(provider.backend()).unwrap();

    let orphans: Vec<_> = issues.iter().filter(|i| i.kind == IssueKind::Orphan).cloned().collect();
    let missing = issues.iter().filter(|i| i.kind == IssueKind::Missing).count();
    assert_eq!(orphans.len(), 2);
    assert_eq!(missing, 2);
    assert_eq!(issues.len(), 4);

    for issue in &orphans {
        assert_eq!(engine.repair(provider.backend(), issue).unwrap(), RepairOutcome::Repaired);
    }
    for issue in &orphans {
        assert_eq!(
            engine.repair(provider.backend(), issue).unwrap(),
            RepairOutcome::AlreadyResolved
        );
    }

    // Exactly the legitimate files remain, and every directory leads to one
    let paths: Vec<PathBuf> = legit
        .iter()
        .map(|f| provider.cache_full_path(f))
        .collect();
    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = entry.unwrap();
        if entry.file_type().is_dir() {
            assert!(
                paths.iter().any(|p| p.starts_with(entry.path())),
                "dangling directory {}",
                entry.path().display()
            );
        } else {
            assert!(paths.iter().any(|p| p == entry.path()));
        }
    }
    assert!(paths.iter().all(|p| p.is_file()));

    let remaining = engine.report(provider.backend()).unwrap();
    assert!(remaining.iter().all(|i| i.kind == IssueKind::Missing));
}

#[test]
fn local_lifecycle_keeps_owner_directory() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog(dir.path());
    let tracker = tracker(dir.path());
    let provider = local_provider(dir.path(), &catalog, &tracker);
    let root = dir.path().join("data");

    let file = register(&catalog, &provider, "alpha");
    let shard = provider.cache_prepare(&file).unwrap();

    let relative = shard.strip_prefix(&root).unwrap();
    let segments: Vec<_> = relative.iter().map(|s| s.to_string_lossy().into_owned()).collect();
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[0], "bob");
    assert!(shard.is_dir());

    let source = dir.path().join("source.bin");
    fs::write(&source, b"content").unwrap();
    provider.copy_from_local(&file, &source).unwrap();
    assert!(provider.cache_full_path(&file).is_file());

    provider.erase(&file).unwrap();
    assert!(!provider.cache_full_path(&file).exists());
    assert!(!root.join("bob").join(&segments[1]).exists());
    assert!(root.join("bob").is_dir());
    assert!(root.is_dir());
    assert_eq!(provider.state(&file).unwrap(), SyncState::NoCache);
}

#[test]
fn composite_dispatch_is_decided_once() {
    let dir = TempDir::new().unwrap();
    let tracker = tracker(dir.path());
    let ctx = context(dir.path(), &tracker);
    let root = dir.path().join("data");
    fs::create_dir_all(&root).unwrap();

    let this_host = hostname::get().unwrap().to_string_lossy().into_owned();
    let config = BackendConfig::new(5, "smart", BackendKind::Smart, ShardingScheme::NameSharded)
        .with_host(this_host)
        .with_root(&root);
    let local = CompositeBackend::new(config, &ctx).unwrap();

    assert_eq!(local.selection(), Selection::Local);
    assert!(local.selected().cache_is_authoritative());
    assert!(local.is_fast_syncing());

    // Calls reach the local filesystem
    let file = RegisteredFile::new(dataprov::FileId::new(1), "alpha", "bob", local.config().id);
    let shard = local.cache().prepare(&file).unwrap();
    fs::write(shard.join("alpha"), b"x").unwrap();
    assert!(local.report(&[file.clone()]).unwrap().is_empty());
    local.erase(&file).unwrap();
    assert!(!shard.join("alpha").exists());

    let config = BackendConfig::new(6, "far", BackendKind::Smart, ShardingScheme::NameSharded)
        .with_host("elsewhere.invalid")
        .with_root(&root);
    let remote = CompositeBackend::new(config, &ctx).unwrap();

    assert_eq!(remote.selection(), Selection::Remote);
    assert!(!remote.selected().cache_is_authoritative());
    assert!(remote.is_browsable());
}
