//! Bucket primitives on top of `object_store`
//!
//! [`ObjectStoreBuckets`] opens one `object_store` client per bucket and
//! drives it from synchronous code through a private tokio runtime.
//! Backends with a `host` talk to S3 or an S3-compatible endpoint; the
//! others keep each bucket as a directory below `root`. Tests use the
//! in-memory store.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use crate::error::{Error, Result};
use crate::storage::BackendConfig;

/// Uploads larger than this go through a multipart upload
const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Bucket and object operations
pub trait BucketStore: Send + Sync {
    fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Stores everything `reader` yields under `key`; returns the size
    fn put(&self, bucket: &str, key: &str, reader: &mut dyn Read) -> Result<u64>;

    /// Opens `key` for streaming
    fn get(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Deletes `key`; absent keys are fine
    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Every key in `bucket`, sorted
    fn list(&self, bucket: &str) -> Result<Vec<ObjectInfo>>;
}

/// Access keys read from a backend's `credentials` file
#[derive(Debug, Clone, Deserialize)]
struct AccessKeys {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    region: Option<String>,
}

impl AccessKeys {
    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read credentials {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Configuration(format!("invalid credentials {}: {}", path.display(), e))
        })
    }
}

enum Connector {
    Memory,
    Local(PathBuf),
    S3 {
        endpoint: String,
        keys: Option<AccessKeys>,
    },
}

/// [`BucketStore`] backed by the `object_store` crate
pub struct ObjectStoreBuckets {
    connector: Connector,
    runtime: Arc<Runtime>,
    opened: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectStoreBuckets {
    fn with_connector(connector: Connector) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("dataprov-objects")
            .enable_all()
            .build()?;

        Ok(Self {
            connector,
            runtime: Arc::new(runtime),
            opened: Mutex::new(HashMap::new()),
        })
    }

    /// Buckets that live only as long as this value
    pub fn in_memory() -> Result<Self> {
        Self::with_connector(Connector::Memory)
    }

    /// One directory per bucket below `root`
    pub fn on_filesystem(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_connector(Connector::Local(root.into()))
    }

    /// S3 or an S3-compatible service at `endpoint`
    ///
    /// Without a credentials file the usual `AWS_*` environment variables
    /// apply.
    pub fn s3(endpoint: impl Into<String>, credentials: Option<&Path>) -> Result<Self> {
        let keys = credentials.map(AccessKeys::read).transpose()?;
        Self::with_connector(Connector::S3 {
            endpoint: endpoint.into(),
            keys,
        })
    }

    /// S3 when the backend names a host, a directory store on `root` otherwise
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        match config.host.as_deref().filter(|h| !h.trim().is_empty()) {
            Some(host) => Self::s3(endpoint_url(host, config.port), config.credentials.as_deref()),
            None => Self::on_filesystem(config.require_root()?),
        }
    }

    /// `memory`, `file` or `s3`
    pub fn scheme(&self) -> &'static str {
        match self.connector {
            Connector::Memory => "memory",
            Connector::Local(_) => "file",
            Connector::S3 { .. } => "s3",
        }
    }

    /// Client for `bucket`; `None` when the bucket does not exist yet
    fn open(&self, bucket: &str, create: bool) -> Result<Option<Arc<dyn ObjectStore>>> {
        if !valid_component(bucket) {
            return Err(Error::InvalidName(bucket.to_string()));
        }

        let mut opened = self.opened.lock();
        if let Some(store) = opened.get(bucket) {
            return Ok(Some(Arc::clone(store)));
        }

        let store: Arc<dyn ObjectStore> = match &self.connector {
            Connector::Memory => {
                if !create {
                    return Ok(None);
                }
                Arc::new(InMemory::new())
            }
            Connector::Local(root) => {
                if !root.is_dir() {
                    return Err(Error::Transient(format!(
                        "object store at {} is unreachable",
                        root.display()
                    )));
                }
                let dir = root.join(bucket);
                if !dir.is_dir() {
                    if !create {
                        return Ok(None);
                    }
                    match fs::create_dir(&dir) {
                        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => return Err(e.into()),
                        _ => {}
                    }
                }
                Arc::new(LocalFileSystem::new_with_prefix(&dir).map_err(store_error)?)
            }
            Connector::S3 { endpoint, keys } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_endpoint(endpoint.as_str())
                    .with_allow_http(endpoint.starts_with("http://"));
                if let Some(keys) = keys {
                    builder = builder
                        .with_access_key_id(&keys.access_key_id)
                        .with_secret_access_key(&keys.secret_access_key);
                    if let Some(region) = &keys.region {
                        builder = builder.with_region(region);
                    }
                }
                Arc::new(builder.build().map_err(|e| Error::Configuration(e.to_string()))?)
            }
        };

        if create {
            tracing::info!(bucket, scheme = self.scheme(), "Created bucket");
        }
        opened.insert(bucket.to_string(), Arc::clone(&store));
        Ok(Some(store))
    }

    fn require(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        self.open(bucket, false)?
            .ok_or_else(|| Error::NotFound(format!("bucket '{}'", bucket)))
    }

    /// Uploads in parts of [`PART_SIZE`]; aborts the upload on any failure
    fn put_multipart(
        &self,
        store: &dyn ObjectStore,
        path: &ObjectPath,
        first: Vec<u8>,
        reader: &mut dyn Read,
    ) -> Result<u64> {
        let mut upload = self
            .runtime
            .block_on(store.put_multipart(path))
            .map_err(store_error)?;

        let mut size = 0u64;
        let mut part = first;
        while !part.is_empty() {
            size += part.len() as u64;
            if let Err(e) = self.runtime.block_on(upload.put_part(PutPayload::from(part))) {
                let _ = self.runtime.block_on(upload.abort());
                return Err(store_error(e));
            }
            part = match read_part(reader) {
                Ok(part) => part,
                Err(e) => {
                    let _ = self.runtime.block_on(upload.abort());
                    return Err(e.into());
                }
            };
        }

        self.runtime.block_on(upload.complete()).map_err(store_error)?;
        Ok(size)
    }
}

/// `https://host[:port]` unless `host` already carries a scheme
fn endpoint_url(host: &str, port: Option<u16>) -> String {
    let base = if host.contains("://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host)
    };
    match port {
        Some(port) => format!("{}:{}", base, port),
        None => base,
    }
}

/// Keys and buckets are single path components
fn valid_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\0')
}

fn object_path(key: &str) -> Result<ObjectPath> {
    if !valid_component(key) {
        return Err(Error::InvalidName(key.to_string()));
    }
    Ok(ObjectPath::from(key))
}

/// Reverses the percent-encoding `object_store` applies to reserved characters
fn decode_location(location: &str) -> String {
    let bytes = location.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Reads up to [`PART_SIZE`] bytes; short only at end of input
fn read_part(reader: &mut dyn Read) -> io::Result<Vec<u8>> {
    let mut part = Vec::with_capacity(PART_SIZE);
    reader.take(PART_SIZE as u64).read_to_end(&mut part)?;
    Ok(part)
}

fn store_error(e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { path, .. } => Error::NotFound(format!("object '{}'", path)),
        object_store::Error::AlreadyExists { path, .. } => {
            Error::Integrity(format!("object '{}' already exists", path))
        }
        object_store::Error::NotSupported { source, .. } => Error::Unsupported(source.to_string()),
        other => Error::Transient(other.to_string()),
    }
}

fn is_missing_bucket(e: &object_store::Error) -> bool {
    matches!(e, object_store::Error::NotFound { .. }) || e.to_string().contains("NoSuchBucket")
}

impl BucketStore for ObjectStoreBuckets {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let Some(store) = self.open(bucket, false)? else {
            return Ok(false);
        };
        if !matches!(self.connector, Connector::S3 { .. }) {
            return Ok(true);
        }

        match self.runtime.block_on(store.list_with_delimiter(None)) {
            Ok(_) => Ok(true),
            Err(e) if is_missing_bucket(&e) => Ok(false),
            Err(e) => Err(store_error(e)),
        }
    }

    fn create_bucket(&self, bucket: &str) -> Result<()> {
        if let Connector::S3 { endpoint, .. } = &self.connector {
            if self.bucket_exists(bucket)? {
                return Ok(());
            }
            return Err(Error::Unsupported(format!(
                "bucket '{}' does not exist on {}; create it on the service first",
                bucket, endpoint
            )));
        }

        self.open(bucket, true)?;
        Ok(())
    }

    fn put(&self, bucket: &str, key: &str, reader: &mut dyn Read) -> Result<u64> {
        let path = object_path(key)?;
        let store = self.require(bucket)?;

        let first = read_part(reader)?;
        if first.len() < PART_SIZE {
            let size = first.len() as u64;
            self.runtime
                .block_on(store.put(&path, PutPayload::from(first)))
                .map_err(store_error)?;
            return Ok(size);
        }

        self.put_multipart(store.as_ref(), &path, first, reader)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = object_path(key)?;
        let store = self.require(bucket)?;

        let result = self
            .runtime
            .block_on(store.get(&path))
            .map_err(|e| match e {
                object_store::Error::NotFound { .. } => {
                    Error::NotFound(format!("object '{}' in bucket '{}'", key, bucket))
                }
                other => store_error(other),
            })?;

        Ok(Box::new(StreamReader {
            runtime: Arc::clone(&self.runtime),
            stream: result.into_stream(),
            chunk: Bytes::new(),
        }))
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = object_path(key)?;
        let Some(store) = self.open(bucket, false)? else {
            return Ok(());
        };

        match self.runtime.block_on(store.delete(&path)) {
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            other => other.map_err(store_error),
        }
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = object_path(key)?;
        let Some(store) = self.open(bucket, false)? else {
            return Ok(false);
        };

        match self.runtime.block_on(store.head(&path)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(store_error(e)),
        }
    }

    fn list(&self, bucket: &str) -> Result<Vec<ObjectInfo>> {
        let Some(store) = self.open(bucket, false)? else {
            return Ok(Vec::new());
        };

        let metas: Vec<object_store::ObjectMeta> = self
            .runtime
            .block_on(store.list(None).try_collect())
            .map_err(store_error)?;

        let mut objects: Vec<ObjectInfo> = metas
            .into_iter()
            .map(|meta| ObjectInfo {
                key: decode_location(meta.location.as_ref()),
                size: meta.size as u64,
                modified: meta.last_modified,
            })
            .collect();

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

/// Blocking [`Read`] over the byte stream of a download
struct StreamReader {
    runtime: Arc<Runtime>,
    stream: BoxStream<'static, object_store::Result<Bytes>>,
    chunk: Bytes,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.chunk.is_empty() {
            match self.runtime.block_on(self.stream.next()) {
                Some(Ok(bytes)) => self.chunk = bytes,
                Some(Err(e)) => return Err(io::Error::other(e)),
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.chunk.len());
        let head = self.chunk.split_to(n);
        buf[..n].copy_from_slice(&head);
        Ok(n)
    }
}
