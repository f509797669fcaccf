//! Object storage behind a narrow async trait.
//!
//! [`S3ObjectStore`] talks to any S3-compatible endpoint (Cloudflare R2 in production),
//! [`LocalObjectStore`] keeps objects in a directory for development, and
//! [`MemoryObjectStore`] is a fake for tests with call counters and failure injection.

use crate::config::{SandboxConfig, StorageBackend};
use crate::error::{SandboxError, SandboxResult};
use crate::security::{sanitize_relative, to_slash};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use dashmap::{DashMap, DashSet};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Listed object: full key, size in bytes, and the store's version tag (ETag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// Minimal object-store surface used by the sync engine.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> SandboxResult<Vec<ObjectMeta>>;

    /// Object body. Missing key is [`SandboxError::NotFound`].
    async fn get(&self, key: &str) -> SandboxResult<Vec<u8>>;

    /// Stores `body` under `key` and returns the new ETag.
    async fn put(&self, key: &str, body: Vec<u8>) -> SandboxResult<String>;

    /// Removes `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> SandboxResult<()>;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}

/// SHA-256 hex digest; used for content hashes and as the ETag of non-S3 stores.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Builds the store selected by `config.storage_backend`.
pub async fn build_store(config: &SandboxConfig) -> SandboxResult<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.storage_backend {
        StorageBackend::S3 => Arc::new(S3ObjectStore::from_config(config).await?),
        StorageBackend::Local => Arc::new(LocalObjectStore::new(config.local_storage_path.clone())?),
        StorageBackend::Memory => Arc::new(MemoryObjectStore::new()),
    };
    info!(target: "devlabo::sync", backend = store.backend(), "object store ready");
    Ok(store)
}

// -----------------------------------------------------------------------------
// S3 / R2
// -----------------------------------------------------------------------------

/// S3-compatible store. With `endpoint_url` set, path-style addressing is forced, which R2
/// and MinIO require.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub async fn from_config(config: &SandboxConfig) -> SandboxResult<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| SandboxError::Config("bucket is required for the s3 backend".into()))?;

        let mut aws_config_builder = aws_config::from_env()
            .region(aws_sdk_s3::config::Region::new(config.region.clone()));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            aws_config_builder = aws_config_builder.credentials_provider(
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "devlabo-config"),
            );
        }

        let aws_config = aws_config_builder.load().await;

        let s3_config = if let Some(endpoint) = &config.endpoint_url {
            aws_sdk_s3::config::Builder::from(&aws_config)
                .endpoint_url(endpoint)
                .force_path_style(true)
                .build()
        } else {
            aws_sdk_s3::config::Builder::from(&aws_config).build()
        };

        Ok(Self::new(S3Client::from_conf(s3_config), bucket))
    }
}

fn unquote_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, prefix: &str) -> SandboxResult<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SandboxError::Storage(e.to_string()))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectMeta {
                        key: key.to_string(),
                        size: object.size().unwrap_or_default().max(0) as u64,
                        etag: unquote_etag(object.e_tag()),
                    });
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        debug!(target: "devlabo::sync", prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn get(&self, key: &str) -> SandboxResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    SandboxError::NotFound(key.to_string())
                } else {
                    SandboxError::Storage(service.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| SandboxError::Storage(e.to_string()))?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> SandboxResult<String> {
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| SandboxError::Storage(e.to_string()))?;
        Ok(unquote_etag(response.e_tag()))
    }

    async fn delete(&self, key: &str) -> SandboxResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| SandboxError::Storage(e.to_string()))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

// -----------------------------------------------------------------------------
// Local directory
// -----------------------------------------------------------------------------

/// Objects as plain files under `root`; the ETag is the SHA-256 of the content.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> SandboxResult<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> SandboxResult<PathBuf> {
        let rel = sanitize_relative(key).map_err(|_| SandboxError::Storage(format!("invalid key {key:?}")))?;
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list(&self, prefix: &str) -> SandboxResult<Vec<ObjectMeta>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut objects = Vec::new();
            for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = to_slash(rel);
                // In-flight temp files from `put`.
                if !key.starts_with(&prefix) || key.ends_with(".devlabo-tmp") {
                    continue;
                }
                let data = std::fs::read(entry.path())?;
                objects.push(ObjectMeta {
                    key,
                    size: data.len() as u64,
                    etag: sha256_hex(&data),
                });
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
        .await
        .map_err(|e| SandboxError::Storage(format!("list task failed: {e}")))?
    }

    async fn get(&self, key: &str) -> SandboxResult<Vec<u8>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::NotFound(key.to_string()))
            }
            Err(e) => Err(SandboxError::Storage(e.to_string())),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> SandboxResult<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let etag = sha256_hex(&body);
        let tmp = path.with_extension(format!("{}.devlabo-tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(etag)
    }

    async fn delete(&self, key: &str) -> SandboxResult<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Storage(e.to_string())),
        }
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

// -----------------------------------------------------------------------------
// In-memory
// -----------------------------------------------------------------------------

/// In-memory store. Counts calls and can be made unavailable, slow, or fail on chosen keys.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, (Vec<u8>, String)>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    failing_keys: DashSet<String>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// Seeds an object without counting a `put`.
    pub fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        let etag = sha256_hex(&body);
        self.objects.insert(key.to_string(), (body, etag));
    }

    pub fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|o| o.0.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// While false every call fails with [`SandboxError::Storage`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes `get`/`put` on one key fail.
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_keys.clear();
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    async fn check(&self, key: Option<&str>) -> SandboxResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(SandboxError::Storage("store unavailable".into()));
        }
        if let Some(key) = key {
            if self.failing_keys.contains(key) {
                return Err(SandboxError::Storage(format!("injected failure for {key}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> SandboxResult<Vec<ObjectMeta>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check(None).await?;
        let mut objects: Vec<ObjectMeta> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| ObjectMeta {
                key: e.key().clone(),
                size: e.value().0.len() as u64,
                etag: e.value().1.clone(),
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn get(&self, key: &str) -> SandboxResult<Vec<u8>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check(Some(key)).await?;
        self.contents(key)
            .ok_or_else(|| SandboxError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> SandboxResult<String> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check(Some(key)).await?;
        let etag = sha256_hex(&body);
        self.objects.insert(key.to_string(), (body, etag.clone()));
        Ok(etag)
    }

    async fn delete(&self, key: &str) -> SandboxResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check(Some(key)).await?;
        self.objects.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
