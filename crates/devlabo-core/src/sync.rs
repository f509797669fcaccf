//! Durable sync between a project's local workspace and object storage.
//!
//! Object storage is the source of truth. `pull` reconciles the disposable local tree on
//! startup, `push` uploads changed paths, and a background worker coalesces change
//! notifications from the file API into batched pushes.

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::security::{resolve, sanitize_relative, to_slash};
use crate::shared::{Module, ProjectKey};
use crate::storage::{sha256_hex, ObjectStore};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Suffix of in-flight temp files written by [`write_atomic`]. Never synced.
pub const TEMP_SUFFIX: &str = ".devlabo-tmp";

// -----------------------------------------------------------------------------
// Ignore rules
// -----------------------------------------------------------------------------

/// Paths never synced: dependency caches, VCS metadata, env files, build output.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    dirs: Vec<String>,
    files: Vec<String>,
    suffixes: Vec<String>,
}

impl IgnoreRules {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            dirs: config.ignore_dirs.clone(),
            files: config.ignore_files.clone(),
            suffixes: config.ignore_suffixes.clone(),
        }
    }

    /// `rel` is `/`-separated, relative to the workspace or a module root.
    pub fn is_ignored(&self, rel: &str) -> bool {
        let parts: Vec<&str> = rel.split('/').filter(|p| !p.is_empty()).collect();
        let Some((name, dirs)) = parts.split_last() else {
            return false;
        };
        if dirs.iter().any(|d| self.dirs.iter().any(|i| i == d)) {
            return true;
        }
        if self.dirs.iter().any(|i| i == name) || self.files.iter().any(|i| i == name) {
            return true;
        }
        if name.starts_with(".env.") || name.ends_with(TEMP_SUFFIX) {
            return true;
        }
        self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

// -----------------------------------------------------------------------------
// Manifest and reports
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub content_hash: String,
    /// ETag observed at the last pull or push.
    pub remote_tag: String,
}

/// Workspace-relative path (`frontend/src/App.jsx`) → last synced state. In memory only.
#[derive(Debug, Default)]
pub struct SyncManifest {
    entries: DashMap<String, ManifestEntry>,
}

impl SyncManifest {
    pub fn get(&self, rel: &str) -> Option<ManifestEntry> {
        self.entries.get(rel).map(|e| e.clone())
    }

    pub fn record(&self, rel: &str, content_hash: String, remote_tag: String) {
        self.entries.insert(
            rel.to_string(),
            ManifestEntry {
                content_hash,
                remote_tag,
            },
        );
    }

    pub fn remove(&self, rel: &str) {
        self.entries.remove(rel);
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl PushReport {
    fn merge(&mut self, other: &PushReport) {
        self.uploaded += other.uploaded;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

/// Result of pushing one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Uploaded,
    Skipped,
    Deleted,
}

// -----------------------------------------------------------------------------
// Filesystem helpers
// -----------------------------------------------------------------------------

/// Writes `data` to a sibling temp file, then renames it over `path`.
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"))?;
    tokio::fs::create_dir_all(parent).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.{}{TEMP_SUFFIX}", uuid::Uuid::new_v4().simple()));
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Splits a workspace-relative path into its module and the path inside the module.
/// Paths outside the four module subtrees and module roots themselves are rejected.
pub fn split_workspace_path(rel: &str) -> SandboxResult<(Module, String)> {
    let normalized = sanitize_relative(rel)?;
    let mut components = normalized.components();
    let first = match components.next() {
        Some(Component::Normal(seg)) => seg.to_string_lossy().into_owned(),
        _ => return Err(SandboxError::PathTraversal(rel.to_string())),
    };
    let module = Module::from_dir_name(&first).ok_or_else(|| SandboxError::UnknownModule(first.clone()))?;
    let inner = to_slash(components.as_path());
    if inner.is_empty() {
        return Err(SandboxError::PathTraversal(format!("{rel:?}: module root is not a file")));
    }
    Ok((module, inner))
}

/// Workspace-relative form of a module path.
pub fn workspace_path(module: Module, inner: &str) -> String {
    format!("{}/{}", module.dir_name(), inner.trim_start_matches('/'))
}

// -----------------------------------------------------------------------------
// Sync engine
// -----------------------------------------------------------------------------

/// Reconciles one project's workspace with `{user}/{project}/` in object storage.
pub struct SyncEngine {
    key: ProjectKey,
    workspace: PathBuf,
    store: Arc<dyn ObjectStore>,
    manifest: SyncManifest,
    degraded: DashSet<String>,
    ignore: IgnoreRules,
    config: Arc<SandboxConfig>,
}

impl SyncEngine {
    pub fn new(
        key: ProjectKey,
        workspace: PathBuf,
        store: Arc<dyn ObjectStore>,
        config: Arc<SandboxConfig>,
    ) -> Self {
        Self {
            key,
            workspace,
            store,
            manifest: SyncManifest::default(),
            degraded: DashSet::new(),
            ignore: IgnoreRules::from_config(&config),
            config,
        }
    }

    pub fn manifest(&self) -> &SyncManifest {
        &self.manifest
    }

    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.ignore
    }

    pub fn is_degraded(&self, rel: &str) -> bool {
        self.degraded.contains(rel)
    }

    pub fn degraded_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.degraded.iter().map(|p| p.clone()).collect();
        paths.sort();
        paths
    }

    fn object_key(&self, rel: &str) -> String {
        format!("{}{}", self.key.storage_prefix(), rel)
    }

    /// Local absolute path for a workspace-relative path, through path security.
    pub fn local_path(&self, rel: &str) -> SandboxResult<PathBuf> {
        let (module, inner) = split_workspace_path(rel)?;
        resolve(&self.workspace.join(module.dir_name()), &inner)
    }

    /// Runs one storage call with a per-call timeout and bounded exponential backoff.
    /// `NotFound` is final.
    async fn with_retry<T, F, Fut>(&self, op: &str, key: &str, mut call: F) -> SandboxResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SandboxResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.config.object_timeout(), call()).await {
                Ok(r) => r,
                Err(_) => Err(SandboxError::Timeout(format!("{op} {key}"))),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e @ SandboxError::NotFound(_)) => return Err(e),
                Err(e) if attempt >= self.config.sync_retry_limit => return Err(e),
                Err(e) => {
                    let delay = self.config.sync_backoff(attempt);
                    warn!(
                        target: "devlabo::sync",
                        op,
                        key,
                        attempt = attempt + 1,
                        error = %e,
                        "storage call failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Downloads remote objects that differ from the local tree. Listing failure is fatal;
    /// per-object failures mark the path degraded and the pull still succeeds.
    pub async fn pull(&self) -> SandboxResult<PullReport> {
        let prefix = self.key.storage_prefix();
        let objects = self
            .with_retry("list", &prefix, || self.store.list(&prefix))
            .await
            .map_err(|e| SandboxError::SyncPullFailure(e.to_string()))?;

        let mut report = PullReport::default();
        for object in objects {
            let Some(rel) = object.key.strip_prefix(&prefix) else {
                continue;
            };
            if self.ignore.is_ignored(rel) {
                report.skipped += 1;
                continue;
            }
            let path = match self.local_path(rel) {
                Ok(p) => p,
                Err(e) => {
                    debug!(target: "devlabo::sync", key = %object.key, error = %e, "skipping object outside module trees");
                    report.skipped += 1;
                    continue;
                }
            };

            if let Some(entry) = self.manifest.get(rel) {
                if entry.remote_tag == object.etag {
                    if let Ok(local) = tokio::fs::read(&path).await {
                        if sha256_hex(&local) == entry.content_hash {
                            report.skipped += 1;
                            continue;
                        }
                    }
                }
            }

            let downloaded = match self.with_retry("get", &object.key, || self.store.get(&object.key)).await {
                Ok(data) => write_atomic(&path, &data)
                    .await
                    .map(|_| data)
                    .map_err(SandboxError::from),
                Err(e) => Err(e),
            };
            match downloaded {
                Ok(data) => {
                    self.manifest.record(rel, sha256_hex(&data), object.etag.clone());
                    self.degraded.remove(rel);
                    report.downloaded += 1;
                }
                Err(e) => {
                    warn!(
                        target: "devlabo::sync",
                        user = %self.key.user_id,
                        project = %self.key.project_id,
                        path = rel,
                        error = %e,
                        "object download failed, path marked degraded"
                    );
                    self.degraded.insert(rel.to_string());
                    report.failed += 1;
                }
            }
        }

        info!(
            target: "devlabo::sync",
            user = %self.key.user_id,
            project = %self.key.project_id,
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed,
            "pull complete"
        );
        Ok(report)
    }

    /// Uploads or deletes one workspace-relative path according to the local tree.
    pub async fn push_path(&self, rel: &str) -> SandboxResult<PushOutcome> {
        let path = self.local_path(rel)?;
        if self.ignore.is_ignored(rel) {
            return Ok(PushOutcome::Skipped);
        }
        let key = self.object_key(rel);

        match tokio::fs::read(&path).await {
            Ok(data) => {
                let hash = sha256_hex(&data);
                if self
                    .manifest
                    .get(rel)
                    .is_some_and(|entry| entry.content_hash == hash)
                {
                    return Ok(PushOutcome::Skipped);
                }
                let etag = self
                    .with_retry("put", &key, || self.store.put(&key, data.clone()))
                    .await
                    .map_err(|e| SandboxError::SyncPushFailure(format!("{rel}: {e}")))?;
                self.manifest.record(rel, hash, etag);
                self.degraded.remove(rel);
                debug!(target: "devlabo::sync", path = rel, "uploaded");
                Ok(PushOutcome::Uploaded)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.with_retry("delete", &key, || self.store.delete(&key))
                    .await
                    .map_err(|e| SandboxError::SyncPushFailure(format!("{rel}: {e}")))?;
                self.manifest.remove(rel);
                self.degraded.remove(rel);
                debug!(target: "devlabo::sync", path = rel, "deleted remote object");
                Ok(PushOutcome::Deleted)
            }
            Err(_) if path.is_dir() => Ok(PushOutcome::Skipped),
            Err(e) => Err(SandboxError::SyncPushFailure(format!("{rel}: {e}"))),
        }
    }

    /// Pushes each distinct path. Failures are logged and counted, never propagated.
    pub async fn push(&self, paths: &[String]) -> PushReport {
        let unique: BTreeSet<&String> = paths.iter().collect();
        let mut report = PushReport::default();
        for rel in unique {
            match self.push_path(rel).await {
                Ok(PushOutcome::Uploaded) => report.uploaded += 1,
                Ok(PushOutcome::Skipped) => report.skipped += 1,
                Ok(PushOutcome::Deleted) => report.deleted += 1,
                Err(e) => {
                    warn!(
                        target: "devlabo::sync",
                        user = %self.key.user_id,
                        project = %self.key.project_id,
                        path = %rel,
                        error = %e,
                        "push failed, change dropped"
                    );
                    report.failed += 1;
                }
            }
        }
        if report != PushReport::default() {
            info!(
                target: "devlabo::sync",
                user = %self.key.user_id,
                project = %self.key.project_id,
                uploaded = report.uploaded,
                deleted = report.deleted,
                failed = report.failed,
                "push complete"
            );
        }
        report
    }

    /// Pushes every local file plus every manifest entry, so local deletions reach the store.
    pub async fn push_all(&self) -> SandboxResult<PushReport> {
        let mut paths = self.local_files().await?;
        paths.extend(self.manifest.paths());
        Ok(self.push(&paths).await)
    }

    /// Workspace-relative paths of all non-ignored files under the module subtrees.
    pub async fn local_files(&self) -> SandboxResult<Vec<String>> {
        let workspace = self.workspace.clone();
        let ignore = self.ignore.clone();
        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for module in Module::ALL {
                let root = workspace.join(module.dir_name());
                if !root.is_dir() {
                    continue;
                }
                for entry in walkdir::WalkDir::new(&root)
                    .into_iter()
                    .filter_entry(|e| {
                        e.depth() == 0 || !ignore.dirs.iter().any(|d| e.file_name() == d.as_str())
                    })
                    .filter_map(|e| e.ok())
                {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let Ok(rel) = entry.path().strip_prefix(&workspace) else {
                        continue;
                    };
                    let rel = to_slash(rel);
                    if !ignore.is_ignored(&rel) {
                        files.push(rel);
                    }
                }
            }
            files
        })
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::other(e.to_string())))
    }
}

// -----------------------------------------------------------------------------
// Change batching and the push worker
// -----------------------------------------------------------------------------

/// Coalesces change notifications. The window opens at the first change; all distinct
/// paths seen before it closes are pushed once.
#[derive(Debug)]
pub struct ChangeBatcher {
    window: Duration,
    pending: BTreeSet<String>,
    deadline: Option<Instant>,
}

impl ChangeBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeSet::new(),
            deadline: None,
        }
    }

    pub fn add(&mut self, path: String, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
        self.pending.insert(path);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Drains pending paths and closes the window.
    pub fn take(&mut self) -> Vec<String> {
        self.deadline = None;
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug)]
pub enum SyncCommand {
    /// A workspace-relative path changed locally.
    Changed(String),
    /// Push everything pending now and report back.
    Flush(oneshot::Sender<PushReport>),
}

/// Sender side of the push worker queue.
#[derive(Debug, Clone)]
pub struct PushHandle {
    tx: mpsc::UnboundedSender<SyncCommand>,
}

impl PushHandle {
    /// Schedules `rel` for upload. Never blocks.
    pub fn notify(&self, rel: impl Into<String>) {
        if self.tx.send(SyncCommand::Changed(rel.into())).is_err() {
            warn!(target: "devlabo::sync", "push worker stopped, change not scheduled");
        }
    }

    /// Pushes pending changes immediately.
    pub async fn flush(&self) -> SandboxResult<PushReport> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(SyncCommand::Flush(ack))
            .map_err(|_| SandboxError::SyncPushFailure("push worker stopped".into()))?;
        done.await
            .map_err(|_| SandboxError::SyncPushFailure("push worker dropped flush".into()))
    }
}

/// Starts the background push worker for `engine`.
pub fn spawn_push_worker(engine: Arc<SyncEngine>, window: Duration) -> (PushHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SyncCommand>();
    let task = tokio::spawn(async move {
        let mut batcher = ChangeBatcher::new(window);
        let mut totals = PushReport::default();
        loop {
            let deadline = batcher.deadline();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(SyncCommand::Changed(path)) => batcher.add(path, Instant::now()),
                    Some(SyncCommand::Flush(ack)) => {
                        let paths = batcher.take();
                        let report = engine.push(&paths).await;
                        totals.merge(&report);
                        let _ = ack.send(report);
                    }
                    None => {
                        if !batcher.is_empty() {
                            let paths = batcher.take();
                            totals.merge(&engine.push(&paths).await);
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let paths = batcher.take();
                    totals.merge(&engine.push(&paths).await);
                }
            }
        }
        debug!(
            target: "devlabo::sync",
            uploaded = totals.uploaded,
            deleted = totals.deleted,
            failed = totals.failed,
            "push worker exited"
        );
    });
    (PushHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn engine_with(store: Arc<MemoryObjectStore>) -> (tempfile::TempDir, SyncEngine) {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            sync_backoff_ms: 1,
            ..SandboxConfig::default()
        };
        let key = ProjectKey::new("alice", "proj1").unwrap();
        let engine = SyncEngine::new(key, dir.path().to_path_buf(), store, Arc::new(config));
        (dir, engine)
    }

    #[test]
    fn ignore_rules_match_defaults() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored("frontend/node_modules/react/index.js"));
        assert!(rules.is_ignored("prototype/.env"));
        assert!(rules.is_ignored("prototype/.env.local"));
        assert!(rules.is_ignored("test-case/__pycache__/x.pyc"));
        assert!(rules.is_ignored("frontend/debug.log"));
        assert!(rules.is_ignored("frontend/.index.html.abc.devlabo-tmp"));
        assert!(!rules.is_ignored("frontend/src/App.jsx"));
        assert!(!rules.is_ignored("frontend/.environment.md"));
    }

    #[test]
    fn split_rejects_module_roots_and_unknown_dirs() {
        assert_eq!(
            split_workspace_path("frontend/src/App.jsx").unwrap(),
            (Module::Frontend, "src/App.jsx".to_string())
        );
        assert_eq!(
            split_workspace_path("test-case/index.html").unwrap().0,
            Module::Tests
        );
        assert!(split_workspace_path("frontend").is_err());
        assert!(split_workspace_path("frontend/").is_err());
        assert!(split_workspace_path("secrets/x").is_err());
        assert!(split_workspace_path("../alice/x").is_err());
    }

    #[tokio::test]
    async fn pull_is_idempotent() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("alice/proj1/frontend/index.html", "<h1>hi</h1>");
        store.insert("alice/proj1/dbml/schema.dbml", "Table users {}");
        store.insert("alice/proj1/frontend/node_modules/x.js", "ignored");
        store.insert("alice/proj1/stray.txt", "outside modules");
        let (dir, engine) = engine_with(store.clone());

        let first = engine.pull().await.unwrap();
        assert_eq!(first.downloaded, 2);
        assert_eq!(first.skipped, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("frontend/index.html")).unwrap(),
            "<h1>hi</h1>"
        );
        assert!(!dir.path().join("frontend/node_modules").exists());

        let second = engine.pull().await.unwrap();
        assert_eq!(second.downloaded, 0);
        assert_eq!(second.failed, 0);
    }

    #[tokio::test]
    async fn pull_redownloads_locally_modified_file() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("alice/proj1/prototype/index.html", "remote");
        let (dir, engine) = engine_with(store);
        engine.pull().await.unwrap();
        std::fs::write(dir.path().join("prototype/index.html"), "local edit").unwrap();

        let report = engine.pull().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("prototype/index.html")).unwrap(),
            "remote"
        );
    }

    #[tokio::test]
    async fn pull_failure_to_list_is_fatal() {
        let store = Arc::new(MemoryObjectStore::new());
        store.set_available(false);
        let (_dir, engine) = engine_with(store.clone());
        let err = engine.pull().await.unwrap_err();
        assert!(matches!(err, SandboxError::SyncPullFailure(_)));
        // One call plus the retry budget.
        assert_eq!(store.list_calls(), 4);
    }

    #[tokio::test]
    async fn partial_pull_failure_marks_degraded() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("alice/proj1/frontend/a.js", "a");
        store.insert("alice/proj1/frontend/b.js", "b");
        store.fail_key("alice/proj1/frontend/b.js");
        let (_dir, engine) = engine_with(store);

        let report = engine.pull().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.failed, 1);
        assert!(engine.is_degraded("frontend/b.js"));
        assert_eq!(engine.degraded_paths(), vec!["frontend/b.js".to_string()]);
    }

    #[tokio::test]
    async fn push_uploads_changes_and_skips_unchanged() {
        let store = Arc::new(MemoryObjectStore::new());
        let (dir, engine) = engine_with(store.clone());
        write_atomic(&dir.path().join("frontend/src/App.jsx"), b"v1").await.unwrap();

        let paths = vec!["frontend/src/App.jsx".to_string()];
        let report = engine.push(&paths).await;
        assert_eq!(report.uploaded, 1);
        assert_eq!(store.contents("alice/proj1/frontend/src/App.jsx").unwrap(), b"v1");

        let report = engine.push(&paths).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(store.put_calls(), 1);
    }

    #[tokio::test]
    async fn push_deletes_missing_files() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("alice/proj1/dbml/old.dbml", "x");
        let (_dir, engine) = engine_with(store.clone());
        engine.pull().await.unwrap();
        std::fs::remove_file(engine.local_path("dbml/old.dbml").unwrap()).unwrap();

        let report = engine.push_all().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.contents("alice/proj1/dbml/old.dbml").is_none());
        assert!(engine.manifest().is_empty());
    }

    #[tokio::test]
    async fn push_rejects_module_root_and_traversal() {
        let store = Arc::new(MemoryObjectStore::new());
        let (_dir, engine) = engine_with(store.clone());
        assert!(engine.push_path("frontend").await.is_err());
        assert!(engine.push_path("frontend/../../etc/passwd").await.is_err());
        let report = engine.push(&["frontend".to_string()]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(store.put_calls(), 0);
    }

    #[test]
    fn batcher_coalesces_within_window() {
        let mut batcher = ChangeBatcher::new(Duration::from_millis(500));
        let start = Instant::now();
        batcher.add("frontend/a.js".into(), start);
        batcher.add("frontend/a.js".into(), start + Duration::from_millis(100));
        batcher.add("frontend/b.js".into(), start + Duration::from_millis(200));
        assert!(!batcher.is_due(start + Duration::from_millis(400)));
        assert!(batcher.is_due(start + Duration::from_millis(500)));
        assert_eq!(batcher.len(), 2);
        assert_eq!(batcher.take(), vec!["frontend/a.js".to_string(), "frontend/b.js".to_string()]);
        assert!(batcher.deadline().is_none());
    }

    #[tokio::test]
    async fn worker_flush_pushes_pending_changes() {
        let store = Arc::new(MemoryObjectStore::new());
        let (dir, engine) = engine_with(store.clone());
        let engine = Arc::new(engine);
        let (handle, _task) = spawn_push_worker(engine, Duration::from_secs(60));

        write_atomic(&dir.path().join("frontend/index.html"), b"one").await.unwrap();
        handle.notify("frontend/index.html");
        handle.notify("frontend/index.html");
        let report = handle.flush().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(store.put_calls(), 1);
    }

    #[tokio::test]
    async fn worker_pushes_after_debounce_window() {
        let store = Arc::new(MemoryObjectStore::new());
        let (dir, engine) = engine_with(store.clone());
        let (handle, _task) = spawn_push_worker(Arc::new(engine), Duration::from_millis(20));

        write_atomic(&dir.path().join("dbml/schema.dbml"), b"Table t {}").await.unwrap();
        handle.notify("dbml/schema.dbml");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.contents("alice/proj1/dbml/schema.dbml").unwrap(), b"Table t {}");
    }
}
