//! One project's runtime: workspace, sync engine, module processes and the file API.

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::process::{ProcessManager, ProcessState, ProcessStatus};
use crate::scaffold::missing_scaffold;
use crate::security::{resolve, sanitize_relative, to_slash};
use crate::shared::{FileKind, FileNode, FileRecord, Lifecycle, Module, PortBlock, ProjectKey};
use crate::storage::{sha256_hex, ObjectStore};
use crate::sync::{
    spawn_push_worker, workspace_path, write_atomic, IgnoreRules, PullReport, PushHandle,
    PushReport, SyncEngine,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Left in a workspace whose drain could not push every change. The next instance for the
/// same project uploads the leftover tree before pulling over it.
const UNSYNCED_MARKER: &str = ".devlabo-unsynced";

/// Instance snapshot served by `api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub user_id: String,
    pub project_id: String,
    pub lifecycle: Lifecycle,
    pub port_base: u16,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub last_pull: Option<PullReport>,
    pub manifest_entries: usize,
    pub degraded_paths: Vec<String>,
    pub modules: Vec<ProcessStatus>,
}

pub struct SandboxInstance {
    id: uuid::Uuid,
    key: ProjectKey,
    workspace: PathBuf,
    ports: PortBlock,
    sync: Arc<SyncEngine>,
    processes: Arc<ProcessManager>,
    push: PushHandle,
    push_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    lifecycle: watch::Sender<Lifecycle>,
    start_lock: Mutex<()>,
    shutdown_lock: Mutex<()>,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    last_activity: std::sync::Mutex<Instant>,
    last_pull: std::sync::Mutex<Option<PullReport>>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("ports", &self.ports)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl SandboxInstance {
    /// Builds a `Cold` instance without touching the disk. Nothing is created, pulled or
    /// started until [`ensure_running`].
    ///
    /// [`ensure_running`]: SandboxInstance::ensure_running
    pub fn new(
        key: ProjectKey,
        ports: PortBlock,
        config: Arc<SandboxConfig>,
        store: Arc<dyn ObjectStore>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let workspace = key.workspace_dir(&config.workspace_root);
        let sync = Arc::new(SyncEngine::new(
            key.clone(),
            workspace.clone(),
            store,
            config.clone(),
        ));
        let (push, push_task) = spawn_push_worker(sync.clone(), config.push_debounce());
        let processes = Arc::new(ProcessManager::new(
            key.to_string(),
            workspace.clone(),
            ports,
            config,
            http,
        ));
        let (lifecycle, _) = watch::channel(Lifecycle::Cold);

        Arc::new(Self {
            id: uuid::Uuid::new_v4(),
            key,
            workspace,
            ports,
            sync,
            processes,
            push,
            push_task: std::sync::Mutex::new(Some(push_task)),
            lifecycle,
            start_lock: Mutex::new(()),
            shutdown_lock: Mutex::new(()),
            path_locks: DashMap::new(),
            last_activity: std::sync::Mutex::new(Instant::now()),
            last_pull: std::sync::Mutex::new(None),
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn key(&self) -> &ProjectKey {
        &self.key
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn ports(&self) -> PortBlock {
        self.ports
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    fn transition(&self, next: Lifecycle) -> bool {
        let changed = self.lifecycle.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(target: "devlabo::registry", instance = %self.key, state = ?next, "lifecycle transition");
        }
        changed
    }

    /// Records activity for idle eviction.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Drives `Cold → Pulling → Starting → Running`. A pull or spawn failure leaves the
    /// instance `Stopped`.
    #[instrument(skip(self), fields(instance = %self.key))]
    pub async fn ensure_running(&self) -> SandboxResult<()> {
        let _guard = self.start_lock.lock().await;
        match self.lifecycle() {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Cold => {}
            other => {
                return Err(SandboxError::InstanceStartFailure(format!(
                    "instance {} is {other:?}",
                    self.key
                )))
            }
        }

        self.transition(Lifecycle::Pulling);
        let prepared = match self.prepare_workspace().await {
            Ok(()) => self.sync.pull().await,
            Err(e) => Err(e),
        };
        let report = match prepared {
            Ok(report) => report,
            Err(e) => {
                warn!(target: "devlabo::registry", instance = %self.key, error = %e, "workspace preparation or pull failed, instance stopped");
                self.abort_push_worker();
                self.transition(Lifecycle::Stopped);
                return Err(e);
            }
        };
        if let Ok(mut last) = self.last_pull.lock() {
            *last = Some(report);
        }

        self.write_scaffolds().await;

        // A drain may have started while pulling.
        if !self.transition(Lifecycle::Starting) {
            return Err(SandboxError::InstanceStartFailure(format!(
                "instance {} drained during start",
                self.key
            )));
        }
        if let Err(e) = self.processes.start_all().await {
            warn!(target: "devlabo::registry", instance = %self.key, error = %e, "module start failed, instance stopped");
            self.abort_push_worker();
            self.transition(Lifecycle::Stopped);
            return Err(e);
        }

        if !self.transition(Lifecycle::Running) {
            self.processes.stop_all().await;
            return Err(SandboxError::InstanceStartFailure(format!(
                "instance {} drained during start",
                self.key
            )));
        }
        self.touch();
        info!(
            target: "devlabo::registry",
            user = %self.key.user_id,
            project = %self.key.project_id,
            port_base = self.ports.base,
            "instance running"
        );
        Ok(())
    }

    /// Waits until the instance leaves the initializing states. Only `Running` is success.
    pub async fn wait_running(&self, timeout: Duration) -> SandboxResult<()> {
        let mut rx = self.subscribe();
        let state = match tokio::time::timeout(timeout, rx.wait_for(|s| !s.is_initializing())).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => Lifecycle::Stopped,
            Err(_) => {
                return Err(SandboxError::Timeout(format!(
                    "instance {} not running after {:?}",
                    self.key, timeout
                )))
            }
        };
        match state {
            Lifecycle::Running => Ok(()),
            other => Err(SandboxError::InstanceStartFailure(format!(
                "instance {} is {other:?}",
                self.key
            ))),
        }
    }

    /// Waits until the instance is `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s == Lifecycle::Stopped).await;
    }

    /// Creates the module directories and uploads whatever a failed drain left behind, so
    /// the pull cannot overwrite it with older remote copies.
    async fn prepare_workspace(&self) -> SandboxResult<()> {
        for module in Module::ALL {
            tokio::fs::create_dir_all(self.module_root(module)).await?;
        }
        let marker = self.workspace.join(UNSYNCED_MARKER);
        if tokio::fs::metadata(&marker).await.is_err() {
            return Ok(());
        }

        let report = self.sync.push_all().await?;
        if report.failed > 0 {
            return Err(SandboxError::SyncPushFailure(format!(
                "{} changes left by the previous drain are still unsynced",
                report.failed
            )));
        }
        tokio::fs::remove_file(&marker).await?;
        info!(
            target: "devlabo::sync",
            user = %self.key.user_id,
            project = %self.key.project_id,
            uploaded = report.uploaded,
            "recovered changes left by a failed drain"
        );
        Ok(())
    }

    async fn write_scaffolds(&self) {
        let degraded = self.sync.degraded_paths();
        for module in Module::ALL {
            // A module whose remote files failed to download is not empty, only incomplete.
            let prefix = format!("{}/", module.dir_name());
            if degraded.iter().any(|rel| rel.starts_with(&prefix)) {
                warn!(target: "devlabo::registry", instance = %self.key, module = %module, "module has degraded paths, not scaffolding");
                continue;
            }
            for (rel, content) in missing_scaffold(&self.module_root(module), module) {
                match self.write_local(module, rel, content.as_bytes()).await {
                    Ok(()) => self.push.notify(workspace_path(module, rel)),
                    Err(e) => {
                        warn!(target: "devlabo::registry", instance = %self.key, module = %module, path = rel, error = %e, "scaffold write failed")
                    }
                }
            }
        }
    }

    /// Marks the instance `Draining`. Returns false when it is already draining or stopped.
    pub fn begin_drain(&self) -> bool {
        self.transition(Lifecycle::Draining)
    }

    /// `Draining → push_all → stop processes → Stopped`. Idempotent. The local workspace is
    /// removed only when every change reached object storage.
    #[instrument(skip(self), fields(instance = %self.key))]
    pub async fn shutdown(&self) -> SandboxResult<PushReport> {
        let _guard = self.shutdown_lock.lock().await;
        if self.lifecycle() == Lifecycle::Stopped {
            return Ok(PushReport::default());
        }
        self.begin_drain();

        let mut report = match self.push.flush().await {
            Ok(report) => report,
            Err(e) => {
                warn!(target: "devlabo::sync", instance = %self.key, error = %e, "flush before drain failed");
                PushReport::default()
            }
        };
        let drained = self.sync.push_all().await;
        self.processes.stop_all().await;
        self.abort_push_worker();

        let clean = match &drained {
            Ok(all) => {
                report.uploaded += all.uploaded;
                report.deleted += all.deleted;
                report.skipped += all.skipped;
                report.failed += all.failed;
                report.failed == 0
            }
            Err(_) => false,
        };
        if clean {
            if let Err(e) = tokio::fs::remove_dir_all(&self.workspace).await {
                debug!(target: "devlabo::registry", instance = %self.key, error = %e, "workspace cleanup failed");
            }
        } else {
            warn!(
                target: "devlabo::registry",
                instance = %self.key,
                failed = report.failed,
                "drain left unsynced changes, keeping workspace"
            );
            let marker = self.workspace.join(UNSYNCED_MARKER);
            if let Err(e) = tokio::fs::write(&marker, report.failed.to_string()).await {
                warn!(target: "devlabo::registry", instance = %self.key, error = %e, "could not mark workspace unsynced");
            }
        }

        self.transition(Lifecycle::Stopped);
        info!(
            target: "devlabo::registry",
            user = %self.key.user_id,
            project = %self.key.project_id,
            uploaded = report.uploaded,
            deleted = report.deleted,
            "instance stopped"
        );
        drained.map(|_| report)
    }

    /// Tears down a failed or timed-out start without pushing anything.
    pub async fn abandon(&self) {
        self.begin_drain();
        self.processes.stop_all().await;
        self.abort_push_worker();
        self.transition(Lifecycle::Stopped);
    }

    fn abort_push_worker(&self) {
        if let Ok(mut task) = self.push_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    fn ensure_accepting(&self) -> SandboxResult<()> {
        match self.lifecycle() {
            Lifecycle::Running => Ok(()),
            other => Err(SandboxError::InstanceStartFailure(format!(
                "instance {} is {other:?}",
                self.key
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Modules
    // -------------------------------------------------------------------------

    pub fn module_root(&self, module: Module) -> PathBuf {
        self.workspace.join(module.dir_name())
    }

    pub fn module_port(&self, module: Module) -> u16 {
        self.ports.port(module)
    }

    /// Port of a module that can take traffic. `ModuleCrashed` only once its restart budget
    /// is spent; a module waiting on a restart is `ModuleUnavailable`.
    pub async fn module_endpoint(&self, module: Module) -> SandboxResult<u16> {
        self.ensure_accepting()?;
        match self.processes.state(module).await? {
            ProcessState::Running => Ok(self.module_port(module)),
            ProcessState::Crashed => Err(SandboxError::ModuleCrashed(module)),
            _ => Err(SandboxError::ModuleUnavailable(module)),
        }
    }

    pub async fn restart_module(&self, module: Module) -> SandboxResult<()> {
        self.ensure_accepting()?;
        self.touch();
        info!(target: "devlabo::process", instance = %self.key, module = %module, "manual module restart");
        self.processes.restart(module).await
    }

    pub async fn status(&self) -> InstanceStatus {
        InstanceStatus {
            user_id: self.key.user_id.clone(),
            project_id: self.key.project_id.clone(),
            lifecycle: self.lifecycle(),
            port_base: self.ports.base,
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
            last_pull: self.last_pull.lock().ok().and_then(|p| p.clone()),
            manifest_entries: self.sync.manifest().len(),
            degraded_paths: self.sync.degraded_paths(),
            modules: self.processes.all_status().await,
        }
    }

    /// Pushes pending changes, then the whole tree.
    pub async fn sync_now(&self) -> SandboxResult<PushReport> {
        self.ensure_accepting()?;
        self.touch();
        let mut report = self.push.flush().await?;
        let all = self.sync.push_all().await?;
        report.uploaded += all.uploaded;
        report.deleted += all.deleted;
        report.skipped += all.skipped;
        report.failed += all.failed;
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // File API
    // -------------------------------------------------------------------------

    async fn lock_path(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = self
            .path_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn release_path(&self, path: &Path) {
        self.path_locks
            .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn workspace_rel(module: Module, user_path: &str) -> SandboxResult<String> {
        Ok(workspace_path(module, &to_slash(&sanitize_relative(user_path)?)))
    }

    pub async fn file_read(&self, module: Module, path: &str) -> SandboxResult<Vec<u8>> {
        let target = resolve(&self.module_root(module), path)?;
        self.touch();
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(data),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound) || target.is_dir() => {
                Err(SandboxError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// [`file_read`](Self::file_read) plus modification time and content hash.
    pub async fn file_stat(&self, module: Module, path: &str) -> SandboxResult<FileRecord> {
        let content = self.file_read(module, path).await?;
        let target = resolve(&self.module_root(module), path)?;
        let last_modified = tokio::fs::metadata(&target)
            .await
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(FileRecord {
            relative_path: Self::workspace_rel(module, path)?,
            content_hash: Some(sha256_hex(&content)),
            content: Some(content),
            last_modified,
        })
    }

    /// Writes locally and schedules the upload. Returns the number of bytes written.
    pub async fn file_write(&self, module: Module, path: &str, content: &[u8]) -> SandboxResult<usize> {
        self.ensure_accepting()?;
        self.touch();
        self.write_local(module, path, content).await?;
        let rel = Self::workspace_rel(module, path)?;

        if self.sync.is_degraded(&rel) {
            // The remote copy never arrived; make the local one durable before answering.
            self.sync.push_path(&rel).await?;
        } else {
            self.push.notify(rel);
        }
        Ok(content.len())
    }

    async fn write_local(&self, module: Module, path: &str, content: &[u8]) -> SandboxResult<()> {
        let target = resolve(&self.module_root(module), path)?;
        if target.is_dir() {
            return Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{path} is a directory"),
            )));
        }
        {
            let _guard = self.lock_path(&target).await;
            write_atomic(&target, content).await?;
        }
        self.release_path(&target);
        debug!(target: "devlabo::sync", instance = %self.key, module = %module, path, bytes = content.len(), "file written");
        Ok(())
    }

    /// Module tree, directories first. Ignored entries are hidden.
    pub async fn file_list(&self, module: Module) -> SandboxResult<Vec<FileNode>> {
        let root = self.module_root(module);
        let ignore = self.sync.ignore_rules().clone();
        self.touch();
        tokio::task::spawn_blocking(move || {
            if !root.is_dir() {
                return Ok(Vec::new());
            }
            build_tree(&root, &root, &ignore)
        })
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::other(e.to_string())))?
        .map_err(SandboxError::from)
    }

    /// Deletes a file or directory and schedules the remote deletes.
    pub async fn file_delete(&self, module: Module, path: &str) -> SandboxResult<()> {
        self.ensure_accepting()?;
        self.touch();
        let root = self.module_root(module);
        let target = resolve(&root, path)?;
        let removed = {
            let _guard = self.lock_path(&target).await;
            let removed = files_under(&root, &target);
            match tokio::fs::symlink_metadata(&target).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await?,
                Ok(_) => tokio::fs::remove_file(&target).await?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SandboxError::NotFound(path.to_string()))
                }
                Err(e) => return Err(e.into()),
            }
            removed
        };
        self.release_path(&target);

        for inner in removed {
            self.push.notify(workspace_path(module, &inner));
        }
        debug!(target: "devlabo::sync", instance = %self.key, module = %module, path, "deleted");
        Ok(())
    }

    /// Renames within one module. The destination must not exist.
    pub async fn file_rename(&self, module: Module, from: &str, to: &str) -> SandboxResult<()> {
        self.ensure_accepting()?;
        self.touch();
        let root = self.module_root(module);
        let source = resolve(&root, from)?;
        let dest = resolve(&root, to)?;
        if dest.starts_with(&source) {
            return Err(SandboxError::PathTraversal(format!("cannot move {from} into itself")));
        }

        let (first, second) = if source <= dest {
            (&source, &dest)
        } else {
            (&dest, &source)
        };
        let (old_files, new_files) = {
            let _a = self.lock_path(first).await;
            let _b = self.lock_path(second).await;
            if tokio::fs::symlink_metadata(&source).await.is_err() {
                return Err(SandboxError::NotFound(from.to_string()));
            }
            if tokio::fs::symlink_metadata(&dest).await.is_ok() {
                return Err(SandboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{to} already exists"),
                )));
            }
            let old_files = files_under(&root, &source);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&source, &dest).await?;
            (old_files, files_under(&root, &dest))
        };
        self.release_path(&source);
        self.release_path(&dest);

        for inner in old_files.into_iter().chain(new_files) {
            self.push.notify(workspace_path(module, &inner));
        }
        debug!(target: "devlabo::sync", instance = %self.key, module = %module, from, to, "renamed");
        Ok(())
    }
}

/// Module-relative paths of every file at or below `target`.
fn files_under(root: &Path, target: &Path) -> Vec<String> {
    walkdir::WalkDir::new(target)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .filter_map(|e| e.path().strip_prefix(root).ok().map(to_slash))
        .collect()
}

fn build_tree(root: &Path, dir: &Path, ignore: &IgnoreRules) -> std::io::Result<Vec<FileNode>> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = to_slash(rel);
        if ignore.is_ignored(&rel) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            nodes.push(FileNode {
                name,
                path: rel,
                kind: FileKind::Directory,
                size: 0,
                children: Some(build_tree(root, &path, ignore)?),
            });
        } else if meta.is_file() {
            nodes.push(FileNode {
                name,
                path: rel,
                kind: FileKind::File,
                size: meta.len(),
                children: None,
            });
        }
    }
    nodes.sort_by(|a, b| {
        let a_dir = a.kind == FileKind::Directory;
        let b_dir = b.kind == FileKind::Directory;
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn config(dir: &Path) -> Arc<SandboxConfig> {
        Arc::new(SandboxConfig {
            workspace_root: dir.join("ws"),
            server_command: "sleep 30".into(),
            http_probe: false,
            startup_timeout_secs: 1,
            push_debounce_ms: 10,
            sync_backoff_ms: 1,
            grace_period_ms: 200,
            ..SandboxConfig::default()
        })
    }

    fn instance(dir: &Path, store: Arc<MemoryObjectStore>) -> Arc<SandboxInstance> {
        let key = ProjectKey::new("alice", "proj1").unwrap();
        SandboxInstance::new(
            key,
            PortBlock::new(0, 39101, 10),
            config(dir),
            store,
            reqwest::Client::new(),
        )
    }

    #[test]
    fn tree_lists_directories_first_and_hides_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/react")).unwrap();
        std::fs::write(root.join("src/main.js"), "x").unwrap();
        std::fs::write(root.join("index.html"), "<html/>").unwrap();
        std::fs::write(root.join("debug.log"), "noise").unwrap();

        let tree = build_tree(root, root, &IgnoreRules::default()).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].name, "src");
        assert_eq!(tree[0].kind, FileKind::Directory);
        assert_eq!(tree[0].children.as_ref().unwrap()[0].path, "src/main.js");
        assert_eq!(tree[1].name, "index.html");
        assert_eq!(tree[1].size, 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lifecycle_runs_and_scaffolds() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("alice/proj1/prototype/index.html", "<h1>pulled</h1>");
        let inst = instance(dir.path(), store.clone());
        assert_eq!(inst.lifecycle(), Lifecycle::Cold);

        inst.ensure_running().await.unwrap();
        assert_eq!(inst.lifecycle(), Lifecycle::Running);
        assert_eq!(inst.file_read(Module::Prototype, "index.html").await.unwrap(), b"<h1>pulled</h1>");
        let main_js = inst.file_read(Module::Frontend, "src/main.js").await.unwrap();
        assert!(String::from_utf8(main_js).unwrap().contains("Frontend Ready"));
        assert_eq!(inst.module_endpoint(Module::Dbml).await.unwrap(), 39103);

        let report = inst.shutdown().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(inst.lifecycle(), Lifecycle::Stopped);
        for key in [
            "alice/proj1/frontend/index.html",
            "alice/proj1/frontend/src/main.js",
            "alice/proj1/dbml/index.html",
            "alice/proj1/test-case/index.html",
        ] {
            assert!(store.contents(key).is_some(), "{key} not pushed");
        }
        assert_eq!(store.contents("alice/proj1/prototype/index.html").unwrap(), b"<h1>pulled</h1>");
        assert!(!inst.workspace().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_read_delete_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let inst = instance(dir.path(), store.clone());
        inst.ensure_running().await.unwrap();

        let n = inst.file_write(Module::Frontend, "src/App.jsx", b"export default 1").await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(inst.file_read(Module::Frontend, "src/App.jsx").await.unwrap(), b"export default 1");
        let record = inst.file_stat(Module::Frontend, "src/App.jsx").await.unwrap();
        assert_eq!(record.relative_path, "frontend/src/App.jsx");
        assert_eq!(record.content_hash.as_deref(), Some(sha256_hex(b"export default 1").as_str()));
        assert!(record.last_modified.is_some());

        inst.file_rename(Module::Frontend, "src/App.jsx", "src/Main.jsx").await.unwrap();
        assert!(matches!(
            inst.file_read(Module::Frontend, "src/App.jsx").await,
            Err(SandboxError::NotFound(_))
        ));
        inst.sync_now().await.unwrap();
        assert!(store.contents("alice/proj1/frontend/src/Main.jsx").is_some());
        assert!(store.contents("alice/proj1/frontend/src/App.jsx").is_none());

        let deletes = store.delete_calls();
        inst.file_delete(Module::Frontend, "src").await.unwrap();
        inst.sync_now().await.unwrap();
        assert!(store.contents("alice/proj1/frontend/src/Main.jsx").is_none());
        assert!(store.delete_calls() > deletes);
        assert!(matches!(
            inst.file_delete(Module::Frontend, "src").await,
            Err(SandboxError::NotFound(_))
        ));
        inst.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn traversal_write_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let inst = instance(dir.path(), store.clone());
        inst.ensure_running().await.unwrap();

        let err = inst
            .file_write(Module::Frontend, "../../../etc/passwd", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
        let err = inst.file_write(Module::Frontend, "../prototype/index.html", b"x").await.unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
        inst.sync_now().await.unwrap();
        assert!(store.keys().iter().all(|k| !k.contains("passwd")));
        inst.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn degraded_path_write_pushes_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("alice/proj1/dbml/schema.dbml", "Table a {}");
        store.fail_key("alice/proj1/dbml/schema.dbml");
        let inst = instance(dir.path(), store.clone());
        inst.ensure_running().await.unwrap();
        assert!(inst.sync_engine().is_degraded("dbml/schema.dbml"));

        store.clear_failures();
        inst.file_write(Module::Dbml, "schema.dbml", b"Table b {}").await.unwrap();
        assert_eq!(store.contents("alice/proj1/dbml/schema.dbml").unwrap(), b"Table b {}");
        assert!(!inst.sync_engine().is_degraded("dbml/schema.dbml"));
        inst.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_download_is_not_scaffolded_over() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("alice/proj1/prototype/index.html", "<h1>USER PROTOTYPE</h1>");
        store.fail_key("alice/proj1/prototype/index.html");
        let inst = instance(dir.path(), store.clone());
        inst.ensure_running().await.unwrap();

        assert!(inst.sync_engine().is_degraded("prototype/index.html"));
        assert!(matches!(
            inst.file_read(Module::Prototype, "index.html").await,
            Err(SandboxError::NotFound(_))
        ));
        // Other modules are still seeded.
        assert!(inst.file_read(Module::Dbml, "index.html").await.is_ok());

        store.clear_failures();
        let report = inst.shutdown().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(
            store.contents("alice/proj1/prototype/index.html").unwrap(),
            b"<h1>USER PROTOTYPE</h1>"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_drain_is_recovered_by_the_next_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("alice/proj1/frontend/src/App.jsx", "v1");
        let inst = instance(dir.path(), store.clone());
        inst.ensure_running().await.unwrap();
        inst.sync_now().await.unwrap();

        store.set_available(false);
        inst.file_write(Module::Frontend, "src/App.jsx", b"v2").await.unwrap();
        let report = inst.shutdown().await.unwrap();
        assert!(report.failed > 0);
        assert!(inst.workspace().join(UNSYNCED_MARKER).exists());
        assert_eq!(store.contents("alice/proj1/frontend/src/App.jsx").unwrap(), b"v1");

        // Storage still down: the next start fails instead of pulling over the edit.
        let next = instance(dir.path(), store.clone());
        assert!(next.ensure_running().await.is_err());
        assert_eq!(std::fs::read(next.workspace().join("frontend/src/App.jsx")).unwrap(), b"v2");

        store.set_available(true);
        let next = instance(dir.path(), store.clone());
        next.ensure_running().await.unwrap();
        assert_eq!(next.file_read(Module::Frontend, "src/App.jsx").await.unwrap(), b"v2");
        assert_eq!(store.contents("alice/proj1/frontend/src/App.jsx").unwrap(), b"v2");
        assert!(!next.workspace().join(UNSYNCED_MARKER).exists());
        next.shutdown().await.unwrap();
        assert!(!next.workspace().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restarting_module_is_unavailable_not_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let key = ProjectKey::new("alice", "proj1").unwrap();
        let config = Arc::new(SandboxConfig {
            server_command: "if [ \"$DEVLABO_MODULE\" = dbml ]; then exit 1; fi; sleep 30".into(),
            health_interval_ms: 20,
            restart_backoff_ms: 60_000,
            restart_limit: 1,
            ..(*config(dir.path())).clone()
        });
        let inst = SandboxInstance::new(
            key,
            PortBlock::new(0, 39111, 10),
            config,
            Arc::new(MemoryObjectStore::new()),
            reqwest::Client::new(),
        );
        inst.ensure_running().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match inst.module_endpoint(Module::Dbml).await {
                Err(SandboxError::ModuleUnavailable(Module::Dbml)) => break,
                Err(SandboxError::ModuleCrashed(_)) => panic!("budget not spent yet"),
                _ => {}
            }
            assert!(Instant::now() < deadline, "dbml never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(inst.module_endpoint(Module::Prototype).await.unwrap(), 39111);
        inst.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pull_failure_stops_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.set_available(false);
        let inst = instance(dir.path(), store);
        let err = inst.ensure_running().await.unwrap_err();
        assert!(matches!(err, SandboxError::SyncPullFailure(_)));
        assert_eq!(inst.lifecycle(), Lifecycle::Stopped);
        assert!(inst.wait_running(Duration::from_millis(50)).await.is_err());
    }
}
