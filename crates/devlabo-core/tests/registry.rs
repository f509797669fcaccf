#![cfg(unix)]

use devlabo_core::{
    InstanceRegistry, Lifecycle, MemoryObjectStore, Module, ProjectKey, SandboxConfig,
    SandboxError,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config(dir: &Path, port_base: u16) -> SandboxConfig {
    SandboxConfig {
        workspace_root: dir.join("ws"),
        server_command: "sleep 30".into(),
        http_probe: false,
        port_base,
        startup_timeout_secs: 1,
        push_debounce_ms: 10,
        sync_backoff_ms: 1,
        grace_period_ms: 200,
        cold_start_timeout_secs: 10,
        ..SandboxConfig::default()
    }
}

fn registry(config: SandboxConfig, store: Arc<MemoryObjectStore>) -> InstanceRegistry {
    InstanceRegistry::new(Arc::new(config), store).unwrap()
}

#[tokio::test]
async fn concurrent_acquire_is_single_flight() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.insert("alice/proj1/frontend/index.html", "<h1>hi</h1>");
    let registry = registry(config(dir.path(), 39201), store.clone());
    let key = ProjectKey::new("alice", "proj1").unwrap();

    let calls = (0..16).map(|_| {
        let registry = registry.clone();
        let key = key.clone();
        tokio::spawn(async move { registry.get_or_create(&key).await })
    });
    let instances: Vec<_> = futures_util::future::join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let first = instances[0].id();
    assert!(instances.iter().all(|i| i.id() == first));
    assert_eq!(store.list_calls(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.ports_in_use(), 1);
    assert_eq!(instances[0].lifecycle(), Lifecycle::Running);

    registry.shutdown_all().await;
    assert!(registry.is_empty());
    assert_eq!(registry.ports_in_use(), 0);
}

#[tokio::test]
async fn failed_start_is_removed_and_retried_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.set_available(false);
    let registry = registry(config(dir.path(), 39211), store.clone());
    let key = ProjectKey::new("bob", "broken").unwrap();

    let err = registry.get_or_create(&key).await.unwrap_err();
    assert!(matches!(err, SandboxError::InstanceStartFailure(_)));
    assert!(err.is_retryable());
    assert!(registry.is_empty());
    assert_eq!(registry.ports_in_use(), 0);

    store.set_available(true);
    let instance = registry.get_or_create(&key).await.unwrap();
    assert_eq!(instance.lifecycle(), Lifecycle::Running);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn exhausted_port_blocks_fail_the_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let registry = registry(
        SandboxConfig {
            max_instances: 1,
            ..config(dir.path(), 39221)
        },
        store,
    );

    let first = registry
        .get_or_create(&ProjectKey::new("alice", "one").unwrap())
        .await
        .unwrap();
    assert_eq!(first.module_port(Module::Prototype), 39221);

    let err = registry
        .get_or_create(&ProjectKey::new("alice", "two").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::InstanceStartFailure(_)));
    assert_eq!(registry.len(), 1);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn draining_instance_is_replaced_after_it_stops() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let registry = registry(config(dir.path(), 39231), store);
    let key = ProjectKey::new("alice", "proj1").unwrap();

    let old = registry.get_or_create(&key).await.unwrap();
    assert!(old.begin_drain());
    let draining = old.clone();
    let drain = tokio::spawn(async move { draining.shutdown().await });

    let fresh = registry.get_or_create(&key).await.unwrap();
    assert_ne!(fresh.id(), old.id());
    assert_eq!(old.lifecycle(), Lifecycle::Stopped);
    assert_eq!(fresh.lifecycle(), Lifecycle::Running);
    drain.await.unwrap().unwrap();

    registry.shutdown_all().await;
}

#[tokio::test]
async fn idle_sweep_pushes_pending_changes_and_evicts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let registry = registry(
        SandboxConfig {
            idle_timeout_secs: 0,
            // Longer than the test so only the shutdown push can upload.
            push_debounce_ms: 60_000,
            ..config(dir.path(), 39241)
        },
        store.clone(),
    );
    let key = ProjectKey::new("carol", "notes").unwrap();

    let instance = registry.get_or_create(&key).await.unwrap();
    instance
        .file_write(Module::Dbml, "schema.dbml", b"Table users {}")
        .await
        .unwrap();
    assert!(store.contents("carol/notes/dbml/schema.dbml").is_none());

    assert_eq!(registry.sweep().await, 1);
    assert_eq!(
        store.contents("carol/notes/dbml/schema.dbml").unwrap(),
        b"Table users {}"
    );
    assert!(registry.get(&key).is_none());
    assert!(registry.snapshot().is_empty());
    assert_eq!(registry.ports_in_use(), 0);
    assert_eq!(instance.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test]
async fn slow_cold_start_times_out_and_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.set_latency(Duration::from_secs(3));
    let registry = registry(
        SandboxConfig {
            cold_start_timeout_secs: 1,
            ..config(dir.path(), 39251)
        },
        store.clone(),
    );
    let key = ProjectKey::new("dave", "slow").unwrap();

    let err = registry.get_or_create(&key).await.unwrap_err();
    assert!(
        matches!(err, SandboxError::Timeout(_) | SandboxError::InstanceStartFailure(_)),
        "{err:?}"
    );
    assert!(err.is_retryable());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !registry.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "timed-out attempt was never discarded");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(registry.ports_in_use(), 0);

    store.set_latency(Duration::ZERO);
    let instance = registry.get_or_create(&key).await.unwrap();
    assert_eq!(instance.lifecycle(), Lifecycle::Running);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn concurrent_writes_to_one_path_leave_one_whole_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let registry = registry(config(dir.path(), 39261), store.clone());
    let key = ProjectKey::new("erin", "race").unwrap();
    let instance = registry.get_or_create(&key).await.unwrap();

    const SIZE: usize = 64 * 1024;
    let writes = (0..24u8).map(|i| {
        let instance = instance.clone();
        tokio::spawn(async move {
            let body = vec![b'a' + i; SIZE];
            instance.file_write(Module::Frontend, "src/big.txt", &body).await
        })
    });
    for written in futures_util::future::join_all(writes).await {
        assert_eq!(written.unwrap().unwrap(), SIZE);
    }

    let data = instance.file_read(Module::Frontend, "src/big.txt").await.unwrap();
    assert_eq!(data.len(), SIZE);
    assert!(data.iter().all(|b| *b == data[0]), "interleaved writes");

    let mut names: Vec<String> = std::fs::read_dir(instance.module_root(Module::Frontend).join("src"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["big.txt", "main.js"]);

    instance.sync_now().await.unwrap();
    assert_eq!(store.contents("erin/race/frontend/src/big.txt").unwrap(), data);
    registry.shutdown_all().await;
}
