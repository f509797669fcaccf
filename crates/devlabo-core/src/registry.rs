//! Process-wide map from project key to its live instance.
//!
//! Creation is single-flight: the first caller for a key claims a vacant map entry and
//! spawns the cold start; every concurrent caller awaits the same shared future. Failed
//! starts remove their own entry so the next call starts clean. A background sweep drains
//! idle instances.

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::instance::SandboxInstance;
use crate::shared::{Lifecycle, PortBlock, ProjectKey};
use crate::storage::ObjectStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type StartFuture = Shared<BoxFuture<'static, Result<(), String>>>;

/// Hands out port-block slots `0..max_instances`.
#[derive(Debug)]
pub struct PortAllocator {
    used: Mutex<Vec<bool>>,
    port_base: u16,
    port_stride: u16,
}

impl PortAllocator {
    pub fn new(max_instances: usize, port_base: u16, port_stride: u16) -> Self {
        Self {
            used: Mutex::new(vec![false; max_instances]),
            port_base,
            port_stride,
        }
    }

    /// Lowest free slot, or `None` when every block is taken.
    pub fn allocate(&self) -> Option<PortBlock> {
        let mut used = self.used.lock().ok()?;
        let slot = used.iter().position(|u| !u)?;
        used[slot] = true;
        Some(PortBlock::new(slot, self.port_base, self.port_stride))
    }

    pub fn release(&self, block: PortBlock) {
        if let Ok(mut used) = self.used.lock() {
            if let Some(u) = used.get_mut(block.slot) {
                *u = false;
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.used
            .lock()
            .map(|used| used.iter().filter(|u| **u).count())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
struct RegistryEntry {
    generation: u64,
    instance: Arc<SandboxInstance>,
    ready: StartFuture,
}

/// Live instance summary for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub user_id: String,
    pub project_id: String,
    pub lifecycle: Lifecycle,
    pub port_base: u16,
    pub idle_secs: u64,
}

struct RegistryInner {
    config: Arc<SandboxConfig>,
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    entries: DashMap<ProjectKey, RegistryEntry>,
    ports: PortAllocator,
    next_generation: AtomicU64,
}

impl RegistryInner {
    /// Removes the entry only if it still belongs to `generation`, then frees its ports.
    fn remove_entry(&self, key: &ProjectKey, generation: u64) {
        if let Some((_, entry)) = self
            .entries
            .remove_if(key, |_, e| e.generation == generation)
        {
            self.ports.release(entry.instance.ports());
            debug!(target: "devlabo::registry", instance = %key, generation, "registry entry removed");
        }
    }
}

#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RegistryInner>,
}

impl InstanceRegistry {
    pub fn new(config: Arc<SandboxConfig>, store: Arc<dyn ObjectStore>) -> SandboxResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| SandboxError::Process(format!("probe client: {e}")))?;
        let ports = PortAllocator::new(config.max_instances, config.port_base, config.port_stride);
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                store,
                http,
                entries: DashMap::new(),
                ports,
                next_generation: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &Arc<SandboxConfig> {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn ports_in_use(&self) -> usize {
        self.inner.ports.in_use()
    }

    /// Live instance for `key` without creating one.
    pub fn get(&self, key: &ProjectKey) -> Option<Arc<SandboxInstance>> {
        self.inner
            .entries
            .get(key)
            .map(|e| e.instance.clone())
            .filter(|i| i.lifecycle() != Lifecycle::Stopped)
    }

    /// Builds the instance and spawns its cold start. Called with the vacant entry held.
    fn create_entry(&self, key: &ProjectKey) -> SandboxResult<RegistryEntry> {
        let ports = self.inner.ports.allocate().ok_or_else(|| {
            SandboxError::InstanceStartFailure(format!(
                "no free port block ({} instances running)",
                self.inner.config.max_instances
            ))
        })?;
        let instance = SandboxInstance::new(
            key.clone(),
            ports,
            self.inner.config.clone(),
            self.inner.store.clone(),
            self.inner.http.clone(),
        );
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.clone();
        let starting = instance.clone();
        let task_key = key.clone();
        let cold_start = self.inner.config.cold_start_timeout();
        let handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(cold_start, starting.ensure_running()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("cold start exceeded {cold_start:?}"),
            };
            warn!(target: "devlabo::registry", instance = %task_key, error = %outcome, "cold start failed, discarding instance");
            starting.abandon().await;
            inner.remove_entry(&task_key, generation);
            Err(outcome)
        });
        let ready = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(format!("cold start task failed: {e}")))
        }
        .boxed()
        .shared();

        info!(
            target: "devlabo::registry",
            user = %key.user_id,
            project = %key.project_id,
            slot = ports.slot,
            port_base = ports.base,
            "creating instance"
        );
        Ok(RegistryEntry {
            generation,
            instance,
            ready,
        })
    }

    /// Returns the `Running` instance for `key`, creating it if needed. Bounded by the
    /// cold-start timeout. A draining instance is awaited until stopped and then replaced.
    pub async fn get_or_create(&self, key: &ProjectKey) -> SandboxResult<Arc<SandboxInstance>> {
        let cold_start = self.inner.config.cold_start_timeout();
        let deadline = Instant::now() + cold_start;
        let timed_out = || SandboxError::Timeout(format!("cold start for {key} exceeded {cold_start:?}"));

        loop {
            let entry = match self.inner.entries.entry(key.clone()) {
                Entry::Occupied(occupied) => occupied.get().clone(),
                Entry::Vacant(vacant) => {
                    let entry = self.create_entry(key)?;
                    vacant.insert(entry.clone());
                    entry
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, entry.ready.clone()).await {
                Err(_) => return Err(timed_out()),
                Ok(Err(msg)) => return Err(SandboxError::InstanceStartFailure(msg)),
                Ok(Ok(())) => {}
            }

            if entry.instance.lifecycle() == Lifecycle::Running {
                entry.instance.touch();
                return Ok(entry.instance);
            }

            // Draining or stopped: never let two instances share the workspace.
            debug!(target: "devlabo::registry", instance = %key, "waiting for previous instance to stop");
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, entry.instance.wait_stopped())
                .await
                .is_err()
            {
                return Err(timed_out());
            }
            self.inner.remove_entry(key, entry.generation);
        }
    }

    fn ready_entries(&self) -> Vec<(ProjectKey, RegistryEntry)> {
        self.inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Drains instances idle longer than `idle_timeout` and removes stopped ones.
    /// Returns how many entries were removed.
    pub async fn sweep(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let mut removed = 0;
        for (key, entry) in self.ready_entries() {
            match entry.instance.lifecycle() {
                Lifecycle::Stopped => {
                    self.inner.remove_entry(&key, entry.generation);
                    removed += 1;
                }
                Lifecycle::Running if entry.instance.idle_for() >= idle_timeout => {
                    if !entry.instance.begin_drain() {
                        continue;
                    }
                    info!(
                        target: "devlabo::registry",
                        user = %key.user_id,
                        project = %key.project_id,
                        idle_secs = entry.instance.idle_for().as_secs(),
                        "evicting idle instance"
                    );
                    if let Err(e) = entry.instance.shutdown().await {
                        warn!(target: "devlabo::registry", instance = %key, error = %e, "drain finished with errors");
                    }
                    self.inner.remove_entry(&key, entry.generation);
                    removed += 1;
                }
                _ => {}
            }
        }
        removed
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval`.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = registry.sweep().await;
                if removed > 0 {
                    debug!(target: "devlabo::registry", removed, live = registry.len(), "sweep complete");
                }
            }
        })
    }

    /// Drains every instance concurrently. Used on gateway shutdown.
    pub async fn shutdown_all(&self) {
        let entries = self.ready_entries();
        info!(target: "devlabo::registry", count = entries.len(), "draining all instances");
        let cold_start = self.inner.config.cold_start_timeout();
        let drains = entries.into_iter().map(|(key, entry)| async move {
            // Let an in-flight start settle so its processes are not orphaned.
            let _ = tokio::time::timeout(cold_start, entry.ready.clone()).await;
            if let Err(e) = entry.instance.shutdown().await {
                warn!(target: "devlabo::registry", instance = %key, error = %e, "drain finished with errors");
            }
            self.inner.remove_entry(&key, entry.generation);
        });
        futures_util::future::join_all(drains).await;
    }

    /// Keys and lifecycle states of live instances, sorted by key.
    pub fn snapshot(&self) -> Vec<InstanceSummary> {
        let mut out: Vec<InstanceSummary> = self
            .inner
            .entries
            .iter()
            .map(|e| InstanceSummary {
                user_id: e.key().user_id.clone(),
                project_id: e.key().project_id.clone(),
                lifecycle: e.instance.lifecycle(),
                port_base: e.instance.ports().base,
                idle_secs: e.instance.idle_for().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| (&a.user_id, &a.project_id).cmp(&(&b.user_id, &b.project_id)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_allocator_reuses_released_slots() {
        let ports = PortAllocator::new(2, 3001, 10);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_eq!(a.base, 3001);
        assert_eq!(b.base, 3011);
        assert!(ports.allocate().is_none());

        ports.release(a);
        assert_eq!(ports.in_use(), 1);
        assert_eq!(ports.allocate().unwrap().slot, 0);
    }
}
