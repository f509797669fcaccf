//! Runtime configuration loaded from file and environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | DEVLABO_CONFIG | config/devlabo.toml | Optional config file path. |
//! | DEVLABO__BIND_ADDR | 127.0.0.1:8000 | Gateway listen address. |
//! | DEVLABO__WORKSPACE_ROOT | ./data/workspaces | Per-project workspaces `{root}/{user}/{project}`. |
//! | DEVLABO__STORAGE_BACKEND | local | `s3` \| `local` \| `memory`. |
//! | DEVLABO__BUCKET / DEVLABO__ENDPOINT_URL | - | S3 / R2 bucket and endpoint. |
//! | DEVLABO__SERVER_COMMAND | python3 -m http.server {port} --bind 127.0.0.1 | Module command template. |
//! | DEVLABO__IDLE_TIMEOUT_SECS | 300 | Idle eviction threshold. |
//! | DEVLABO__AGENT_URL | - | Agent collaborator for `/agent/chat`. |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Object store implementation selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// S3-compatible (Cloudflare R2, MinIO, AWS).
    S3,
    /// Directory on local disk. Development default.
    #[default]
    Local,
    /// Process memory. Tests only; nothing survives a restart.
    Memory,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./data/workspaces")
}

fn default_local_storage_path() -> PathBuf {
    PathBuf::from("./data/objects")
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_server_command() -> String {
    "python3 -m http.server {port} --bind 127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_port_base() -> u16 {
    3001
}

fn default_port_stride() -> u16 {
    10
}

fn default_max_instances() -> usize {
    16
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_health_interval_ms() -> u64 {
    5000
}

fn default_restart_limit() -> u32 {
    3
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_cold_start_timeout_secs() -> u64 {
    120
}

fn default_proxy_timeout_secs() -> u64 {
    30
}

fn default_push_debounce_ms() -> u64 {
    500
}

fn default_sync_retry_limit() -> u32 {
    3
}

fn default_sync_backoff_ms() -> u64 {
    200
}

fn default_object_timeout_secs() -> u64 {
    30
}

fn default_ignore_dirs() -> Vec<String> {
    ["node_modules", "__pycache__", ".git", ".venv", "dist", ".next"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_ignore_files() -> Vec<String> {
    [".env", ".DS_Store"].into_iter().map(String::from).collect()
}

fn default_ignore_suffixes() -> Vec<String> {
    [".pyc", ".log"].into_iter().map(String::from).collect()
}

/// Sandbox runtime configuration. Every field has a default so `SandboxConfig::default()`
/// describes a working local setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    #[serde(default)]
    pub storage_backend: StorageBackend,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Static credentials. When unset the AWS environment chain is used.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default = "default_local_storage_path")]
    pub local_storage_path: PathBuf,

    /// Module server command; `{port}` is substituted per module.
    #[serde(default = "default_server_command")]
    pub server_command: String,
    /// Probe `GET http://127.0.0.1:{port}/` in addition to checking the pid.
    #[serde(default = "default_true")]
    pub http_probe: bool,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_port_stride")]
    pub port_stride: u16,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_restart_limit")]
    pub restart_limit: u32,
    /// Backoff unit: the n-th restart waits `unit * 2^n`, capped at 30 units.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_cold_start_timeout_secs")]
    pub cold_start_timeout_secs: u64,
    #[serde(default = "default_proxy_timeout_secs")]
    pub proxy_timeout_secs: u64,

    #[serde(default = "default_push_debounce_ms")]
    pub push_debounce_ms: u64,
    #[serde(default = "default_sync_retry_limit")]
    pub sync_retry_limit: u32,
    #[serde(default = "default_sync_backoff_ms")]
    pub sync_backoff_ms: u64,
    #[serde(default = "default_object_timeout_secs")]
    pub object_timeout_secs: u64,

    #[serde(default)]
    pub agent_url: Option<String>,
    /// When set, the gateway also writes a daily rolling log file here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,
    #[serde(default = "default_ignore_files")]
    pub ignore_files: Vec<String>,
    #[serde(default = "default_ignore_suffixes")]
    pub ignore_suffixes: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            workspace_root: default_workspace_root(),
            storage_backend: StorageBackend::default(),
            bucket: None,
            endpoint_url: None,
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            local_storage_path: default_local_storage_path(),
            server_command: default_server_command(),
            http_probe: true,
            port_base: default_port_base(),
            port_stride: default_port_stride(),
            max_instances: default_max_instances(),
            startup_timeout_secs: default_startup_timeout_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            health_interval_ms: default_health_interval_ms(),
            restart_limit: default_restart_limit(),
            restart_backoff_ms: default_restart_backoff_ms(),
            grace_period_ms: default_grace_period_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            cold_start_timeout_secs: default_cold_start_timeout_secs(),
            proxy_timeout_secs: default_proxy_timeout_secs(),
            push_debounce_ms: default_push_debounce_ms(),
            sync_retry_limit: default_sync_retry_limit(),
            sync_backoff_ms: default_sync_backoff_ms(),
            object_timeout_secs: default_object_timeout_secs(),
            agent_url: None,
            log_dir: None,
            ignore_dirs: default_ignore_dirs(),
            ignore_files: default_ignore_files(),
            ignore_suffixes: default_ignore_suffixes(),
        }
    }
}

impl SandboxConfig {
    /// Load config from file and environment. Precedence: env `DEVLABO__*` > file at
    /// `DEVLABO_CONFIG` (default `config/devlabo.toml`) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("DEVLABO_CONFIG").unwrap_or_else(|_| "config/devlabo.toml".to_string());
        let builder = config::Config::builder()
            .set_default("bind_addr", default_bind_addr())?
            .set_default("storage_backend", "local")?
            .set_default("server_command", default_server_command())?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("DEVLABO")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ignore_dirs")
                    .with_list_parse_key("ignore_files")
                    .with_list_parse_key("ignore_suffixes"),
            )
            .build()?;

        built.try_deserialize()
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn cold_start_timeout(&self) -> Duration {
        Duration::from_secs(self.cold_start_timeout_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }

    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.push_debounce_ms)
    }

    pub fn object_timeout(&self) -> Duration {
        Duration::from_secs(self.object_timeout_secs)
    }

    /// Delay before the `attempt`-th restart (0-based): `unit * 2^attempt`, capped at 30 units.
    pub fn restart_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt).min(30);
        Duration::from_millis(self.restart_backoff_ms.saturating_mul(factor))
    }

    /// Delay before the `attempt`-th storage retry (0-based).
    pub fn sync_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt).min(30);
        Duration::from_millis(self.sync_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.port_base, 3001);
        assert_eq!(cfg.restart_limit, 3);
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.cold_start_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.push_debounce(), Duration::from_millis(500));
        assert_eq!(cfg.storage_backend, StorageBackend::Local);
        assert!(cfg.ignore_dirs.iter().any(|d| d == "node_modules"));
    }

    #[test]
    fn backoffs_are_capped() {
        let cfg = SandboxConfig {
            restart_backoff_ms: 1000,
            sync_backoff_ms: 200,
            ..SandboxConfig::default()
        };
        assert_eq!(cfg.restart_backoff(0), Duration::from_secs(1));
        assert_eq!(cfg.restart_backoff(2), Duration::from_secs(4));
        assert_eq!(cfg.restart_backoff(10), Duration::from_secs(30));
        assert_eq!(cfg.sync_backoff(1), Duration::from_millis(400));
        assert_eq!(cfg.sync_backoff(10), Duration::from_secs(6));
    }

    #[test]
    fn deserializes_partial_toml() {
        let cfg: SandboxConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "storage_backend = \"memory\"\nidle_timeout_secs = 5\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.storage_backend, StorageBackend::Memory);
        assert_eq!(cfg.idle_timeout_secs, 5);
        assert_eq!(cfg.max_instances, 16);
    }
}
