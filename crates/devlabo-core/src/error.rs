//! Error types for the sandbox runtime.

use crate::shared::Module;
use thiserror::Error;

/// Result type alias for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors surfaced by path security, sync, process supervision and the registry.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Security violation. Always rejected, never retried.
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("invalid project key: {0}")]
    InvalidProjectKey(String),

    /// Pull or process start failed. The registry discards the attempt so a retry is clean.
    #[error("instance start failed: {0}")]
    InstanceStartFailure(String),

    /// Module exhausted its restart budget. Other modules keep serving.
    #[error("module {0} crashed and exceeded its restart budget")]
    ModuleCrashed(Module),

    #[error("module {0} is not running")]
    ModuleUnavailable(Module),

    #[error("sync push failed: {0}")]
    SyncPushFailure(String),

    #[error("sync pull failed: {0}")]
    SyncPullFailure(String),

    #[error("object storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// True for transient infrastructure failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::InstanceStartFailure(_)
                | SandboxError::SyncPullFailure(_)
                | SandboxError::SyncPushFailure(_)
                | SandboxError::Storage(_)
                | SandboxError::Timeout(_)
        )
    }

    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::PathTraversal(_) => "path_traversal",
            SandboxError::UnknownModule(_) => "unknown_module",
            SandboxError::InvalidProjectKey(_) => "invalid_project_key",
            SandboxError::InstanceStartFailure(_) => "instance_start_failure",
            SandboxError::ModuleCrashed(_) => "module_crashed",
            SandboxError::ModuleUnavailable(_) => "module_unavailable",
            SandboxError::SyncPushFailure(_) => "sync_push_failure",
            SandboxError::SyncPullFailure(_) => "sync_pull_failure",
            SandboxError::Storage(_) => "storage_error",
            SandboxError::NotFound(_) => "not_found",
            SandboxError::Timeout(_) => "timeout",
            SandboxError::Process(_) => "process_error",
            SandboxError::Config(_) => "config_error",
            SandboxError::Io(_) => "io_error",
        }
    }
}

impl From<config::ConfigError> for SandboxError {
    fn from(err: config::ConfigError) -> Self {
        SandboxError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_errors_are_never_retryable() {
        assert!(!SandboxError::PathTraversal("../x".into()).is_retryable());
        assert!(!SandboxError::UnknownModule("nope".into()).is_retryable());
        assert!(SandboxError::InstanceStartFailure("pull".into()).is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(SandboxError::PathTraversal("x".into()).code(), "path_traversal");
        assert_eq!(SandboxError::ModuleCrashed(Module::Frontend).code(), "module_crashed");
    }
}
