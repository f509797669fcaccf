//! devlabo-core: sandbox runtime library.
//!
//! One [`SandboxInstance`] per `(user, project)`: a local workspace mirrored to object
//! storage, four module dev servers on a private port block, and a path-confined file API.
//! [`InstanceRegistry`] owns the instances and guarantees a single cold start per key.

mod config;
mod error;
mod instance;
mod registry;
mod scaffold;
mod shared;

pub mod process;
pub mod security;
pub mod storage;
pub mod sync;

pub use config::{SandboxConfig, StorageBackend};
pub use error::{SandboxError, SandboxResult};
pub use instance::{InstanceStatus, SandboxInstance};
pub use registry::{InstanceRegistry, InstanceSummary, PortAllocator};
pub use scaffold::scaffold_files;
pub use shared::{FileKind, FileNode, FileRecord, Lifecycle, Module, PortBlock, ProjectKey};

pub use process::{ProcessState, ProcessStatus};
pub use storage::{
    build_store, LocalObjectStore, MemoryObjectStore, ObjectMeta, ObjectStore, S3ObjectStore,
};
pub use sync::{PullReport, PushReport, SyncEngine};
