//! Shared types: project keys, the closed module set, lifecycle states and file records.

use crate::error::{SandboxError, SandboxResult};
use crate::security::validate_segment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// -----------------------------------------------------------------------------
// ProjectKey
// -----------------------------------------------------------------------------

/// `(user_id, project_id)` pair identifying one workspace. Both ids are single path segments
/// because they become directory names and the object-storage prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    pub user_id: String,
    pub project_id: String,
}

impl ProjectKey {
    /// Validates both ids and builds the key.
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> SandboxResult<Self> {
        let user_id = user_id.into();
        let project_id = project_id.into();
        validate_segment(&user_id)
            .map_err(|e| SandboxError::InvalidProjectKey(format!("user id: {e}")))?;
        validate_segment(&project_id)
            .map_err(|e| SandboxError::InvalidProjectKey(format!("project id: {e}")))?;
        Ok(Self {
            user_id,
            project_id,
        })
    }

    /// Object-storage prefix, always ending in `/`.
    pub fn storage_prefix(&self) -> String {
        format!("{}/{}/", self.user_id, self.project_id)
    }

    /// Workspace directory for this project under the configured root.
    pub fn workspace_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.user_id).join(&self.project_id)
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.project_id)
    }
}

// -----------------------------------------------------------------------------
// Module
// -----------------------------------------------------------------------------

/// One of the four artifact kinds. The set is closed and ordered: prototype is the source of
/// truth, the others are derived targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Prototype,
    Frontend,
    Dbml,
    Tests,
}

impl Module {
    pub const ALL: [Module; 4] = [Module::Prototype, Module::Frontend, Module::Dbml, Module::Tests];

    /// URL name used in `/connect/{user}/{project}/{module}`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Prototype => "prototype",
            Module::Frontend => "frontend",
            Module::Dbml => "dbml",
            Module::Tests => "tests",
        }
    }

    /// Subdirectory in the workspace and in object storage.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Module::Prototype => "prototype",
            Module::Frontend => "frontend",
            Module::Dbml => "dbml",
            Module::Tests => "test-case",
        }
    }

    /// Position in [`Module::ALL`]; offset inside an instance's port block.
    pub fn index(&self) -> u16 {
        match self {
            Module::Prototype => 0,
            Module::Frontend => 1,
            Module::Dbml => 2,
            Module::Tests => 3,
        }
    }

    /// Fixed internal port in the first port block (3001-3004).
    pub fn default_port(&self) -> u16 {
        3001 + self.index()
    }

    /// Reverse of [`Module::dir_name`].
    pub fn from_dir_name(dir: &str) -> Option<Module> {
        Module::ALL.into_iter().find(|m| m.dir_name() == dir)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Module::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| SandboxError::UnknownModule(s.to_string()))
    }
}

// -----------------------------------------------------------------------------
// Port blocks
// -----------------------------------------------------------------------------

/// Four consecutive ports owned by one instance. Slot 0 with the default base is 3001-3004.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBlock {
    pub slot: usize,
    pub base: u16,
}

impl PortBlock {
    pub fn new(slot: usize, port_base: u16, port_stride: u16) -> Self {
        Self {
            slot,
            base: port_base + (slot as u16) * port_stride,
        }
    }

    pub fn port(&self, module: Module) -> u16 {
        self.base + module.index()
    }
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

/// Per-instance state machine: `Cold → Pulling → Starting → Running → Draining → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Cold,
    Pulling,
    Starting,
    Running,
    Draining,
    Stopped,
}

impl Lifecycle {
    /// Legal forward transitions. `Stopped` is reachable from every non-terminal state
    /// because a pull failure or an explicit shutdown may happen at any point.
    pub fn can_transition_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, next),
            (Cold, Pulling)
                | (Pulling, Starting)
                | (Starting, Running)
                | (Cold | Pulling | Starting | Running, Draining)
                | (Cold | Pulling | Starting | Draining, Stopped)
        )
    }

    pub fn is_initializing(self) -> bool {
        matches!(self, Lifecycle::Cold | Lifecycle::Pulling | Lifecycle::Starting)
    }
}

// -----------------------------------------------------------------------------
// Files
// -----------------------------------------------------------------------------

/// A file or directory derived from the on-disk tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Path relative to the workspace root, `/`-separated (`frontend/src/App.jsx`).
    pub relative_path: String,
    /// Absent for directories.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    /// SHA-256 hex; absent for directories.
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// Node in a module listing returned by the file API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    /// Path relative to the module root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}
