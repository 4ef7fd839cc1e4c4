// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapError {
    #[error("Connection Error: {0}")]
    Connection(String),

    #[error("Submission failed for {target}: {reason}")]
    Submission { target: String, reason: String },

    #[error("Operation failed for {target}: {message}")]
    OperationFailed { target: String, message: String },

    #[error("Malformed snapshot tree: {0}")]
    MalformedTree(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store Error: {0}")]
    Store(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("another workflow is still running")]
    WorkflowBusy,
}

// Define the primary Result type for snapshot-manager operations
pub type Result<T> = std::result::Result<T, SnapError>;

/// Opaque reference to an authenticated session on one management server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef(pub String);

/// Opaque reference to a virtual machine owned by the management API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef(pub String);

/// Opaque reference to a remote snapshot object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotRef(pub String);

/// Opaque reference to a long-running remote task, pollable for state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef(pub String);

impl Display for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for SnapshotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a snapshot sits in its chain. Only independent snapshots may be
/// deleted through this tool; anything with a parent or children needs
/// vendor-tool chain management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Independent,
    Child,
    HasChildrenOnly,
    ChainMiddle,
}

impl ChainStatus {
    pub fn eligible_for_deletion(&self) -> bool {
        matches!(self, ChainStatus::Independent)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChainStatus::Independent => "Independent Snapshot",
            ChainStatus::Child => "Child Snapshot",
            ChainStatus::HasChildrenOnly => "Has Child Snapshots (Delete Manually)",
            ChainStatus::ChainMiddle => "Part of Chain (Middle)",
        }
    }
}

/// One node of a VM's snapshot tree as returned by the management API.
/// The tree is copied into owned nodes at fetch time so no live collaborator
/// references are held across async boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub snapshot: SnapshotRef,
    pub name: String,
    /// Creation timestamp as the server rendered it. Parsing happens during
    /// classification and may legitimately fail.
    pub created: String,
    pub children: Vec<SnapshotNode>,
}

/// Uniquely identifies one snapshot for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotIdentity {
    pub server: String,
    pub vm_name: String,
    pub name: String,
}

impl Display for SnapshotIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.server, self.vm_name, self.name)
    }
}

/// One flattened, classified-ready snapshot of a virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub vm_name: String,
    pub server: String,
    pub name: String,
    /// Raw creation timestamp, kept for display even when parsing fails.
    pub created: String,
    /// Parsed creation time; `None` when the raw value matched no known format.
    pub created_at: Option<DateTime<Utc>>,
    pub snapshot: SnapshotRef,
    pub vm: VmRef,
    pub has_children: bool,
    pub is_child: bool,
}

impl SnapshotRecord {
    pub fn identity(&self) -> SnapshotIdentity {
        SnapshotIdentity {
            server: self.server.clone(),
            vm_name: self.vm_name.clone(),
            name: self.name.clone(),
        }
    }
}

/// A VM as enumerated on one management server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub vm: VmRef,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
}

/// Snapshot of one remote task's state as observed by a single poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Fractional progress, 0-100. Treated as 0 when the server omits it.
    pub progress: Option<u8>,
    pub error: Option<String>,
}

/// Parameters for a bulk snapshot creation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpec {
    pub name: String,
    pub description: String,
    pub include_memory: bool,
}

impl Default for CreateSpec {
    fn default() -> Self {
        Self {
            name: "Monthly Patching".to_string(),
            description: "Monthly Patching".to_string(),
            include_memory: false,
        }
    }
}

/// Events emitted by background workflows toward the interactive surface.
/// Strictly one-directional; the receiver applies them on its own update
/// cycle and owns all shared view state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Free-form status line.
    Progress { message: String },

    /// A snapshot was discovered (fetch) or confirmed created (create).
    SnapshotFound { record: SnapshotRecord },

    /// One item's remote operation succeeded.
    ItemCompleted { identity: SnapshotIdentity },

    /// One item failed: submission error, remote failure, or unresolved name.
    ItemFailed { target: String, message: String },

    /// Aggregate progress across all items of the active workflow.
    AggregateProgress {
        completed: usize,
        total: usize,
        percent: f64,
        message: String,
    },

    /// Workflow-level error. Non-fatal unless followed directly by `Done`
    /// with nothing completed.
    Error { message: String },

    /// Always the final event of a workflow.
    Done,
}

// Define the management API boundary. Implementations talk to a real
// virtualization management server; tests script an in-memory fake.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn connect(&self, hostname: &str, username: &str, password: &str)
        -> Result<SessionRef>;

    async fn disconnect(&self, session: &SessionRef) -> Result<()>;

    /// Cheap liveness probe for an existing session.
    async fn health_check(&self, session: &SessionRef) -> bool;

    async fn enumerate_vms(&self, session: &SessionRef) -> Result<Vec<VmSummary>>;

    /// Root list of the VM's snapshot tree, copied into owned nodes.
    async fn snapshot_roots(&self, session: &SessionRef, vm: &VmRef)
        -> Result<Vec<SnapshotNode>>;

    async fn submit_create_snapshot(
        &self,
        session: &SessionRef,
        vm: &VmRef,
        spec: &CreateSpec,
    ) -> Result<TaskRef>;

    async fn submit_delete_snapshot(
        &self,
        session: &SessionRef,
        snapshot: &SnapshotRef,
    ) -> Result<TaskRef>;

    async fn poll_task(&self, session: &SessionRef, task: &TaskRef) -> Result<TaskStatus>;
}
