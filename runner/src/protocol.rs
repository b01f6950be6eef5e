//! Messages and records shared by the registry, the slave agents and the masters.
//!
//! Every frame on the wire is a [`Envelope`] around one of the request/response enums
//! below, serialized as a single line of JSON (see [`crate::transport`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, path::PathBuf};
use uuid::Uuid;

/// wire protocol version, bumped on incompatible message changes
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifier a slave agent hands out for an accepted job
pub type JobId = Uuid;

/// Identity of a running coordination process (registry, slave or master)
///
/// For slaves this is the `host:port` their agent listens on, so the identity doubles as
/// the endpoint a master connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SocketAddr> for NodeIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for NodeIdentity {
    fn from(identity: &str) -> Self {
        Self(identity.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Slave,
    Master,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slave => f.write_str("slave"),
            Self::Master => f.write_str("master"),
        }
    }
}

/// Versioned wrapper around every frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub protocol_version: u32,
    pub message: T,
}

impl<T> Envelope<T> {
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub identity: NodeIdentity,
    pub role: Role,
    pub registered_at: DateTime<Utc>,
}

/// node -> registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryRequest {
    Register { identity: NodeIdentity, role: Role },
    Unregister { identity: NodeIdentity },
    ListByRole { role: Role },
    Ping,
}

/// registry -> node, exactly one per request and in request order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryResponse {
    Registered { entry: RegistryEntry },
    Unregistered { identity: NodeIdentity, removed: bool },
    Nodes { role: Role, nodes: Vec<NodeIdentity> },
    Pong,
    Error { message: String },
}

/// Everything a slave needs to launch one solver worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveRequest {
    pub stub: PathBuf,
    #[serde(default)]
    pub options: Vec<String>,
    pub slots: u32,
}

/// master -> slave
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    Hello { master: NodeIdentity },
    StartSolver { request_id: u64, request: SolveRequest },
    Ping,
}

/// slave -> master
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlaveMessage {
    Welcome { slave: NodeIdentity, total_slots: u32 },
    Started { request_id: u64, reply: StartReply },
    JobFinished(JobFinished),
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartReply {
    Accepted { job_id: JobId, free_slots: u32 },
    Rejected { reason: Rejection },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    NoFreeCapacity { free_slots: u32, requested: u32 },
    InvalidRequest { message: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFreeCapacity {
                free_slots,
                requested,
            } => write!(f, "no free capacity ({free_slots} free, {requested} requested)"),
            Self::InvalidRequest { message } => write!(f, "invalid request: {message}"),
        }
    }
}

/// Terminal notice for one accepted job, sent exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFinished {
    pub job_id: JobId,
    pub stub: PathBuf,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// `result` is the location of the solution artifact
    Success { result: PathBuf },
    Failure { reason: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched { slave: NodeIdentity, job_id: JobId },
    Completed { result: PathBuf },
    Failed { reason: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Dispatched { slave, .. } => write!(f, "dispatched to {slave}"),
            Self::Completed { result } => write!(f, "solved -> {}", result.display()),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Externally visible view of one subproblem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub stub: PathBuf,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_reason: Option<String>,
}

/// operator -> standing master
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Submit { stubs: Vec<PathBuf> },
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Submitted { count: usize },
    Report { tasks: Vec<TaskReport> },
    Error { message: String },
}
