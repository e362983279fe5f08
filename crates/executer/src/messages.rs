//! Events consumed by the executer and messages it exchanges with nodes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use quarry_common::{
    ActorId, ChannelId, ComputeStatus, Issues, NodeId, StageId, StatusCode, TaskId, TxId,
};
use quarry_graph::{
    ChannelTransportVersion, PhysicalTx, Snapshot, TaskInput, TaskMeta, TaskOutput,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::admission::NodeResources;
use crate::resolver::{ShardsResolveStatus, TableResolveStatus};
use crate::results::StreamBatch;
use crate::stats::TaskStats;

/// Handle collaborators use to post events into an executer inbox.
pub type EventSender = UnboundedSender<ExecuterEvent>;

/// Rate limiter resource the request is billed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterPath {
    pub coordination_node: String,
    pub resource: String,
    pub database: String,
    pub token: String,
}

pub struct TxRequest {
    pub tx_id: TxId,
    /// Actor that submitted the request and receives the reply.
    pub caller: ActorId,
    pub transactions: Vec<PhysicalTx>,
    pub snapshot: Snapshot,
    pub database: String,
    pub user_sid: Option<String>,
    /// `Some(0)` asks to take locks under the transaction id itself.
    pub lock_tx_id: Option<u64>,
    pub timeout: Option<Duration>,
    pub cancel_after: Option<Duration>,
    pub rate_limiter: Option<RateLimiterPath>,
    pub trace_id: Option<String>,
    /// Destination of streaming results.
    pub result_stream: Option<UnboundedSender<StreamBatch>>,
}

impl TxRequest {
    pub fn new(tx_id: TxId, caller: ActorId, transactions: Vec<PhysicalTx>) -> Self {
        Self {
            tx_id,
            caller,
            transactions,
            snapshot: Snapshot::default(),
            database: String::new(),
            user_sid: None,
            lock_tx_id: None,
            timeout: None,
            cancel_after: None,
            rate_limiter: None,
            trace_id: None,
            result_stream: None,
        }
    }

    pub fn debug_string(&self) -> String {
        let stages: usize = self.transactions.iter().map(|tx| tx.stages.len()).sum();
        let results: usize = self.transactions.iter().map(|tx| tx.results.len()).sum();
        format!(
            "TxRequest {{ tx_id: {}, caller: {}, database: {:?}, transactions: {}, stages: {}, results: {}, snapshot: {}/{}, lock_tx_id: {:?}, timeout: {:?}, cancel_after: {:?}, streaming: {}, rate_limited: {} }}",
            self.tx_id,
            self.caller,
            self.database,
            self.transactions.len(),
            stages,
            results,
            self.snapshot.step,
            self.snapshot.tx_id,
            self.lock_tx_id,
            self.timeout,
            self.cancel_after,
            self.result_stream.is_some(),
            self.rate_limiter.is_some(),
        )
    }
}

impl fmt::Debug for TxRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_string())
    }
}

/// Endpoint of a channel as known to the executer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Unknown,
    Actor(ActorId),
}

impl Endpoint {
    pub fn from_actor(actor: Option<ActorId>) -> Self {
        actor.map_or(Endpoint::Unknown, Endpoint::Actor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDesc {
    pub id: ChannelId,
    pub src_task: TaskId,
    pub src_endpoint: Endpoint,
    pub dst_task: Option<TaskId>,
    pub dst_endpoint: Endpoint,
    pub in_memory: bool,
    pub transport_version: ChannelTransportVersion,
}

/// Everything a node needs to start one compute actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub program: Vec<u8>,
    pub meta: TaskMeta,
    /// Shared by tasks built from one glued meta, so the node can tell
    /// equivalent task instances apart from distinct ones.
    pub meta_glueing_id: Option<u32>,
    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<TaskOutput>,
    pub channels: Vec<ChannelDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTasksRequest {
    pub tx_id: TxId,
    pub executer: ActorId,
    pub snapshot: Snapshot,
    pub database: String,
    pub lock_tx_id: Option<u64>,
    pub tasks: Vec<TaskDescriptor>,
    /// Set on resends so the node can tell a retry from a fresh start.
    pub retry_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotStartedReason {
    NotEnoughMemory,
    NotEnoughExecutionUnits,
    QueryMemoryLimitExceeded,
    QueryExecutionUnitsLimitExceeded,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedTask {
    pub task_id: TaskId,
    pub actor: ActorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotStartedTask {
    pub task_id: TaskId,
    pub reason: NotStartedReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTasksResponse {
    pub tx_id: TxId,
    pub node: NodeId,
    pub started: Vec<StartedTask>,
    pub not_started: Vec<NotStartedTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndeliveredReason {
    ActorUnknown,
    Disconnected,
    Unknown,
}

impl fmt::Display for UndeliveredReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndeliveredReason::ActorUnknown => f.write_str("actor unknown"),
            UndeliveredReason::Disconnected => f.write_str("disconnected"),
            UndeliveredReason::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeState {
    Unknown,
    Executing,
    Failure,
    Finished,
}

/// Progress report of one compute actor.
#[derive(Debug, Clone)]
pub struct ComputeActorState {
    pub actor: ActorId,
    pub task_id: TaskId,
    pub state: ComputeState,
    pub status: ComputeStatus,
    pub issues: Issues,
    pub stats: Option<TaskStats>,
    pub extra_data: Option<Vec<u8>>,
}

impl ComputeActorState {
    pub fn new(actor: ActorId, task_id: TaskId, state: ComputeState) -> Self {
        Self {
            actor,
            task_id,
            state,
            status: ComputeStatus::Success,
            issues: Issues::new(),
            stats: None,
            extra_data: None,
        }
    }

    pub fn with_stats(mut self, stats: TaskStats) -> Self {
        self.stats = Some(stats);
        self
    }
}

/// Batched channel endpoint updates for one actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelsInfo {
    pub tx_id: TxId,
    pub channels: Vec<ChannelDesc>,
}

#[derive(Debug, Clone)]
pub struct AbortExecution {
    pub sender: ActorId,
    pub status: StatusCode,
    pub issues: Issues,
}

/// Data pushed by a compute actor into a result channel.
#[derive(Debug, Clone)]
pub struct ChannelData {
    pub channel: ChannelId,
    pub seq_no: u64,
    pub sender: ActorId,
    pub batch: Option<RecordBatch>,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDataAck {
    pub channel: ChannelId,
    pub seq_no: u64,
    pub to: ActorId,
}

/// Secrets resolved so far, by secret name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretsSnapshot {
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug)]
pub enum ExecuterEvent {
    TxRequest(Box<TxRequest>),
    TablesResolved(TableResolveStatus),
    ShardsResolved(ShardsResolveStatus),
    SecretsSnapshot(SecretsSnapshot),
    SecretsWaitExpired,
    ResourcesSnapshot(Vec<NodeResources>),
    StartTasksResponse(StartTasksResponse),
    ComputeState(ComputeActorState),
    Undelivered { node: NodeId, reason: UndeliveredReason },
    Retry { node: NodeId },
    NodeDisconnected { node: NodeId },
    Abort(AbortExecution),
    ChannelData(ChannelData),
    Deadline,
    CancelAfter,
    Poison,
}

impl ExecuterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecuterEvent::TxRequest(_) => "TxRequest",
            ExecuterEvent::TablesResolved(_) => "TablesResolved",
            ExecuterEvent::ShardsResolved(_) => "ShardsResolved",
            ExecuterEvent::SecretsSnapshot(_) => "SecretsSnapshot",
            ExecuterEvent::SecretsWaitExpired => "SecretsWaitExpired",
            ExecuterEvent::ResourcesSnapshot(_) => "ResourcesSnapshot",
            ExecuterEvent::StartTasksResponse(_) => "StartTasksResponse",
            ExecuterEvent::ComputeState(_) => "ComputeState",
            ExecuterEvent::Undelivered { .. } => "Undelivered",
            ExecuterEvent::Retry { .. } => "Retry",
            ExecuterEvent::NodeDisconnected { .. } => "NodeDisconnected",
            ExecuterEvent::Abort(_) => "Abort",
            ExecuterEvent::ChannelData(_) => "ChannelData",
            ExecuterEvent::Deadline => "Deadline",
            ExecuterEvent::CancelAfter => "CancelAfter",
            ExecuterEvent::Poison => "Poison",
        }
    }
}
