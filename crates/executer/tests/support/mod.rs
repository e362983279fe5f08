#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use quarry_common::{
    ActorId, ComputeStatus, ExecuterCounters, Issues, NodeId, ShardId, StageId, TableId, TaskId,
    TxId,
};
use quarry_executer::messages::{
    ChannelDataAck, ChannelsInfo, ComputeActorState, ComputeState, RateLimiterPath, StartTasksRequest,
    StartTasksResponse, StartedTask,
};
use quarry_executer::services::{
    ManualClock, NodeTransport, PipeCache, RateLimiter, ResourceManager, SecretsService,
    ShardsResolverService, TableResolverService, Timer,
};
use quarry_executer::{
    Executer, ExecuterEvent, ExecuterReply, ExecuterServices, ExecuterSettings, ExecutionStrategy,
    NodeResources, RangePartitionPruner, ShardsResolveStatus, TableResolveStatus, TxRequest,
};
use quarry_graph::{
    Connection, KeyRange, PhysicalStage, PhysicalTx, StageInput, TableInfo, TableKind, TableOp,
    TablePartition, TableRead, TxResultSpec, TxType,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

pub const EXECUTER_NODE: NodeId = NodeId(1);

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

#[derive(Default)]
pub struct FakeTableResolver {
    next: AtomicU64,
    pub requests: Mutex<Vec<TxId>>,
    pub cancelled: Mutex<Vec<ActorId>>,
    /// Answers every request right away with these tables.
    pub auto_reply: Mutex<Option<Vec<TableInfo>>>,
}

impl TableResolverService for FakeTableResolver {
    fn resolve_tables(&self, tx_id: TxId, _transactions: &[PhysicalTx], reply: quarry_executer::EventSender) -> ActorId {
        lock(&self.requests).push(tx_id);
        if let Some(tables) = lock(&self.auto_reply).clone() {
            let _ = reply.send(ExecuterEvent::TablesResolved(TableResolveStatus::success(tables)));
        }
        ActorId::new(EXECUTER_NODE, 500 + self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn cancel(&self, resolver: ActorId) {
        lock(&self.cancelled).push(resolver);
    }
}

#[derive(Default)]
pub struct FakeShardsResolver {
    pub requests: Mutex<Vec<BTreeSet<ShardId>>>,
    pub cancelled: Mutex<Vec<ActorId>>,
}

impl ShardsResolverService for FakeShardsResolver {
    fn resolve_shards(&self, _tx_id: TxId, shards: BTreeSet<ShardId>, _reply: quarry_executer::EventSender) -> ActorId {
        lock(&self.requests).push(shards);
        ActorId::new(EXECUTER_NODE, 600)
    }

    fn cancel(&self, resolver: ActorId) {
        lock(&self.cancelled).push(resolver);
    }
}

#[derive(Default)]
pub struct FakeResourceManager {
    pub requests: AtomicU64,
}

impl ResourceManager for FakeResourceManager {
    fn request_cluster_resources(&self, _reply: quarry_executer::EventSender) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// Actor a fake node starts for `task`.
pub fn actor_for(node: NodeId, task: TaskId) -> ActorId {
    ActorId::new(node, 1000 + task.0)
}

#[derive(Default)]
pub struct RecordingTransport {
    pub start_requests: Mutex<Vec<(NodeId, StartTasksRequest)>>,
    pub channels_infos: Mutex<Vec<(ActorId, ChannelsInfo)>>,
    pub aborts: Mutex<Vec<(ActorId, ComputeStatus)>>,
    pub acks: Mutex<Vec<ChannelDataAck>>,
    pub unsubscribed: Mutex<Vec<NodeId>>,
    /// Starts every task right away.
    pub auto_start: Mutex<bool>,
    pub observer: Mutex<Option<UnboundedSender<StartTasksRequest>>>,
}

impl RecordingTransport {
    pub fn start_count(&self, node: NodeId) -> usize {
        lock(&self.start_requests).iter().filter(|(n, _)| *n == node).count()
    }

    pub fn last_request(&self, node: NodeId) -> Option<StartTasksRequest> {
        lock(&self.start_requests)
            .iter()
            .rev()
            .find(|(n, _)| *n == node)
            .map(|(_, r)| r.clone())
    }

    pub fn nodes(&self) -> BTreeSet<NodeId> {
        lock(&self.start_requests).iter().map(|(n, _)| *n).collect()
    }

    pub fn aborts(&self) -> Vec<(ActorId, ComputeStatus)> {
        lock(&self.aborts).clone()
    }

    pub fn channels_info_count(&self) -> usize {
        lock(&self.channels_infos).len()
    }
}

impl NodeTransport for RecordingTransport {
    fn start_tasks(&self, node: NodeId, request: StartTasksRequest, reply: quarry_executer::EventSender) {
        if *lock(&self.auto_start) {
            let response = StartTasksResponse {
                tx_id: request.tx_id,
                node,
                started: request
                    .tasks
                    .iter()
                    .map(|t| StartedTask {
                        task_id: t.task_id,
                        actor: actor_for(node, t.task_id),
                    })
                    .collect(),
                not_started: Vec::new(),
            };
            let _ = reply.send(ExecuterEvent::StartTasksResponse(response));
        }
        if let Some(observer) = lock(&self.observer).as_ref() {
            let _ = observer.send(request.clone());
        }
        lock(&self.start_requests).push((node, request));
    }

    fn send_channels_info(&self, actor: ActorId, info: ChannelsInfo) {
        lock(&self.channels_infos).push((actor, info));
    }

    fn abort_compute_actor(&self, actor: ActorId, status: ComputeStatus, _issues: Issues) {
        lock(&self.aborts).push((actor, status));
    }

    fn ack_channel_data(&self, ack: ChannelDataAck) {
        lock(&self.acks).push(ack);
    }

    fn unsubscribe(&self, nodes: &[NodeId]) {
        lock(&self.unsubscribed).extend_from_slice(nodes);
    }
}

#[derive(Default)]
pub struct FakeRateLimiter {
    pub reports: Mutex<Vec<(u64, RateLimiterPath)>>,
}

impl RateLimiter for FakeRateLimiter {
    fn report_resource_usage(&self, ru: u64, path: &RateLimiterPath) -> ActorId {
        lock(&self.reports).push((ru, path.clone()));
        ActorId::new(EXECUTER_NODE, 700)
    }
}

#[derive(Default)]
pub struct FakeSecrets {
    pub subscriptions: Mutex<Vec<(Option<String>, Vec<String>)>>,
    pub unsubscribed: Mutex<Vec<u64>>,
}

impl SecretsService for FakeSecrets {
    fn subscribe(&self, user_sid: Option<&str>, names: &[String], _reply: quarry_executer::EventSender) -> u64 {
        let mut subscriptions = lock(&self.subscriptions);
        subscriptions.push((user_sid.map(str::to_string), names.to_vec()));
        subscriptions.len() as u64
    }

    fn unsubscribe(&self, subscription: u64) {
        lock(&self.unsubscribed).push(subscription);
    }
}

#[derive(Default)]
pub struct FakePipeCache {
    pub reconnects: Mutex<Vec<ShardId>>,
}

impl PipeCache for FakePipeCache {
    fn force_reconnect(&self, shard: ShardId) {
        lock(&self.reconnects).push(shard);
    }
}

/// Keeps scheduled events until a test fires them.
#[derive(Default)]
pub struct ManualTimer {
    pub scheduled: Mutex<Vec<(Duration, ExecuterEvent)>>,
}

impl ManualTimer {
    pub fn delays_of(&self, name: &str) -> Vec<Duration> {
        lock(&self.scheduled)
            .iter()
            .filter(|(_, e)| e.name() == name)
            .map(|(d, _)| *d)
            .collect()
    }

    /// Removes the first scheduled event called `name`.
    pub fn take(&self, name: &str) -> Option<ExecuterEvent> {
        let mut scheduled = lock(&self.scheduled);
        let index = scheduled.iter().position(|(_, e)| e.name() == name)?;
        Some(scheduled.remove(index).1)
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, event: ExecuterEvent, _reply: quarry_executer::EventSender) {
        lock(&self.scheduled).push((delay, event));
    }
}

#[derive(Default)]
pub struct Fakes {
    pub table_resolver: Arc<FakeTableResolver>,
    pub shards_resolver: Arc<FakeShardsResolver>,
    pub resource_manager: Arc<FakeResourceManager>,
    pub transport: Arc<RecordingTransport>,
    pub rate_limiter: Arc<FakeRateLimiter>,
    pub secrets: Arc<FakeSecrets>,
    pub pipe_cache: Arc<FakePipeCache>,
    pub timer: Arc<ManualTimer>,
    pub clock: Arc<ManualClock>,
    pub counters: Arc<ExecuterCounters>,
}

impl Fakes {
    pub fn services(&self) -> ExecuterServices {
        self.services_with_timer(self.timer.clone())
    }

    pub fn services_with_timer(&self, timer: Arc<dyn Timer>) -> ExecuterServices {
        ExecuterServices {
            table_resolver: self.table_resolver.clone(),
            shards_resolver: self.shards_resolver.clone(),
            resource_manager: self.resource_manager.clone(),
            transport: self.transport.clone(),
            rate_limiter: self.rate_limiter.clone(),
            secrets: self.secrets.clone(),
            pipe_cache: self.pipe_cache.clone(),
            timer,
            clock: self.clock.clone(),
            partition_pruner: Arc::new(RangePartitionPruner),
            counters: self.counters.clone(),
        }
    }
}

/// Drives one executer synchronously.
pub struct Harness {
    pub executer: Executer,
    pub fakes: Fakes,
    inbox: UnboundedReceiver<ExecuterEvent>,
    reply: oneshot::Receiver<ExecuterReply>,
}

impl Harness {
    pub fn new(settings: ExecuterSettings, strategy: Box<dyn ExecutionStrategy>) -> Self {
        let fakes = Fakes::default();
        let (sender, inbox) = mpsc::unbounded_channel();
        let (reply_tx, reply) = oneshot::channel();
        let executer = Executer::new(
            ActorId::new(EXECUTER_NODE, 1),
            settings,
            fakes.services(),
            strategy,
            sender,
            reply_tx,
        );
        Self {
            executer,
            fakes,
            inbox,
            reply,
        }
    }

    /// Handles `event`, then everything the executer posted to itself.
    pub fn post(&mut self, event: ExecuterEvent) {
        self.executer.handle(event);
        self.pump();
    }

    pub fn pump(&mut self) {
        while let Ok(event) = self.inbox.try_recv() {
            self.executer.handle(event);
        }
    }

    pub fn fire(&mut self, name: &str) {
        let event = self
            .fakes
            .timer
            .take(name)
            .unwrap_or_else(|| panic!("{name} was not scheduled"));
        self.post(event);
    }

    pub fn try_reply(&mut self) -> Option<ExecuterReply> {
        self.reply.try_recv().ok()
    }

    pub fn reply(&mut self) -> ExecuterReply {
        self.try_reply().expect("executer should have replied")
    }

    /// Starts every task of the last request sent to `node`.
    pub fn start_all_on(&mut self, node: NodeId) -> Vec<(TaskId, ActorId)> {
        let request = self
            .fakes
            .transport
            .last_request(node)
            .unwrap_or_else(|| panic!("no start request for {node}"));
        let started: Vec<StartedTask> = request
            .tasks
            .iter()
            .map(|t| StartedTask {
                task_id: t.task_id,
                actor: actor_for(node, t.task_id),
            })
            .collect();
        let pairs = started.iter().map(|s| (s.task_id, s.actor)).collect();
        self.post(ExecuterEvent::StartTasksResponse(StartTasksResponse {
            tx_id: request.tx_id,
            node,
            started,
            not_started: Vec::new(),
        }));
        pairs
    }

    pub fn start_everything(&mut self) -> Vec<(TaskId, ActorId)> {
        let mut all = Vec::new();
        for node in self.fakes.transport.nodes() {
            all.extend(self.start_all_on(node));
        }
        all
    }

    pub fn finish(&mut self, task: TaskId, actor: ActorId) {
        self.post(ExecuterEvent::ComputeState(ComputeActorState::new(
            actor,
            task,
            ComputeState::Finished,
        )));
    }
}

/// Orders table: shard 1 on node 1, shards 2 and 3 on node 2.
pub fn orders_table() -> TableInfo {
    let mut table = TableInfo::new(TableId(1), "/Root/orders", TableKind::Datashard);
    table.partitions = vec![
        TablePartition { shard_id: ShardId(1), end_key: Some(b"f".to_vec()) },
        TablePartition { shard_id: ShardId(2), end_key: Some(b"m".to_vec()) },
        TablePartition { shard_id: ShardId(3), end_key: None },
    ];
    table
}

pub fn orders_shard_nodes() -> BTreeMap<ShardId, NodeId> {
    BTreeMap::from([
        (ShardId(1), NodeId(1)),
        (ShardId(2), NodeId(2)),
        (ShardId(3), NodeId(2)),
    ])
}

pub fn two_nodes() -> Vec<NodeResources> {
    vec![
        NodeResources::new(NodeId(1), 1 << 30, 8),
        NodeResources::new(NodeId(2), 1 << 30, 8),
    ]
}

/// Full scan of the orders table gathered into one result.
pub fn scan_tx() -> PhysicalTx {
    let mut scan = PhysicalStage::new(vec![1, 2, 3], 1);
    scan.table_ops.push(TableOp {
        table: TableId(1),
        columns: vec!["id".into(), "amount".into()],
        read: TableRead::ReadRange(KeyRange::full()),
        items_limit: 0,
        reverse: false,
        sorted: false,
    });
    let mut gather = PhysicalStage::new(vec![4], 1);
    gather.inputs.push(StageInput {
        stage: 0,
        output_index: 0,
        connection: Connection::UnionAll,
    });
    PhysicalTx::new(TxType::Scan)
        .with_stage(scan)
        .with_stage(gather)
        .with_result(TxResultSpec::new(1))
}

pub fn scan_request() -> TxRequest {
    TxRequest::new(TxId(42), ActorId::new(NodeId(1), 77), vec![scan_tx()])
}

/// Runs the scan request up to the point where start requests are out.
pub fn dispatch_scan(harness: &mut Harness, request: TxRequest) {
    harness.post(ExecuterEvent::TxRequest(Box::new(request)));
    harness.post(ExecuterEvent::TablesResolved(TableResolveStatus::success(vec![orders_table()])));
    harness.post(ExecuterEvent::ShardsResolved(ShardsResolveStatus::success(orders_shard_nodes())));
    harness.post(ExecuterEvent::ResourcesSnapshot(two_nodes()));
}

pub fn int_batch(values: &[i64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))]).unwrap()
}

pub fn gather_stage() -> StageId {
    StageId::new(0, 1)
}
