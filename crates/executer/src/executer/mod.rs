//! Per-query orchestrator.
//!
//! One [`Executer`] drives one query: it resolves tables and shards, waits
//! for secrets and the cluster resource snapshot when the plan needs them,
//! builds the tasks graph, dispatches tasks through the [`Planner`] and
//! follows compute actors until every task has finished. Events are
//! handled one at a time by [`Executer::handle`]; collaborators answer by
//! posting into the inbox the executer was created with.

mod strategy;

pub use strategy::{DataStrategy, ExecutionStrategy, ScanStrategy};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use quarry_common::{
    ActorId, ComputeStatus, Counter, Issues, NodeId, ShardId, StatusCode, TaskId, TxId,
};
use quarry_graph::{PhysicalTx, TasksGraph};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::admission::ResourcesSnapshot;
use crate::builder::{add_stages, shards_to_resolve, BuildContext, StagePredictor, TasksBuilder};
use crate::channels::{collect_task_updates, ChannelUpdates, ChannelsPropagator};
use crate::config::ExecuterSettings;
use crate::error::ExecuterError;
use crate::messages::{
    AbortExecution, ChannelData, ComputeActorState, ComputeState, EventSender, ExecuterEvent,
    NotStartedReason, RateLimiterPath, SecretsSnapshot, StartTasksResponse, TxRequest,
    UndeliveredReason,
};
use crate::planner::{validate_task_sizes, FinishOutcome, Planner};
use crate::resolver::{ShardsResolveStatus, TableResolveStatus};
use crate::resource_usage::ResourceUsageTracker;
use crate::results::{DataOutcome, ResultAggregator, StreamBatch, TxResult};
use crate::services::ExecuterServices;
use crate::stats::{QueryExecutionStats, TaskStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    Tables,
    Shards,
    Secrets,
    Resources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuterState {
    Ready,
    WaitResolve(WaitPhase),
    Execute,
    /// Teardown is done but the table resolver was still running; waits
    /// for its own poison before terminating.
    Zombie,
    Terminated,
}

#[derive(Debug)]
pub struct TxResponse {
    pub tx_id: TxId,
    pub status: StatusCode,
    pub issues: Issues,
    pub results: Vec<TxResult>,
    pub stats: Option<QueryExecutionStats>,
}

/// The single terminal message the caller receives.
#[derive(Debug)]
pub enum ExecuterReply {
    Response(TxResponse),
    /// Execution stopped for a reason the caller did not initiate.
    Aborted { status: StatusCode, issues: Issues },
}

impl ExecuterReply {
    pub fn status(&self) -> StatusCode {
        match self {
            ExecuterReply::Response(response) => response.status,
            ExecuterReply::Aborted { status, .. } => *status,
        }
    }

    pub fn issues(&self) -> &Issues {
        match self {
            ExecuterReply::Response(response) => &response.issues,
            ExecuterReply::Aborted { issues, .. } => issues,
        }
    }
}

pub type ReplySender = oneshot::Sender<ExecuterReply>;

struct RequestContext {
    tx_id: TxId,
    caller: ActorId,
    transactions: Vec<PhysicalTx>,
    rate_limiter: Option<RateLimiterPath>,
    trace_id: String,
    user_sid: Option<String>,
    result_stream: Option<UnboundedSender<StreamBatch>>,
}

pub struct Executer {
    id: ActorId,
    settings: ExecuterSettings,
    services: ExecuterServices,
    strategy: Box<dyn ExecutionStrategy>,
    inbox: EventSender,
    reply: Option<ReplySender>,
    state: ExecuterState,
    request: Option<RequestContext>,
    graph: TasksGraph,
    planner: Option<Planner>,
    propagator: ChannelsPropagator,
    results: ResultAggregator,
    stats: QueryExecutionStats,
    shard_nodes: BTreeMap<ShardId, NodeId>,
    secret_names: BTreeSet<String>,
    secrets: BTreeMap<String, String>,
    secrets_snapshot_received: bool,
    secrets_subscription: Option<u64>,
    resources: ResourcesSnapshot,
    table_resolver: Option<ActorId>,
    shards_resolver: Option<ActorId>,
    aborted_actors: BTreeSet<ActorId>,
    usage: ResourceUsageTracker,
    next_local_id: u64,
}

impl Executer {
    pub fn new(
        id: ActorId,
        settings: ExecuterSettings,
        services: ExecuterServices,
        strategy: Box<dyn ExecutionStrategy>,
        inbox: EventSender,
        reply: ReplySender,
    ) -> Self {
        let usage = ResourceUsageTracker::new(
            settings.resource_usage_update_interval(),
            settings.ru_report_threshold,
        );
        Self {
            id,
            settings,
            services,
            strategy,
            inbox,
            reply: Some(reply),
            state: ExecuterState::Ready,
            request: None,
            graph: TasksGraph::new(),
            planner: None,
            propagator: ChannelsPropagator::new(),
            results: ResultAggregator::default(),
            stats: QueryExecutionStats::default(),
            shard_nodes: BTreeMap::new(),
            secret_names: BTreeSet::new(),
            secrets: BTreeMap::new(),
            secrets_snapshot_received: false,
            secrets_subscription: None,
            resources: ResourcesSnapshot::default(),
            table_resolver: None,
            shards_resolver: None,
            aborted_actors: BTreeSet::new(),
            usage,
            next_local_id: id.local + 1,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn state(&self) -> ExecuterState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ExecuterState::Terminated
    }

    pub fn graph(&self) -> &TasksGraph {
        &self.graph
    }

    pub fn planner(&self) -> Option<&Planner> {
        self.planner.as_ref()
    }

    pub fn stats(&self) -> &QueryExecutionStats {
        &self.stats
    }

    fn tx_id(&self) -> TxId {
        self.request.as_ref().map(|r| r.tx_id).unwrap_or_default()
    }

    fn next_actor_id(&mut self) -> ActorId {
        let id = ActorId::new(self.id.node_id(), self.next_local_id);
        self.next_local_id += 1;
        id
    }

    /// Processes one inbox event.
    pub fn handle(&mut self, event: ExecuterEvent) {
        let started = Instant::now();
        trace!(executer = %self.id, state = ?self.state, event = event.name(), "executer event");
        let result = match self.state {
            ExecuterState::Ready => self.handle_ready(event),
            ExecuterState::WaitResolve(phase) => self.handle_wait_resolve(phase, event),
            ExecuterState::Execute => self.handle_execute(event),
            ExecuterState::Zombie => {
                self.handle_zombie(event);
                Ok(())
            }
            ExecuterState::Terminated => {
                debug!(executer = %self.id, event = event.name(), "event after termination dropped");
                Ok(())
            }
        };
        self.stats.executer_cpu_time += started.elapsed();
        if let Err(err) = result {
            self.reply_error(err);
        }
    }

    fn unexpected(&self, event: &ExecuterEvent) -> ExecuterError {
        error!(
            executer = %self.id,
            tx_id = %self.tx_id(),
            state = ?self.state,
            event = event.name(),
            "unexpected event"
        );
        ExecuterError::internal(format!(
            "Unexpected event {} in state {:?}",
            event.name(),
            self.state
        ))
    }

    fn handle_ready(&mut self, event: ExecuterEvent) -> Result<(), ExecuterError> {
        match event {
            ExecuterEvent::TxRequest(request) => self.bootstrap(*request),
            ExecuterEvent::Abort(abort) => {
                self.handle_abort(abort);
                Ok(())
            }
            ExecuterEvent::Poison => {
                self.terminate(
                    ExecuterReply::Aborted {
                        status: StatusCode::Cancelled,
                        issues: Issues::from_message("Executer poisoned"),
                    },
                    ComputeStatus::Cancelled,
                );
                Ok(())
            }
            other => Err(self.unexpected(&other)),
        }
    }

    fn bootstrap(&mut self, request: TxRequest) -> Result<(), ExecuterError> {
        debug!(executer = %self.id, request = %request.debug_string(), "executer bootstrap");
        let TxRequest {
            tx_id,
            caller,
            transactions,
            snapshot,
            database,
            user_sid,
            lock_tx_id,
            timeout,
            cancel_after,
            rate_limiter,
            trace_id,
            result_stream,
        } = request;
        let trace_id = trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let meta = self.graph.meta_mut();
        meta.tx_id = Some(tx_id);
        meta.executer = Some(self.id);
        meta.snapshot = snapshot;
        meta.database = database;
        meta.lock_tx_id = match lock_tx_id {
            Some(0) => Some(tx_id.0),
            other => other,
        };
        meta.channel_transport_version = self.settings.channel_transport_version;
        meta.trace_id = Some(trace_id.clone());
        meta.user_sid = user_sid.clone();

        self.results = ResultAggregator::new(
            transactions
                .iter()
                .flat_map(|tx| tx.results.iter())
                .map(|spec| TxResult {
                    column_order: spec.column_order.clone(),
                    is_stream: spec.is_stream,
                    query_result_index: spec.query_result_index,
                    ..Default::default()
                })
                .collect(),
        );
        self.stats.start();
        self.request = Some(RequestContext {
            tx_id,
            caller,
            transactions,
            rate_limiter,
            trace_id,
            user_sid,
            result_stream,
        });

        if let Some(timeout) = timeout {
            self.services
                .timer
                .schedule(timeout, ExecuterEvent::Deadline, self.inbox.clone());
        }
        if let Some(cancel_after) = cancel_after {
            self.services
                .timer
                .schedule(cancel_after, ExecuterEvent::CancelAfter, self.inbox.clone());
        }

        let transactions = match &self.request {
            Some(request) => &request.transactions,
            None => return Err(ExecuterError::internal("request context is missing")),
        };
        add_stages(&mut self.graph, transactions)?;
        let resolver =
            self.services
                .table_resolver
                .resolve_tables(tx_id, transactions, self.inbox.clone());
        self.table_resolver = Some(resolver);
        self.state = ExecuterState::WaitResolve(WaitPhase::Tables);
        trace!(executer = %self.id, %tx_id, resolver = %resolver, "waiting for table resolve");
        Ok(())
    }

    /// Handles what any live state must handle. Returns the event back
    /// when it is state specific.
    fn handle_common(&mut self, event: ExecuterEvent) -> Option<ExecuterEvent> {
        match event {
            ExecuterEvent::Abort(abort) => {
                self.handle_abort(abort);
                None
            }
            ExecuterEvent::Deadline => {
                warn!(executer = %self.id, tx_id = %self.tx_id(), "request deadline exceeded");
                self.terminate(
                    ExecuterReply::Aborted {
                        status: StatusCode::Timeout,
                        issues: Issues::from_message("Request timeout exceeded"),
                    },
                    ComputeStatus::Timeout,
                );
                None
            }
            ExecuterEvent::CancelAfter => {
                warn!(executer = %self.id, tx_id = %self.tx_id(), "request cancelled after timeout");
                self.terminate(
                    ExecuterReply::Aborted {
                        status: StatusCode::Cancelled,
                        issues: Issues::from_message("Request timeout exceeded, cancelling after"),
                    },
                    ComputeStatus::Timeout,
                );
                None
            }
            ExecuterEvent::Poison => {
                self.terminate(
                    ExecuterReply::Aborted {
                        status: StatusCode::Cancelled,
                        issues: Issues::from_message("Executer poisoned"),
                    },
                    ComputeStatus::Cancelled,
                );
                None
            }
            ExecuterEvent::SecretsSnapshot(_) | ExecuterEvent::SecretsWaitExpired
                if self.state != ExecuterState::WaitResolve(WaitPhase::Secrets) =>
            {
                trace!(executer = %self.id, "late secrets event ignored");
                None
            }
            other => Some(other),
        }
    }

    fn handle_abort(&mut self, abort: AbortExecution) {
        let AbortExecution {
            sender,
            status,
            issues,
        } = abort;
        info!(
            executer = %self.id,
            tx_id = %self.tx_id(),
            %sender,
            %status,
            issues = %issues.to_one_line_string(),
            "abort execution"
        );
        match status {
            StatusCode::Timeout => {
                let from_caller = self.request.as_ref().is_some_and(|r| r.caller == sender);
                let reply = if from_caller {
                    ExecuterReply::Response(self.error_response(StatusCode::Timeout, issues))
                } else {
                    ExecuterReply::Aborted {
                        status: StatusCode::Timeout,
                        issues,
                    }
                };
                self.terminate(reply, ComputeStatus::Timeout);
            }
            status => self.reply_error(ExecuterError::failed(status, issues)),
        }
    }

    fn handle_wait_resolve(&mut self, phase: WaitPhase, event: ExecuterEvent) -> Result<(), ExecuterError> {
        let Some(event) = self.handle_common(event) else {
            return Ok(());
        };
        match (phase, event) {
            (WaitPhase::Tables, ExecuterEvent::TablesResolved(status)) => self.on_tables_resolved(status),
            (WaitPhase::Shards, ExecuterEvent::ShardsResolved(status)) => self.on_shards_resolved(status),
            (WaitPhase::Secrets, ExecuterEvent::SecretsSnapshot(snapshot)) => self.on_secrets_snapshot(snapshot),
            (WaitPhase::Secrets, ExecuterEvent::SecretsWaitExpired) => self.on_secrets_wait_expired(),
            (WaitPhase::Resources, ExecuterEvent::ResourcesSnapshot(nodes)) => {
                self.resources = ResourcesSnapshot::new(nodes);
                debug!(executer = %self.id, nodes = self.resources.len(), "resources snapshot received");
                self.build_and_execute()
            }
            (_, ExecuterEvent::NodeDisconnected { node }) => {
                trace!(executer = %self.id, node_id = %node, "disconnect before dispatch ignored");
                Ok(())
            }
            (_, other) => Err(self.unexpected(&other)),
        }
    }

    fn on_tables_resolved(&mut self, status: TableResolveStatus) -> Result<(), ExecuterError> {
        self.table_resolver = None;
        if !status.status.is_success() {
            warn!(
                executer = %self.id,
                status = %status.status,
                issues = %status.issues.to_one_line_string(),
                "table resolve failed"
            );
            return Err(ExecuterError::failed(status.status, status.issues));
        }
        let tables = &mut self.graph.meta_mut().tables;
        for table in status.tables {
            tables.insert(table.id, Arc::new(table));
        }

        let shards = shards_to_resolve(&self.graph, self.services.partition_pruner.as_ref())?;
        if shards.is_empty() {
            return self.after_shards_resolved();
        }
        debug!(executer = %self.id, shards = shards.len(), "resolving shards");
        let resolver = self
            .services
            .shards_resolver
            .resolve_shards(self.tx_id(), shards, self.inbox.clone());
        self.shards_resolver = Some(resolver);
        self.state = ExecuterState::WaitResolve(WaitPhase::Shards);
        Ok(())
    }

    fn on_shards_resolved(&mut self, status: ShardsResolveStatus) -> Result<(), ExecuterError> {
        self.shards_resolver = None;
        if !status.status.is_success() {
            return Err(ExecuterError::failed(status.status, status.issues));
        }
        if status.unresolved > 0 {
            return Err(ExecuterError::Unavailable(format!(
                "Failed to resolve {} shards",
                status.unresolved
            )));
        }
        self.shard_nodes = status.shard_nodes;
        self.after_shards_resolved()
    }

    fn after_shards_resolved(&mut self) -> Result<(), ExecuterError> {
        self.secret_names = self
            .graph
            .stages()
            .flat_map(|stage| stage.plan.secret_names())
            .collect();
        if self.secret_names.is_empty() {
            return self.after_secrets_resolved();
        }

        let names: Vec<String> = self.secret_names.iter().cloned().collect();
        let user_sid = self.request.as_ref().and_then(|r| r.user_sid.as_deref());
        let subscription = self.services.secrets.subscribe(user_sid, &names, self.inbox.clone());
        self.secrets_subscription = Some(subscription);
        self.services.timer.schedule(
            self.settings.max_secrets_snapshot_wait(),
            ExecuterEvent::SecretsWaitExpired,
            self.inbox.clone(),
        );
        self.state = ExecuterState::WaitResolve(WaitPhase::Secrets);
        debug!(executer = %self.id, secrets = names.len(), "waiting for secrets");
        Ok(())
    }

    fn on_secrets_snapshot(&mut self, snapshot: SecretsSnapshot) -> Result<(), ExecuterError> {
        self.secrets_snapshot_received = true;
        self.secrets.extend(snapshot.secrets);
        if self.secret_names.iter().all(|name| self.secrets.contains_key(name)) {
            self.unsubscribe_secrets();
            return self.after_secrets_resolved();
        }
        trace!(executer = %self.id, known = self.secrets.len(), "partial secrets snapshot");
        Ok(())
    }

    fn on_secrets_wait_expired(&mut self) -> Result<(), ExecuterError> {
        self.unsubscribe_secrets();
        if !self.secrets_snapshot_received {
            return Err(ExecuterError::internal(format!(
                "Secrets snapshot was not received in {:?}",
                self.settings.max_secrets_snapshot_wait()
            )));
        }
        warn!(executer = %self.id, "secrets wait expired, using the snapshot at hand");
        self.after_secrets_resolved()
    }

    fn unsubscribe_secrets(&mut self) {
        if let Some(subscription) = self.secrets_subscription.take() {
            self.services.secrets.unsubscribe(subscription);
        }
    }

    fn after_secrets_resolved(&mut self) -> Result<(), ExecuterError> {
        if self.strategy.needs_resources_snapshot(&self.graph) {
            self.services
                .resource_manager
                .request_cluster_resources(self.inbox.clone());
            self.state = ExecuterState::WaitResolve(WaitPhase::Resources);
            return Ok(());
        }
        self.build_and_execute()
    }

    fn build_and_execute(&mut self) -> Result<(), ExecuterError> {
        let (tx_id, transactions, trace_id, stream) = match self.request.as_mut() {
            Some(request) => (
                request.tx_id,
                std::mem::take(&mut request.transactions),
                request.trace_id.clone(),
                request.result_stream.clone(),
            ),
            None => return Err(ExecuterError::internal("request context is missing")),
        };

        let stage_ids = self.graph.stage_ids();
        {
            let ctx = BuildContext {
                settings: &self.settings,
                pruner: self.services.partition_pruner.as_ref(),
                shard_nodes: &self.shard_nodes,
                snapshot: &self.resources,
                secrets: &self.secrets,
                executer: self.id,
                predictor: StagePredictor,
            };
            let mut builder = TasksBuilder::new(&mut self.graph, ctx, &mut self.stats);
            for stage in stage_ids {
                self.strategy.build_tasks_for_stage(&mut builder, stage)?;
                builder.build_sinks(stage, Some(&trace_id))?;
            }
            let mut result_offset = 0;
            for (tx_index, tx) in transactions.iter().enumerate() {
                builder.build_channels(tx_index as u32, tx, result_offset)?;
                result_offset += tx.results.len();
            }
        }
        self.graph.validate()?;

        let result_channels: Vec<_> = self
            .graph
            .channels()
            .iter()
            .filter(|channel| channel.is_result())
            .map(|channel| (channel.id, channel.dst_input_index))
            .collect();
        for (channel, result_index) in result_channels {
            let proxy = self.next_actor_id();
            self.graph.meta_mut().result_channel_proxies.insert(channel, proxy);
            self.results.bind(channel, proxy, result_index, stream.clone());
        }

        validate_task_sizes(&self.graph, self.settings.max_task_size_bytes)?;

        let mut planner = Planner::new(
            &mut self.graph,
            &self.resources,
            self.id.node_id(),
            self.id,
            tx_id,
            self.settings.retries.clone(),
        )?;
        self.state = ExecuterState::Execute;
        let sent = planner.send_all(&self.graph, self.services.transport.as_ref(), &self.inbox)?;
        debug!(
            executer = %self.id,
            %tx_id,
            strategy = self.strategy.name(),
            tasks = self.graph.tasks().len(),
            channels = self.graph.channels().len(),
            nodes = planner.nodes().len(),
            sent,
            "tasks dispatched"
        );
        self.planner = Some(planner);
        self.check_execution_complete()
    }

    fn handle_execute(&mut self, event: ExecuterEvent) -> Result<(), ExecuterError> {
        let Some(event) = self.handle_common(event) else {
            return Ok(());
        };
        match event {
            ExecuterEvent::StartTasksResponse(response) => self.on_start_tasks_response(response),
            ExecuterEvent::ComputeState(state) => self.on_compute_state(state),
            ExecuterEvent::Undelivered { node, reason } => self.on_undelivered(node, reason),
            ExecuterEvent::Retry { node } => self.on_retry(node),
            ExecuterEvent::NodeDisconnected { node } => self.on_node_disconnected(node),
            ExecuterEvent::ChannelData(data) => self.on_channel_data(data),
            other => Err(self.unexpected(&other)),
        }
    }

    fn planner_mut(&mut self) -> Result<&mut Planner, ExecuterError> {
        self.planner
            .as_mut()
            .ok_or_else(|| ExecuterError::internal("planner is not created"))
    }

    fn on_start_tasks_response(&mut self, response: StartTasksResponse) -> Result<(), ExecuterError> {
        if response.tx_id != self.tx_id() {
            error!(
                executer = %self.id,
                tx_id = %self.tx_id(),
                response_tx_id = %response.tx_id,
                node_id = %response.node,
                "start tasks response for another transaction"
            );
            return Err(self.unexpected(&ExecuterEvent::StartTasksResponse(response)));
        }
        if let Some(not_started) = response.not_started.first() {
            warn!(
                executer = %self.id,
                node_id = %response.node,
                task_id = %not_started.task_id,
                reason = ?not_started.reason,
                message = %not_started.message,
                "task was not started"
            );
            return Err(match not_started.reason {
                NotStartedReason::NotEnoughMemory | NotStartedReason::NotEnoughExecutionUnits => {
                    ExecuterError::Overloaded {
                        message: format!("Not enough resources to execute query: {}", not_started.message),
                    }
                }
                NotStartedReason::QueryMemoryLimitExceeded => ExecuterError::PreconditionFailed {
                    message: format!("Memory limit exceeded for query: {}", not_started.message),
                },
                NotStartedReason::QueryExecutionUnitsLimitExceeded => ExecuterError::Overloaded {
                    message: "Not enough computation units to execute query".to_string(),
                },
                NotStartedReason::InternalError => ExecuterError::internal("Compute node internal error"),
            });
        }

        for started in response.started {
            self.on_task_started(started.task_id, started.actor, None)?;
        }
        Ok(())
    }

    fn on_task_started(
        &mut self,
        task_id: TaskId,
        actor: ActorId,
        stats: Option<&TaskStats>,
    ) -> Result<(), ExecuterError> {
        if !self.planner_mut()?.task_started(task_id, actor, stats) {
            trace!(executer = %self.id, %task_id, %actor, "task is not pending, start ignored");
            return Ok(());
        }
        self.graph.task_mut(task_id)?.compute_actor = Some(actor);
        self.services.counters.inc(Counter::TasksStarted);

        let tx_id = self.tx_id();
        let mut updates = ChannelUpdates::new();
        collect_task_updates(&self.graph, task_id, &mut updates)?;
        let sent = self.propagator.propagate(
            &self.graph,
            tx_id,
            updates,
            self.services.transport.as_ref(),
        )?;
        self.services.counters.add(Counter::ChannelUpdatesSent, sent as u64);
        Ok(())
    }

    fn on_compute_state(&mut self, state: ComputeActorState) -> Result<(), ExecuterError> {
        let ComputeActorState {
            actor,
            task_id,
            state,
            status,
            issues,
            stats,
            extra_data,
        } = state;
        trace!(executer = %self.id, %actor, %task_id, ?state, "compute actor state");

        match state {
            ComputeState::Unknown => Err(ExecuterError::internal(format!(
                "Unexpected state from compute actor {}, task {}",
                actor, task_id
            ))),
            ComputeState::Failure => {
                self.aborted_actors.insert(actor);
                Err(ExecuterError::failed(status.to_status(), issues))
            }
            ComputeState::Executing => {
                let planner = self.planner_mut()?;
                if planner.pending_compute_actors().contains_key(&actor) {
                    if let Some(stats) = &stats {
                        planner.update_actor_stats(actor, stats);
                    }
                } else if planner.pending_compute_tasks().contains(&task_id) {
                    self.on_task_started(task_id, actor, stats.as_ref())?;
                } else {
                    warn!(executer = %self.id, %actor, %task_id, "executing report for unknown actor");
                }
                self.update_resource_usage(false);
                Ok(())
            }
            ComputeState::Finished => {
                if let Some(stats) = &stats {
                    self.stats.add_compute_actor_stats(actor, stats.clone());
                }
                if let Some(extra) = extra_data {
                    self.stats.add_extra_data(actor, extra);
                }
                match self.planner_mut()?.task_finished(actor, task_id, stats.as_ref()) {
                    FinishOutcome::ActorFinished => {
                        trace!(executer = %self.id, %actor, %task_id, "compute actor finished")
                    }
                    FinishOutcome::TaskFinished => {
                        debug!(executer = %self.id, %actor, %task_id, "task finished before its start was acknowledged")
                    }
                    FinishOutcome::Unknown => {
                        warn!(executer = %self.id, %actor, %task_id, "finish report for unknown actor")
                    }
                }
                self.update_resource_usage(false);
                self.check_execution_complete()
            }
        }
    }

    fn on_undelivered(&mut self, node: NodeId, reason: UndeliveredReason) -> Result<(), ExecuterError> {
        if reason == UndeliveredReason::ActorUnknown {
            let delay = self.planner_mut()?.current_retry_delay(node);
            debug!(executer = %self.id, node_id = %node, ?delay, "start tasks request undelivered, scheduling retry");
            self.services
                .timer
                .schedule(delay, ExecuterEvent::Retry { node }, self.inbox.clone());
            return Ok(());
        }
        self.invalidate_node(node);
        Err(ExecuterError::internal(format!(
            "Start tasks request to {} lost: {}",
            node, reason
        )))
    }

    fn on_retry(&mut self, node: NodeId) -> Result<(), ExecuterError> {
        let Some(planner) = self.planner.as_mut() else {
            return Err(ExecuterError::internal("planner is not created"));
        };
        let resent = planner.resend_start_tasks_request(
            &self.graph,
            node,
            self.services.transport.as_ref(),
            &self.inbox,
        )?;
        if resent {
            self.services.counters.inc(Counter::StartRetries);
            return Ok(());
        }
        let retries = planner.retries(node);
        self.invalidate_node(node);
        Err(ExecuterError::internal(format!(
            "Failed to deliver start tasks request to {} after {} retries",
            node, retries
        )))
    }

    /// Forces pipe reconnects for every shard hosted on `node`.
    fn invalidate_node(&self, node: NodeId) {
        for (shard, owner) in &self.shard_nodes {
            if *owner == node {
                self.services.pipe_cache.force_reconnect(*shard);
            }
        }
    }

    fn on_node_disconnected(&mut self, node: NodeId) -> Result<(), ExecuterError> {
        let has_work = match &self.planner {
            Some(planner) => planner.has_work_on(&self.graph, node),
            None => false,
        };
        if !has_work {
            debug!(executer = %self.id, node_id = %node, "disconnected node runs nothing of this query");
            return Ok(());
        }
        Err(ExecuterError::Unavailable(format!(
            "Connection with node {} lost.",
            node.0
        )))
    }

    fn on_channel_data(&mut self, data: ChannelData) -> Result<(), ExecuterError> {
        let (outcome, ack) = self.results.on_data(data);
        if let Some(ack) = ack {
            self.services.transport.ack_channel_data(ack);
        }
        match outcome {
            DataOutcome::Accepted { rows } => {
                self.services.counters.inc(Counter::ResultBatches);
                trace!(executer = %self.id, rows, "result batch accepted");
                Ok(())
            }
            DataOutcome::Duplicate | DataOutcome::UnknownChannel => Ok(()),
            DataOutcome::StreamClosed => Err(ExecuterError::failed(
                StatusCode::Cancelled,
                Issues::from_message("Result stream was closed by the caller"),
            )),
        }
    }

    fn update_resource_usage(&mut self, force: bool) {
        let now = self.services.clock.now();
        if !self.usage.begin(now, force) {
            return;
        }
        let Some(planner) = self.planner.as_mut() else {
            return;
        };
        let consumption = planner.unbilled_usage();
        let Some(ru) = self.usage.bill(&consumption, force) else {
            return;
        };
        planner.mark_billed();
        self.services.counters.add(Counter::RequestUnits, ru);
        if let Some(path) = self.request.as_ref().and_then(|r| r.rate_limiter.as_ref()) {
            let reporter = self.services.rate_limiter.report_resource_usage(ru, path);
            trace!(executer = %self.id, ru, %reporter, "resource usage reported");
        }
    }

    fn check_execution_complete(&mut self) -> Result<(), ExecuterError> {
        match &self.planner {
            Some(planner) if planner.is_complete() => {}
            _ => return Ok(()),
        }
        self.update_resource_usage(true);
        self.stats.finish();
        let results = std::mem::take(&mut self.results).into_results();
        let response = TxResponse {
            tx_id: self.tx_id(),
            status: StatusCode::Success,
            issues: Issues::new(),
            results,
            stats: Some(self.stats.clone()),
        };
        info!(
            executer = %self.id,
            tx_id = %response.tx_id,
            compute_actors = self.stats.compute_actors.len(),
            result_rows = self.stats.result_rows,
            "execution completed"
        );
        self.send_reply(ExecuterReply::Response(response));
        self.pass_away();
        Ok(())
    }

    fn error_response(&self, status: StatusCode, issues: Issues) -> TxResponse {
        TxResponse {
            tx_id: self.tx_id(),
            status,
            issues,
            results: Vec::new(),
            stats: Some(self.stats.clone()),
        }
    }

    fn reply_error(&mut self, err: ExecuterError) {
        let status = err.status();
        let issues = err.issues();
        error!(
            executer = %self.id,
            tx_id = %self.tx_id(),
            %status,
            issues = %issues.to_one_line_string(),
            "execution failed"
        );
        if matches!(self.state, ExecuterState::Zombie | ExecuterState::Terminated) {
            return;
        }
        let response = self.error_response(status, issues);
        self.terminate(ExecuterReply::Response(response), ComputeStatus::from_status(status));
    }

    /// Aborts live compute actors, replies and tears down.
    fn terminate(&mut self, reply: ExecuterReply, actor_status: ComputeStatus) {
        let issues = reply.issues().clone();
        self.abort_compute_actors(actor_status, &issues);
        self.stats.finish();
        self.send_reply(reply);
        self.pass_away();
    }

    fn abort_compute_actors(&mut self, status: ComputeStatus, issues: &Issues) {
        let Some(planner) = &self.planner else {
            return;
        };
        for actor in planner.pending_actor_ids() {
            if !self.aborted_actors.insert(actor) {
                continue;
            }
            info!(executer = %self.id, %actor, ?status, "aborting compute actor");
            self.services
                .transport
                .abort_compute_actor(actor, status, issues.clone());
            self.services.counters.inc(Counter::ComputeActorsAborted);
        }
    }

    fn send_reply(&mut self, reply: ExecuterReply) {
        let Some(sender) = self.reply.take() else {
            warn!(executer = %self.id, status = %reply.status(), "reply already sent");
            return;
        };
        self.strategy.on_complete(&self.services.counters, reply.status());
        if sender.send(reply).is_err() {
            warn!(executer = %self.id, "caller is gone, reply dropped");
        }
    }

    fn pass_away(&mut self) {
        self.unsubscribe_secrets();
        self.results = ResultAggregator::default();
        if let Some(request) = self.request.as_mut() {
            request.result_stream = None;
        }
        if let Some(resolver) = self.shards_resolver.take() {
            self.services.shards_resolver.cancel(resolver);
        }
        if let Some(planner) = &self.planner {
            planner.unsubscribe(self.services.transport.as_ref());
        }

        match self.table_resolver.take() {
            Some(resolver) => {
                self.services.table_resolver.cancel(resolver);
                if self.inbox.send(ExecuterEvent::Poison).is_err() {
                    self.state = ExecuterState::Terminated;
                    return;
                }
                self.state = ExecuterState::Zombie;
                trace!(executer = %self.id, %resolver, "waiting for table resolver teardown");
            }
            None => {
                self.state = ExecuterState::Terminated;
                trace!(executer = %self.id, "executer terminated");
            }
        }
    }

    fn handle_zombie(&mut self, event: ExecuterEvent) {
        match event {
            ExecuterEvent::Poison => {
                self.state = ExecuterState::Terminated;
                trace!(executer = %self.id, "executer terminated");
            }
            other => trace!(executer = %self.id, event = other.name(), "zombie drops event"),
        }
    }
}
