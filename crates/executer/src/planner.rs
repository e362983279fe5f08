//! Task dispatch and the pending task/actor bookkeeping.
//!
//! A task id starts in the pending-tasks set, moves to the pending-actors
//! map once its compute actor is known, and leaves that map when the
//! actor finishes. It is never in both.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use quarry_common::{ActorId, NodeId, TaskId, TxId};
use quarry_graph::{GraphResult, Task, TasksGraph};
use tracing::{debug, trace};

use crate::admission::{ResourcesSnapshot, RoundRobinPlacement};
use crate::channels::channel_desc;
use crate::config::RetrySettings;
use crate::error::ExecuterError;
use crate::messages::{EventSender, StartTasksRequest, TaskDescriptor};
use crate::services::NodeTransport;
use crate::stats::{ConsumptionEntry, ProgressStat, TaskStats};

#[derive(Debug, Clone, Default)]
pub struct PendingActor {
    pub task_id: TaskId,
    pub stat: ProgressStat,
}

struct RequestData {
    tasks: Vec<TaskId>,
    retries: u32,
    backoff: ExponentialBackoff,
    current_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The running actor finished.
    ActorFinished,
    /// The task finished before its start was acknowledged.
    TaskFinished,
    Unknown,
}

pub fn task_descriptor(graph: &TasksGraph, task: &Task) -> GraphResult<TaskDescriptor> {
    let stage = graph.stage(task.stage_id)?;
    let mut channels = Vec::new();
    for port in task.inputs.iter().map(|i| &i.channels).chain(task.outputs.iter().map(|o| &o.channels)) {
        for channel_id in port {
            channels.push(channel_desc(graph, graph.channel(*channel_id)?)?);
        }
    }
    Ok(TaskDescriptor {
        task_id: task.id,
        stage_id: task.stage_id,
        program: stage.plan.program.clone(),
        meta: task.meta().clone(),
        meta_glueing_id: task.meta_glueing_id(),
        inputs: task.inputs.clone(),
        outputs: task.outputs.clone(),
        channels,
    })
}

/// Rejects any task whose serialized descriptor exceeds `limit` bytes.
pub fn validate_task_sizes(graph: &TasksGraph, limit: usize) -> Result<(), ExecuterError> {
    for task in graph.tasks() {
        let descriptor = task_descriptor(graph, task)?;
        let size = bincode::serialized_size(&descriptor)? as usize;
        if size > limit {
            return Err(ExecuterError::TaskTooLarge {
                task: task.id,
                size,
                limit,
            });
        }
    }
    Ok(())
}

pub struct Planner {
    tx_id: TxId,
    executer: ActorId,
    retry: RetrySettings,
    pending_compute_tasks: BTreeSet<TaskId>,
    pending_compute_actors: BTreeMap<ActorId, PendingActor>,
    requests: BTreeMap<NodeId, RequestData>,
    finished_usage: Vec<ConsumptionEntry>,
}

impl Planner {
    /// Places every unpinned task and groups tasks into one start request
    /// per node.
    pub fn new(
        graph: &mut TasksGraph,
        snapshot: &ResourcesSnapshot,
        local_node: NodeId,
        executer: ActorId,
        tx_id: TxId,
        retry: RetrySettings,
    ) -> GraphResult<Self> {
        let mut placement = RoundRobinPlacement::new(snapshot, local_node);
        let mut by_node: BTreeMap<NodeId, Vec<TaskId>> = BTreeMap::new();
        let ids: Vec<TaskId> = graph.tasks().iter().map(|t| t.id).collect();
        for id in &ids {
            let task = graph.task_mut(*id)?;
            let node = match task.node_id {
                Some(node) => node,
                None => {
                    let node = placement.next_node();
                    task.node_id = Some(node);
                    node
                }
            };
            by_node.entry(node).or_default().push(*id);
        }

        let requests = by_node
            .into_iter()
            .map(|(node, tasks)| {
                let mut backoff = ExponentialBackoffBuilder::new()
                    .with_initial_interval(retry.min_delay())
                    .with_max_interval(retry.max_delay())
                    .with_multiplier(2.0)
                    .with_randomization_factor(0.0)
                    .with_max_elapsed_time(None)
                    .build();
                let current_delay = backoff.next_backoff().unwrap_or(retry.max_delay());
                (
                    node,
                    RequestData {
                        tasks,
                        retries: 0,
                        backoff,
                        current_delay,
                    },
                )
            })
            .collect();

        Ok(Self {
            tx_id,
            executer,
            retry,
            pending_compute_tasks: ids.into_iter().collect(),
            pending_compute_actors: BTreeMap::new(),
            requests,
            finished_usage: Vec::new(),
        })
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.requests.keys().copied().collect()
    }

    pub fn tasks_on(&self, node: NodeId) -> &[TaskId] {
        self.requests
            .get(&node)
            .map(|r| r.tasks.as_slice())
            .unwrap_or(&[])
    }

    fn build_request(&self, graph: &TasksGraph, node: NodeId, retry_number: u32) -> GraphResult<StartTasksRequest> {
        let mut tasks = Vec::new();
        for id in self.tasks_on(node) {
            if self.pending_compute_tasks.contains(id) {
                tasks.push(task_descriptor(graph, graph.task(*id)?)?);
            }
        }
        let meta = graph.meta();
        Ok(StartTasksRequest {
            tx_id: self.tx_id,
            executer: self.executer,
            snapshot: meta.snapshot,
            database: meta.database.clone(),
            lock_tx_id: meta.lock_tx_id,
            tasks,
            retry_number,
        })
    }

    /// Sends the first start request to every node.
    pub fn send_all(
        &mut self,
        graph: &TasksGraph,
        transport: &dyn NodeTransport,
        reply: &EventSender,
    ) -> GraphResult<usize> {
        let mut sent = 0;
        for node in self.nodes() {
            let request = self.build_request(graph, node, 0)?;
            sent += request.tasks.len();
            debug!(tx_id = %self.tx_id, node_id = %node, tasks = request.tasks.len(), "sending start tasks request");
            transport.start_tasks(node, request, reply.clone());
        }
        Ok(sent)
    }

    /// Resends the request for `node`. Returns `false` once the retry
    /// budget is spent or the node has no request.
    pub fn resend_start_tasks_request(
        &mut self,
        graph: &TasksGraph,
        node: NodeId,
        transport: &dyn NodeTransport,
        reply: &EventSender,
    ) -> GraphResult<bool> {
        let max_retry_number = self.retry.max_retry_number;
        let Some(data) = self.requests.get_mut(&node) else {
            return Ok(false);
        };
        if data.retries >= max_retry_number {
            return Ok(false);
        }
        data.retries += 1;
        data.current_delay = data.backoff.next_backoff().unwrap_or(self.retry.max_delay());
        let retry_number = data.retries;

        let request = self.build_request(graph, node, retry_number)?;
        debug!(tx_id = %self.tx_id, node_id = %node, retry_number, "resending start tasks request");
        transport.start_tasks(node, request, reply.clone());
        Ok(true)
    }

    pub fn current_retry_delay(&self, node: NodeId) -> Duration {
        self.requests
            .get(&node)
            .map_or(self.retry.min_delay(), |r| r.current_delay)
    }

    pub fn retries(&self, node: NodeId) -> u32 {
        self.requests.get(&node).map_or(0, |r| r.retries)
    }

    pub fn pending_compute_tasks(&self) -> &BTreeSet<TaskId> {
        &self.pending_compute_tasks
    }

    pub fn pending_compute_actors(&self) -> &BTreeMap<ActorId, PendingActor> {
        &self.pending_compute_actors
    }

    pub fn is_complete(&self) -> bool {
        self.pending_compute_tasks.is_empty() && self.pending_compute_actors.is_empty()
    }

    /// Moves `task` from pending tasks to pending actors. Returns `false`
    /// when the task was not pending.
    pub fn task_started(&mut self, task: TaskId, actor: ActorId, stats: Option<&TaskStats>) -> bool {
        if !self.pending_compute_tasks.remove(&task) {
            return false;
        }
        let mut stat = ProgressStat::default();
        if let Some(stats) = stats {
            stat.set(stats);
        }
        trace!(task_id = %task, %actor, "compute actor started");
        self.pending_compute_actors.insert(actor, PendingActor { task_id: task, stat });
        true
    }

    pub fn update_actor_stats(&mut self, actor: ActorId, stats: &TaskStats) -> bool {
        match self.pending_compute_actors.get_mut(&actor) {
            Some(pending) => {
                pending.stat.set(stats);
                true
            }
            None => false,
        }
    }

    /// Removes a finished task from whichever set holds it and keeps the
    /// usage it has not been billed for yet.
    pub fn task_finished(&mut self, actor: ActorId, task: TaskId, stats: Option<&TaskStats>) -> FinishOutcome {
        if let Some(mut pending) = self.pending_compute_actors.remove(&actor) {
            if let Some(stats) = stats {
                pending.stat.set(stats);
            }
            self.finished_usage.push(pending.stat.last_usage());
            return FinishOutcome::ActorFinished;
        }
        if self.pending_compute_tasks.remove(&task) {
            if let Some(stats) = stats {
                self.finished_usage.push(ConsumptionEntry::from_stats(stats));
            }
            return FinishOutcome::TaskFinished;
        }
        FinishOutcome::Unknown
    }

    /// Whether losing `node` loses work of this query.
    pub fn has_work_on(&self, graph: &TasksGraph, node: NodeId) -> bool {
        if self.pending_compute_actors.keys().any(|a| a.node_id() == node) {
            return true;
        }
        self.pending_compute_tasks.iter().any(|id| {
            graph
                .task(*id)
                .map(|t| t.node_id == Some(node))
                .unwrap_or(false)
        })
    }

    pub fn pending_actor_ids(&self) -> Vec<ActorId> {
        self.pending_compute_actors.keys().copied().collect()
    }

    /// Usage not billed yet: deltas of running actors plus whatever
    /// finished actors left behind.
    pub fn unbilled_usage(&self) -> ConsumptionEntry {
        let mut total = ConsumptionEntry::default();
        for pending in self.pending_compute_actors.values() {
            total += pending.stat.last_usage();
        }
        for usage in &self.finished_usage {
            total += *usage;
        }
        total
    }

    /// Moves every billing baseline to the current totals.
    pub fn mark_billed(&mut self) {
        for pending in self.pending_compute_actors.values_mut() {
            pending.stat.update();
        }
        self.finished_usage.clear();
    }

    pub fn unsubscribe(&self, transport: &dyn NodeTransport) {
        let nodes = self.nodes();
        if !nodes.is_empty() {
            transport.unsubscribe(&nodes);
        }
    }
}
