//! Compute actor progress and per-query execution statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, AddAssign};
use std::time::Duration;

use chrono::{DateTime, Utc};
use quarry_common::{ActorId, NodeId, ShardId, StageId, TaskId};

/// Statistics reported by one compute actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub task_id: TaskId,
    pub cpu_time_us: u64,
    pub read_rows: u64,
    pub read_bytes: u64,
    pub result_rows: u64,
    pub result_bytes: u64,
}

/// Resource consumption counted for billing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumptionEntry {
    pub cpu_time: Duration,
    pub read_rows: u64,
    pub read_bytes: u64,
}

impl ConsumptionEntry {
    pub fn from_stats(stats: &TaskStats) -> Self {
        Self {
            cpu_time: Duration::from_micros(stats.cpu_time_us),
            read_rows: stats.read_rows,
            read_bytes: stats.read_bytes,
        }
    }

    fn saturating_sub(self, other: Self) -> Self {
        Self {
            cpu_time: self.cpu_time.saturating_sub(other.cpu_time),
            read_rows: self.read_rows.saturating_sub(other.read_rows),
            read_bytes: self.read_bytes.saturating_sub(other.read_bytes),
        }
    }
}

impl Add for ConsumptionEntry {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            cpu_time: self.cpu_time + other.cpu_time,
            read_rows: self.read_rows + other.read_rows,
            read_bytes: self.read_bytes + other.read_bytes,
        }
    }
}

impl AddAssign for ConsumptionEntry {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Totals reported by a running actor and the baseline of the last bill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressStat {
    current: ConsumptionEntry,
    last: ConsumptionEntry,
}

impl ProgressStat {
    /// Replaces the totals with the latest report.
    pub fn set(&mut self, stats: &TaskStats) {
        self.current = ConsumptionEntry::from_stats(stats);
    }

    /// Consumption since the last [`ProgressStat::update`].
    pub fn last_usage(&self) -> ConsumptionEntry {
        self.current.saturating_sub(self.last)
    }

    pub fn update(&mut self) {
        self.last = self.current;
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryExecutionStats {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub affected_shards: BTreeSet<ShardId>,
    /// Shards read per node, per stage.
    pub stage_node_shards: BTreeMap<StageId, BTreeMap<NodeId, u32>>,
    pub compute_actors: Vec<TaskStats>,
    pub extra_data: BTreeMap<ActorId, Vec<u8>>,
    pub executer_cpu_time: Duration,
    pub result_rows: u64,
    pub result_bytes: u64,
    pub last_finished_task: Option<TaskId>,
    pub last_finished_actor: Option<ActorId>,
}

impl QueryExecutionStats {
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn add_node_shards_count(&mut self, stage: StageId, node: NodeId, count: u32) {
        *self
            .stage_node_shards
            .entry(stage)
            .or_default()
            .entry(node)
            .or_default() += count;
    }

    pub fn add_compute_actor_stats(&mut self, actor: ActorId, stats: TaskStats) {
        self.result_rows += stats.result_rows;
        self.result_bytes += stats.result_bytes;
        self.last_finished_task = Some(stats.task_id);
        self.last_finished_actor = Some(actor);
        self.compute_actors.push(stats);
    }

    pub fn add_extra_data(&mut self, actor: ActorId, data: Vec<u8>) {
        self.extra_data.insert(actor, data);
    }

    pub fn total_cpu_time(&self) -> Duration {
        let compute: u64 = self.compute_actors.iter().map(|s| s.cpu_time_us).sum();
        self.executer_cpu_time + Duration::from_micros(compute)
    }
}
