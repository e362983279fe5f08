use std::collections::BTreeMap;
use std::sync::Arc;

use quarry_common::{ActorId, ChannelId, NodeId, ShardId, StageId, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};
use crate::key::KeyRange;
use crate::plan::{Connection, ReadType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    #[default]
    Compute,
    Scan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadInfo {
    pub items_limit: u64,
    pub reverse: bool,
    pub sorted: bool,
    pub read_type: ReadType,
    pub olap_program: Option<Vec<u8>>,
}

impl Default for ReadInfo {
    fn default() -> Self {
        Self {
            items_limit: 0,
            reverse: false,
            sorted: false,
            read_type: ReadType::Rows,
            olap_program: None,
        }
    }
}

/// Key ranges one task reads from one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReadInfo {
    pub shard_id: ShardId,
    pub ranges: Vec<KeyRange>,
    pub columns: Vec<String>,
}

/// Per-task metadata shipped to the compute actor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_type: TaskType,
    pub executer: Option<ActorId>,
    pub reads: Vec<ShardReadInfo>,
    pub read_info: ReadInfo,
    /// Opaque partition parameters for external sources.
    pub read_ranges: Vec<String>,
    pub secure_params: BTreeMap<String, String>,
    pub task_params: BTreeMap<String, String>,
    pub enable_shards_sequential_scan: bool,
    pub max_in_flight_shards: Option<u32>,
}

impl TaskMeta {
    pub fn with_type(task_type: TaskType) -> Self {
        Self {
            task_type,
            ..Default::default()
        }
    }

    /// Orders reads by the right border of their last range so a
    /// sequential scan emits rows in key order.
    pub fn sort_reads_by_right_border(&mut self) {
        self.reads.sort_by(|a, b| {
            let a = a.ranges.last().map(|r| r.right_border());
            let b = b.ranges.last().map(|r| r.right_border());
            a.cmp(&b)
        });
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.reads.iter().map(|read| read.shard_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskInputKind {
    Undefined,
    Channels(Connection),
    Source {
        source_type: String,
        settings: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub kind: TaskInputKind,
    pub channels: Vec<ChannelId>,
}

impl Default for TaskInput {
    fn default() -> Self {
        Self {
            kind: TaskInputKind::Undefined,
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutputKind {
    Undefined,
    Map,
    HashPartition {
        key_columns: Vec<String>,
        partitions_count: usize,
    },
    Broadcast,
    Sink {
        sink_type: String,
        settings: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub kind: TaskOutputKind,
    pub channels: Vec<ChannelId>,
}

impl Default for TaskOutput {
    fn default() -> Self {
        Self {
            kind: TaskOutputKind::Undefined,
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub stage_id: StageId,
    pub node_id: Option<NodeId>,
    pub shard_id: Option<ShardId>,
    meta: Arc<TaskMeta>,
    meta_glueing_id: Option<u32>,
    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<TaskOutput>,
    pub compute_actor: Option<ActorId>,
}

impl Task {
    pub(crate) fn new(id: TaskId, stage_id: StageId, inputs: usize, outputs: usize) -> Self {
        Self {
            id,
            stage_id,
            node_id: None,
            shard_id: None,
            meta: Arc::new(TaskMeta::default()),
            meta_glueing_id: None,
            inputs: vec![TaskInput::default(); inputs],
            outputs: vec![TaskOutput::default(); outputs],
            compute_actor: None,
        }
    }

    pub fn meta(&self) -> &TaskMeta {
        &self.meta
    }

    pub fn shared_meta(&self) -> Arc<TaskMeta> {
        self.meta.clone()
    }

    pub fn meta_glueing_id(&self) -> Option<u32> {
        self.meta_glueing_id
    }

    /// Mutable access to a task-private meta. Glued metas are frozen.
    pub fn meta_mut(&mut self) -> GraphResult<&mut TaskMeta> {
        if self.meta_glueing_id.is_some() {
            return Err(GraphError::GluedMetaMutation(self.id));
        }
        Ok(Arc::make_mut(&mut self.meta))
    }

    /// Attaches a meta shared with every other task of the same glue group.
    pub fn set_glued_meta(&mut self, meta: Arc<TaskMeta>, glueing_id: u32) {
        self.meta = meta;
        self.meta_glueing_id = Some(glueing_id);
    }
}

/// Directed data edge between task ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub src_task: TaskId,
    pub src_output_index: usize,
    /// `None` when the channel feeds a result proxy.
    pub dst_task: Option<TaskId>,
    /// Destination input port, or the result index for result channels.
    pub dst_input_index: usize,
    pub in_memory: bool,
}

impl Channel {
    pub fn is_result(&self) -> bool {
        self.dst_task.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glued_meta_is_frozen() {
        let mut task = Task::new(TaskId(1), StageId::new(0, 0), 0, 1);
        task.meta_mut().unwrap().task_type = TaskType::Scan;

        let shared = Arc::new(TaskMeta::with_type(TaskType::Scan));
        task.set_glued_meta(shared.clone(), 1);
        assert!(matches!(task.meta_mut(), Err(GraphError::GluedMetaMutation(TaskId(1)))));
        assert!(Arc::ptr_eq(&task.shared_meta(), &shared));
    }

    #[test]
    fn reads_sort_by_right_border() {
        let read = |shard: u64, to: Option<&[u8]>| ShardReadInfo {
            shard_id: ShardId(shard),
            ranges: vec![KeyRange::new(vec![], true, to.map(|t| t.to_vec()), false)],
            columns: vec![],
        };
        let mut meta = TaskMeta::default();
        meta.reads = vec![read(3, None), read(1, Some(&b"m"[..])), read(2, Some(&b"t"[..]))];
        meta.sort_reads_by_right_border();
        let order: Vec<u64> = meta.shard_ids().map(|s| s.0).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
