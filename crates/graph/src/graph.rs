//! The tasks graph: stages, tasks and channels of one execution.
//!
//! Tasks and channels are kept in dense vectors indexed by `id - 1`, so
//! lookups are O(1) and every cross reference is a plain integer id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use quarry_common::{ActorId, ChannelId, StageId, TableId, TaskId, TxId};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{GraphError, GraphResult};
use crate::plan::PhysicalStage;
use crate::table::TableInfo;
use crate::task::{Channel, Task};

/// MVCC read point shared by every task of the execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub step: u64,
    pub tx_id: u64,
}

impl Snapshot {
    pub fn new(step: u64, tx_id: u64) -> Self {
        Self { step, tx_id }
    }

    pub fn is_valid(&self) -> bool {
        self.step != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelTransportVersion {
    #[default]
    Uv,
    OobPickle,
}

/// Transaction-wide metadata.
#[derive(Debug, Clone, Default)]
pub struct GraphMeta {
    pub tx_id: Option<TxId>,
    pub executer: Option<ActorId>,
    pub snapshot: Snapshot,
    pub database: String,
    pub lock_tx_id: Option<u64>,
    pub channel_transport_version: ChannelTransportVersion,
    /// Result channel id to the local proxy consuming it.
    pub result_channel_proxies: BTreeMap<ChannelId, ActorId>,
    pub trace_id: Option<String>,
    pub user_sid: Option<String>,
    pub tables: HashMap<TableId, Arc<TableInfo>>,
}

#[derive(Debug, Clone)]
pub struct StageInfo {
    pub id: StageId,
    pub plan: PhysicalStage,
    pub tasks: Vec<TaskId>,
}

impl StageInfo {
    pub fn inputs_count(&self) -> usize {
        self.plan.inputs_count()
    }

    pub fn outputs_count(&self) -> usize {
        self.plan.outputs_count as usize
    }

    pub fn table(&self) -> Option<TableId> {
        self.plan.table()
    }
}

#[derive(Debug, Default)]
pub struct TasksGraph {
    meta: GraphMeta,
    stages: BTreeMap<StageId, StageInfo>,
    tasks: Vec<Task>,
    channels: Vec<Channel>,
}

impl TasksGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meta(&self) -> &GraphMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut GraphMeta {
        &mut self.meta
    }

    pub fn add_stage(&mut self, id: StageId, plan: PhysicalStage) -> GraphResult<&mut StageInfo> {
        if self.stages.contains_key(&id) {
            return Err(GraphError::DuplicateStage(id));
        }
        Ok(self.stages.entry(id).or_insert(StageInfo {
            id,
            plan,
            tasks: Vec::new(),
        }))
    }

    pub fn stage(&self, id: StageId) -> GraphResult<&StageInfo> {
        self.stages.get(&id).ok_or(GraphError::UnknownStage(id))
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageInfo> {
        self.stages.values()
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.keys().copied().collect()
    }

    pub fn table(&self, id: TableId) -> Option<&Arc<TableInfo>> {
        self.meta.tables.get(&id)
    }

    /// Allocates the next task id for `stage` with ports sized to the stage.
    pub fn add_task(&mut self, stage: StageId) -> GraphResult<&mut Task> {
        let info = self
            .stages
            .get_mut(&stage)
            .ok_or(GraphError::UnknownStage(stage))?;
        let id = TaskId(self.tasks.len() as u64 + 1);
        info.tasks.push(id);
        let task = Task::new(id, stage, info.inputs_count(), info.outputs_count());
        trace!(task_id = %id, stage = %stage, "task added");
        self.tasks.push(task);
        let last = self.tasks.len() - 1;
        Ok(&mut self.tasks[last])
    }

    pub fn task(&self, id: TaskId) -> GraphResult<&Task> {
        Self::index(id.0)
            .and_then(|i| self.tasks.get(i))
            .ok_or(GraphError::UnknownTask(id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> GraphResult<&mut Task> {
        Self::index(id.0)
            .and_then(|i| self.tasks.get_mut(i))
            .ok_or(GraphError::UnknownTask(id))
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn stage_tasks(&self, stage: StageId) -> GraphResult<Vec<&Task>> {
        let info = self.stage(stage)?;
        info.tasks.iter().map(|id| self.task(*id)).collect()
    }

    /// Wires a new channel from `src`'s output port to `dst`'s input port,
    /// or to result `dst_input_index` when `dst_task` is `None`.
    pub fn add_channel(
        &mut self,
        src_task: TaskId,
        src_output_index: usize,
        dst_task: Option<TaskId>,
        dst_input_index: usize,
    ) -> GraphResult<ChannelId> {
        let id = ChannelId(self.channels.len() as u64 + 1);

        if self.task(src_task)?.outputs.len() <= src_output_index {
            return Err(GraphError::UnknownPort { task: src_task, index: src_output_index });
        }
        if let Some(dst_id) = dst_task {
            if self.task(dst_id)?.inputs.len() <= dst_input_index {
                return Err(GraphError::UnknownPort { task: dst_id, index: dst_input_index });
            }
        }

        self.task_mut(src_task)?.outputs[src_output_index].channels.push(id);
        if let Some(dst_id) = dst_task {
            self.task_mut(dst_id)?.inputs[dst_input_index].channels.push(id);
        }

        self.channels.push(Channel {
            id,
            src_task,
            src_output_index,
            dst_task,
            dst_input_index,
            in_memory: true,
        });
        Ok(id)
    }

    pub fn channel(&self, id: ChannelId) -> GraphResult<&Channel> {
        Self::index(id.0)
            .and_then(|i| self.channels.get(i))
            .ok_or(GraphError::UnknownChannel(id))
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Result channels bound to result `index`.
    pub fn result_channels(&self, index: usize) -> impl Iterator<Item = &Channel> {
        self.channels
            .iter()
            .filter(move |ch| ch.is_result() && ch.dst_input_index == index)
    }

    /// Checks that every channel is registered on the ports it names and
    /// that every port only lists channels that point back to it.
    pub fn validate(&self) -> GraphResult<()> {
        for channel in &self.channels {
            let src = self.task(channel.src_task)?;
            let listed = src
                .outputs
                .get(channel.src_output_index)
                .is_some_and(|o| o.channels.contains(&channel.id));
            if !listed {
                return Err(GraphError::BrokenInvariant(format!(
                    "{} is not registered on output {} of {}",
                    channel.id, channel.src_output_index, channel.src_task
                )));
            }
            if let Some(dst_id) = channel.dst_task {
                let dst = self.task(dst_id)?;
                let listed = dst
                    .inputs
                    .get(channel.dst_input_index)
                    .is_some_and(|i| i.channels.contains(&channel.id));
                if !listed {
                    return Err(GraphError::BrokenInvariant(format!(
                        "{} is not registered on input {} of {}",
                        channel.id, channel.dst_input_index, dst_id
                    )));
                }
            }
        }

        for task in &self.tasks {
            for (index, output) in task.outputs.iter().enumerate() {
                for id in &output.channels {
                    let channel = self.channel(*id)?;
                    if channel.src_task != task.id || channel.src_output_index != index {
                        return Err(GraphError::BrokenInvariant(format!(
                            "{} listed on output {} of {} has another source",
                            id, index, task.id
                        )));
                    }
                }
            }
            for (index, input) in task.inputs.iter().enumerate() {
                for id in &input.channels {
                    let channel = self.channel(*id)?;
                    if channel.dst_task != Some(task.id) || channel.dst_input_index != index {
                        return Err(GraphError::BrokenInvariant(format!(
                            "{} listed on input {} of {} has another destination",
                            id, index, task.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn index(id: u64) -> Option<usize> {
        id.checked_sub(1).map(|i| i as usize)
    }
}
