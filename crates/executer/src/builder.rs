//! Turns stages of the physical plan into tasks and channels.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use quarry_common::{ActorId, Issues, NodeId, ShardId, StageId, StatusCode, TaskId};
use quarry_graph::{
    Connection, ExternalSource, PhysicalStage, PhysicalTx, ProgramSettings, ReadInfo,
    ReadRangesSource, ReadType, ShardReadInfo, StageSource, TableInfo, TableOp, TableRead,
    TaskInputKind, TaskMeta, TaskOutputKind, TaskType, TasksGraph,
};
use serde::Serialize;
use tracing::{debug, trace};

use crate::admission::ResourcesSnapshot;
use crate::config::ExecuterSettings;
use crate::error::ExecuterError;
use crate::resolver::{PartitionPruner, PrunedPartition};
use crate::stats::QueryExecutionStats;

pub const READ_RANGES_SOURCE_TYPE: &str = "ReadRangesSource";
pub const JOB_ID_PARAM: &str = "fq.job_id";

/// Registers every stage of every transaction in the graph.
pub fn add_stages(graph: &mut TasksGraph, transactions: &[PhysicalTx]) -> Result<(), ExecuterError> {
    for (tx_index, tx) in transactions.iter().enumerate() {
        for (stage_index, stage) in tx.stages.iter().enumerate() {
            for input in &stage.inputs {
                if input.stage as usize >= stage_index {
                    return Err(quarry_common::Error::InvalidPlan(format!(
                        "stage {} of transaction {} reads from stage {} which does not precede it",
                        stage_index, tx_index, input.stage
                    ))
                    .into());
                }
            }
            graph.add_stage(StageId::new(tx_index as u32, stage_index as u32), stage.clone())?;
        }
    }
    Ok(())
}

fn table_of(graph: &TasksGraph, op_table: quarry_common::TableId) -> Result<Arc<TableInfo>, ExecuterError> {
    graph.table(op_table).cloned().ok_or_else(|| {
        ExecuterError::failed(
            StatusCode::SchemeError,
            Issues::from_message(format!("Table {} is not resolved", op_table)),
        )
    })
}

/// Shards touched by stages that read through datashard pipes.
pub fn shards_to_resolve(
    graph: &TasksGraph,
    pruner: &dyn PartitionPruner,
) -> Result<BTreeSet<ShardId>, ExecuterError> {
    let mut shards = BTreeSet::new();
    for stage in graph.stages() {
        if stage.plan.is_sysview {
            continue;
        }
        for op in &stage.plan.table_ops {
            let table = table_of(graph, op.table)?;
            for partition in pruner.prune(&table, &op.read.ranges()) {
                shards.insert(partition.shard_id);
            }
        }
        if let Some(StageSource::ReadRanges(source)) = &stage.plan.source {
            let table = table_of(graph, source.table)?;
            for partition in pruner.prune(&table, &source.ranges) {
                shards.insert(partition.shard_id);
            }
        }
    }
    Ok(shards)
}

/// Chooses scan parallelism for column tables from the stage shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct StagePredictor;

impl StagePredictor {
    pub fn optimal_scans_count(&self, settings: &ProgramSettings, usable_threads: u32) -> u32 {
        let prediction = settings.input_data_prediction.clamp(0.0, 1.0);
        let mut count = (f64::from(usable_threads) * prediction).ceil() as u32;
        if settings.has_sort {
            count = count.div_ceil(2);
        }
        count.max(1)
    }
}

/// Source settings shipped to read-ranges source tasks.
#[derive(Debug, Serialize)]
struct ReadRangesSettings<'a> {
    table_path: &'a str,
    columns: &'a [String],
    items_limit: u64,
    reverse: bool,
    sorted: bool,
}

#[derive(Debug, Serialize)]
struct StructuredToken<'a> {
    name: &'a str,
    secrets: BTreeMap<&'a str, &'a str>,
}

pub struct BuildContext<'a> {
    pub settings: &'a ExecuterSettings,
    pub pruner: &'a dyn PartitionPruner,
    pub shard_nodes: &'a BTreeMap<ShardId, NodeId>,
    pub snapshot: &'a ResourcesSnapshot,
    pub secrets: &'a BTreeMap<String, String>,
    pub executer: ActorId,
    pub predictor: StagePredictor,
}

pub struct TasksBuilder<'a> {
    graph: &'a mut TasksGraph,
    ctx: BuildContext<'a>,
    stats: &'a mut QueryExecutionStats,
    meta_glueing_id: u32,
}

impl<'a> TasksBuilder<'a> {
    pub fn new(
        graph: &'a mut TasksGraph,
        ctx: BuildContext<'a>,
        stats: &'a mut QueryExecutionStats,
    ) -> Self {
        Self {
            graph,
            ctx,
            stats,
            meta_glueing_id: 0,
        }
    }

    pub fn graph(&self) -> &TasksGraph {
        self.graph
    }

    fn plan(&self, stage: StageId) -> Result<PhysicalStage, ExecuterError> {
        Ok(self.graph.stage(stage)?.plan.clone())
    }

    fn node_of(&self, shard: ShardId) -> Result<NodeId, ExecuterError> {
        self.ctx
            .shard_nodes
            .get(&shard)
            .copied()
            .ok_or_else(|| ExecuterError::Unavailable(format!("No node is known for {}", shard)))
    }

    fn new_task(&mut self, stage: StageId, task_type: TaskType) -> Result<TaskId, ExecuterError> {
        let executer = self.ctx.executer;
        let task = self.graph.add_task(stage)?;
        let meta = task.meta_mut()?;
        meta.task_type = task_type;
        meta.executer = Some(executer);
        Ok(task.id)
    }

    fn read_info(op: &TableOp) -> ReadInfo {
        let (read_type, olap_program) = match &op.read {
            TableRead::ReadOlapRange {
                olap_program,
                read_type,
                ..
            } => (*read_type, Some(olap_program.clone())),
            _ => (ReadType::Rows, None),
        };
        ReadInfo {
            items_limit: op.items_limit,
            reverse: op.reverse,
            sorted: op.sorted,
            read_type,
            olap_program,
        }
    }

    fn structured_token(&self, name: &str, secret_names: &[String]) -> Result<String, ExecuterError> {
        let mut secrets = BTreeMap::new();
        for secret in secret_names {
            let value = self.ctx.secrets.get(secret).ok_or_else(|| {
                ExecuterError::internal(format!("Secret {} is not resolved", secret))
            })?;
            secrets.insert(secret.as_str(), value.as_str());
        }
        Ok(serde_json::to_string(&StructuredToken { name, secrets })?)
    }

    /// Scan tasks one node may run for a stage reading a table.
    pub fn scan_tasks_per_node(&self, plan: &PhysicalStage, is_olap: bool, node: NodeId) -> u32 {
        let aggregation = &self.ctx.settings.aggregation;
        let result = if is_olap {
            if aggregation.cs_scan_threads_per_node > 0 {
                aggregation.cs_scan_threads_per_node
            } else {
                let usable = self
                    .ctx
                    .snapshot
                    .node(node)
                    .map(|n| n.execution_units)
                    .unwrap_or(aggregation.compute_threads_per_node);
                self.ctx.predictor.optimal_scans_count(&plan.settings, usable)
            }
        } else {
            let mut threads = aggregation.ds_scan_minimal_threads;
            if plan.settings.has_sort {
                threads = threads.max(aggregation.ds_base_sort_scan_threads);
            }
            if plan.settings.has_map_join {
                threads = threads.max(aggregation.ds_base_join_scan_threads);
            }
            threads
        };
        result.max(1)
    }

    /// One task per touched shard, pinned to the shard and its node.
    pub fn build_datashard_tasks(&mut self, stage: StageId) -> Result<(), ExecuterError> {
        let plan = self.plan(stage)?;
        let mut shard_tasks: BTreeMap<ShardId, TaskId> = BTreeMap::new();
        for op in &plan.table_ops {
            let table = table_of(self.graph, op.table)?;
            for partition in self.ctx.pruner.prune(&table, &op.read.ranges()) {
                let node = self.node_of(partition.shard_id)?;
                let task_id = match shard_tasks.get(&partition.shard_id) {
                    Some(id) => *id,
                    None => {
                        let id = self.new_task(stage, TaskType::Compute)?;
                        let task = self.graph.task_mut(id)?;
                        task.shard_id = Some(partition.shard_id);
                        task.node_id = Some(node);
                        shard_tasks.insert(partition.shard_id, id);
                        self.stats.add_node_shards_count(stage, node, 1);
                        id
                    }
                };
                self.stats.affected_shards.insert(partition.shard_id);
                let meta = self.graph.task_mut(task_id)?.meta_mut()?;
                meta.read_info = Self::read_info(op);
                meta.reads.push(ShardReadInfo {
                    shard_id: partition.shard_id,
                    ranges: partition.ranges,
                    columns: op.columns.clone(),
                });
            }
        }
        debug!(stage = %stage, tasks = shard_tasks.len(), "datashard tasks built");
        Ok(())
    }

    fn assign_scan_task_to_shard(
        &mut self,
        stage: StageId,
        plan: &PhysicalStage,
        node: NodeId,
        is_olap: bool,
        sorted: bool,
        node_tasks: &mut BTreeMap<NodeId, Vec<TaskId>>,
        assigned: &mut BTreeMap<NodeId, usize>,
    ) -> Result<TaskId, ExecuterError> {
        if is_olap && sorted {
            let id = self.new_task(stage, TaskType::Scan)?;
            self.graph.task_mut(id)?.node_id = Some(node);
            node_tasks.entry(node).or_default().push(id);
            return Ok(id);
        }

        let max_scans = self.scan_tasks_per_node(plan, is_olap, node) as usize;
        let count = *assigned.get(&node).unwrap_or(&0);
        let id = if count < max_scans {
            let id = self.new_task(stage, TaskType::Scan)?;
            self.graph.task_mut(id)?.node_id = Some(node);
            node_tasks.entry(node).or_default().push(id);
            id
        } else {
            let tasks = node_tasks.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            *tasks.get(count % max_scans).ok_or_else(|| {
                ExecuterError::internal(format!("no scan task to reuse on {}", node))
            })?
        };
        assigned.insert(node, count + 1);
        Ok(id)
    }

    /// Distributes the shards a scan stage reads over scan tasks.
    pub fn build_scan_tasks_from_shards(&mut self, stage: StageId) -> Result<(), ExecuterError> {
        let plan = self.plan(stage)?;
        let [op] = plan.table_ops.as_slice() else {
            return Err(ExecuterError::internal(format!(
                "scan {} must read exactly one table, found {}",
                stage,
                plan.table_ops.len()
            )));
        };
        let table = table_of(self.graph, op.table)?;
        let is_olap = table.is_olap();
        let sorted = op.sorted;
        let read_info = Self::read_info(op);
        let partitions = self.ctx.pruner.prune(&table, &op.read.ranges());

        if !self.ctx.settings.enable_read_compute_separation || (!is_olap && sorted) {
            let mut node_tasks: BTreeMap<NodeId, Vec<TaskId>> = BTreeMap::new();
            let mut assigned: BTreeMap<NodeId, usize> = BTreeMap::new();
            for partition in partitions {
                let node = self.node_of(partition.shard_id)?;
                let task_id = self.assign_scan_task_to_shard(
                    stage,
                    &plan,
                    node,
                    is_olap,
                    sorted,
                    &mut node_tasks,
                    &mut assigned,
                )?;
                self.stats.affected_shards.insert(partition.shard_id);
                self.stats.add_node_shards_count(stage, node, 1);
                trace!(stage = %stage, shard = %partition.shard_id, task_id = %task_id, "shard assigned to scan task");
                let meta = self.graph.task_mut(task_id)?.meta_mut()?;
                meta.reads.push(ShardReadInfo {
                    shard_id: partition.shard_id,
                    ranges: partition.ranges,
                    columns: op.columns.clone(),
                });
            }

            for task_id in node_tasks.values().flatten() {
                let meta = self.graph.task_mut(*task_id)?.meta_mut()?;
                meta.read_info = read_info.clone();
                meta.enable_shards_sequential_scan = sorted;
                meta.sort_reads_by_right_border();
            }
            debug!(stage = %stage, nodes = node_tasks.len(), "scan tasks built from shards");
            return Ok(());
        }

        let mut by_node: BTreeMap<NodeId, Vec<PrunedPartition>> = BTreeMap::new();
        for partition in partitions {
            let node = self.node_of(partition.shard_id)?;
            self.stats.affected_shards.insert(partition.shard_id);
            self.stats.add_node_shards_count(stage, node, 1);
            by_node.entry(node).or_default().push(partition);
        }
        for (node, partitions) in by_node {
            let mut meta = TaskMeta::with_type(TaskType::Scan);
            meta.executer = Some(self.ctx.executer);
            meta.read_info = read_info.clone();
            meta.reads = partitions
                .into_iter()
                .map(|p| ShardReadInfo {
                    shard_id: p.shard_id,
                    ranges: p.ranges,
                    columns: op.columns.clone(),
                })
                .collect();
            meta.sort_reads_by_right_border();

            self.meta_glueing_id += 1;
            let glueing_id = self.meta_glueing_id;
            let meta = Arc::new(meta);
            for _ in 0..self.scan_tasks_per_node(&plan, is_olap, node) {
                let task = self.graph.add_task(stage)?;
                task.node_id = Some(node);
                task.set_glued_meta(meta.clone(), glueing_id);
            }
        }
        Ok(())
    }

    /// One compute task per table operation of a system view stage.
    pub fn build_sysview_tasks(&mut self, stage: StageId) -> Result<(), ExecuterError> {
        let plan = self.plan(stage)?;
        for op in &plan.table_ops {
            let table = table_of(self.graph, op.table)?;
            let reads: Vec<ShardReadInfo> = self
                .ctx
                .pruner
                .prune(&table, &op.read.ranges())
                .into_iter()
                .map(|p| ShardReadInfo {
                    shard_id: p.shard_id,
                    ranges: p.ranges,
                    columns: op.columns.clone(),
                })
                .collect();
            let id = self.new_task(stage, TaskType::Compute)?;
            let meta = self.graph.task_mut(id)?.meta_mut()?;
            meta.read_info = Self::read_info(op);
            meta.reads = reads;
        }
        Ok(())
    }

    /// Tasks for a stage reading an external source.
    pub fn build_read_tasks_from_source(&mut self, stage: StageId) -> Result<(), ExecuterError> {
        let plan = self.plan(stage)?;
        let Some(StageSource::External(source)) = &plan.source else {
            return Err(ExecuterError::internal(format!("{} has no external source", stage)));
        };
        let ExternalSource {
            source_type,
            source_name,
            settings,
            partitioned_task_params,
            auth_secret_names,
            max_tasks,
        } = source;

        let mut requested = partitioned_task_params.len().max(1);
        if *max_tasks > 0 {
            requested = requested.min(*max_tasks);
        }
        let count = self.ctx.snapshot.cap_task_count(requested);

        let token = if source_name.is_empty() {
            None
        } else {
            Some(self.structured_token(source_name, auth_secret_names)?)
        };

        let input_index = plan.source_input_index();
        let mut tasks = Vec::with_capacity(count);
        for i in 0..count {
            let (task_type, node) = self.ctx.snapshot.pin(i);
            let id = self.new_task(stage, task_type)?;
            let task = self.graph.task_mut(id)?;
            task.node_id = node;
            task.inputs[input_index].kind = TaskInputKind::Source {
                source_type: source_type.clone(),
                settings: settings.clone(),
            };
            if let Some(token) = &token {
                task.meta_mut()?
                    .secure_params
                    .insert(source_name.clone(), token.clone());
            }
            tasks.push(id);
        }

        for (i, param) in partitioned_task_params.iter().enumerate() {
            let id = tasks[i % tasks.len()];
            self.graph.task_mut(id)?.meta_mut()?.read_ranges.push(param.clone());
        }
        debug!(stage = %stage, tasks = count, params = partitioned_task_params.len(), "source read tasks built");
        Ok(())
    }

    /// Scan tasks for a stage whose source reads key ranges of a table.
    pub fn build_scan_tasks_from_source(&mut self, stage: StageId) -> Result<(), ExecuterError> {
        let plan = self.plan(stage)?;
        let Some(StageSource::ReadRanges(source)) = &plan.source else {
            return Err(ExecuterError::internal(format!("{} has no read ranges source", stage)));
        };
        let ReadRangesSource {
            table: table_id,
            columns,
            ranges,
            items_limit,
            reverse,
            sorted,
            sequential_in_flight_shards,
        } = source;
        let table = table_of(self.graph, *table_id)?;
        let settings = bincode::serialize(&ReadRangesSettings {
            table_path: &table.path,
            columns,
            items_limit: *items_limit,
            reverse: *reverse,
            sorted: *sorted,
        })?;
        let input_kind = TaskInputKind::Source {
            source_type: READ_RANGES_SOURCE_TYPE.to_string(),
            settings,
        };
        let input_index = plan.source_input_index();
        let read_info = ReadInfo {
            items_limit: *items_limit,
            reverse: *reverse,
            sorted: *sorted,
            read_type: ReadType::Rows,
            olap_program: None,
        };

        let partitions = self.ctx.pruner.prune(&table, ranges);
        for partition in &partitions {
            self.stats.affected_shards.insert(partition.shard_id);
        }

        let sequential = *sequential_in_flight_shards as usize;
        if sequential > 0 && sequential < partitions.len() {
            let first_shard = partitions[0].shard_id;
            let node = self.node_of(first_shard)?;
            self.stats.add_node_shards_count(stage, node, partitions.len() as u32);
            let id = self.new_task(stage, TaskType::Scan)?;
            let task = self.graph.task_mut(id)?;
            task.node_id = Some(node);
            task.shard_id = Some(first_shard);
            task.inputs[input_index].kind = input_kind;
            let meta = task.meta_mut()?;
            meta.read_info = read_info;
            meta.max_in_flight_shards = Some(*sequential_in_flight_shards);
            meta.reads = partitions
                .into_iter()
                .map(|p| ShardReadInfo {
                    shard_id: p.shard_id,
                    ranges: p.ranges,
                    columns: columns.clone(),
                })
                .collect();
            meta.sort_reads_by_right_border();
            return Ok(());
        }

        for partition in partitions {
            let node = self.node_of(partition.shard_id)?;
            self.stats.add_node_shards_count(stage, node, 1);
            let id = self.new_task(stage, TaskType::Scan)?;
            let task = self.graph.task_mut(id)?;
            task.node_id = Some(node);
            task.shard_id = Some(partition.shard_id);
            task.inputs[input_index].kind = input_kind.clone();
            let meta = task.meta_mut()?;
            meta.read_info = read_info.clone();
            meta.reads.push(ShardReadInfo {
                shard_id: partition.shard_id,
                ranges: partition.ranges,
                columns: columns.clone(),
            });
        }
        Ok(())
    }

    /// Compute tasks sized by the stage inputs: `Map` keeps the producer
    /// count, `HashShuffle` takes the largest producer, anything else
    /// needs a single task.
    pub fn build_compute_tasks(&mut self, stage: StageId) -> Result<(), ExecuterError> {
        let plan = self.plan(stage)?;
        let mut partitions = 0usize;
        for input in &plan.inputs {
            let src = StageId::new(stage.tx, input.stage);
            let src_tasks = self.graph.stage(src)?.tasks.len();
            match input.connection {
                Connection::Map => {
                    if partitions != 0 && partitions != src_tasks {
                        return Err(ExecuterError::internal(format!(
                            "map input of {} has {} tasks, expected {}",
                            stage, src_tasks, partitions
                        )));
                    }
                    partitions = src_tasks;
                }
                Connection::HashShuffle { .. } => partitions = partitions.max(src_tasks),
                Connection::UnionAll | Connection::Broadcast | Connection::Merge { .. } => {}
            }
        }
        for _ in 0..partitions.max(1) {
            self.new_task(stage, TaskType::Compute)?;
        }
        Ok(())
    }

    /// Types the sink output and fills sink parameters on every task.
    pub fn build_sinks(&mut self, stage: StageId, trace_id: Option<&str>) -> Result<(), ExecuterError> {
        let plan = self.plan(stage)?;
        let Some(sink) = &plan.sink else {
            return Ok(());
        };
        let token = if sink.sink_name.is_empty() {
            None
        } else {
            Some(self.structured_token(&sink.sink_name, &sink.auth_secret_names)?)
        };
        let fill = |meta: &mut TaskMeta| {
            if let Some(token) = &token {
                meta.secure_params.insert(sink.sink_name.clone(), token.clone());
            }
            if let Some(trace_id) = trace_id {
                meta.task_params.insert(JOB_ID_PARAM.to_string(), trace_id.to_string());
            }
        };
        let output = sink.output_index as usize;
        // Glued tasks get one new meta per group, shared again by every member.
        let mut reglued: BTreeMap<u32, Arc<TaskMeta>> = BTreeMap::new();
        for id in self.graph.stage(stage)?.tasks.clone() {
            let task = self.graph.task_mut(id)?;
            let port = task.outputs.get_mut(output).ok_or_else(|| {
                ExecuterError::internal(format!("{} has no output {} for its sink", stage, output))
            })?;
            port.kind = TaskOutputKind::Sink {
                sink_type: sink.sink_type.clone(),
                settings: sink.settings.clone(),
            };
            match task.meta_glueing_id() {
                Some(glueing_id) => {
                    let meta = reglued
                        .entry(glueing_id)
                        .or_insert_with(|| {
                            let mut meta = task.meta().clone();
                            fill(&mut meta);
                            Arc::new(meta)
                        })
                        .clone();
                    task.set_glued_meta(meta, glueing_id);
                }
                None => fill(task.meta_mut()?),
            }
        }
        Ok(())
    }

    /// Wires channels for every stage input of transaction `tx_index`, then
    /// the result channels starting at global result index `result_offset`.
    pub fn build_channels(
        &mut self,
        tx_index: u32,
        tx: &PhysicalTx,
        result_offset: usize,
    ) -> Result<(), ExecuterError> {
        for stage_index in 0..tx.stages.len() {
            let stage = StageId::new(tx_index, stage_index as u32);
            let plan = self.plan(stage)?;
            let dst_tasks = self.graph.stage(stage)?.tasks.clone();
            for (input_index, input) in plan.inputs.iter().enumerate() {
                let src_tasks = self.graph.stage(StageId::new(tx_index, input.stage))?.tasks.clone();
                let output = input.output_index as usize;
                for dst in &dst_tasks {
                    self.graph.task_mut(*dst)?.inputs[input_index].kind =
                        TaskInputKind::Channels(input.connection.clone());
                }
                self.build_input_channels(stage, &input.connection, &src_tasks, output, &dst_tasks, input_index)?;
            }
        }

        for (i, result) in tx.results.iter().enumerate() {
            let stage = StageId::new(tx_index, result.stage);
            let output = result.output_index as usize;
            for task_id in self.graph.stage(stage)?.tasks.clone() {
                self.set_output_kind(task_id, output, TaskOutputKind::Map)?;
                self.graph.add_channel(task_id, output, None, result_offset + i)?;
            }
        }
        Ok(())
    }

    fn set_output_kind(&mut self, task_id: TaskId, output: usize, kind: TaskOutputKind) -> Result<(), ExecuterError> {
        let task = self.graph.task_mut(task_id)?;
        let port = task.outputs.get_mut(output).ok_or_else(|| {
            ExecuterError::internal(format!("{} has no output {}", task_id, output))
        })?;
        if port.kind == TaskOutputKind::Undefined {
            port.kind = kind;
        }
        Ok(())
    }

    fn build_input_channels(
        &mut self,
        stage: StageId,
        connection: &Connection,
        src_tasks: &[TaskId],
        output: usize,
        dst_tasks: &[TaskId],
        input_index: usize,
    ) -> Result<(), ExecuterError> {
        match connection {
            Connection::UnionAll | Connection::Merge { .. } => {
                if src_tasks.is_empty() {
                    return Ok(());
                }
                let [dst] = dst_tasks else {
                    return Err(ExecuterError::internal(format!(
                        "{} gathers its input into {} tasks instead of one",
                        stage,
                        dst_tasks.len()
                    )));
                };
                for src in src_tasks {
                    self.set_output_kind(*src, output, TaskOutputKind::Map)?;
                    self.graph.add_channel(*src, output, Some(*dst), input_index)?;
                }
            }
            Connection::Map => {
                if src_tasks.len() != dst_tasks.len() {
                    return Err(ExecuterError::internal(format!(
                        "map input of {} pairs {} producers with {} consumers",
                        stage,
                        src_tasks.len(),
                        dst_tasks.len()
                    )));
                }
                for (src, dst) in src_tasks.iter().zip(dst_tasks) {
                    self.set_output_kind(*src, output, TaskOutputKind::Map)?;
                    self.graph.add_channel(*src, output, Some(*dst), input_index)?;
                }
            }
            Connection::HashShuffle { key_columns } => {
                for src in src_tasks {
                    self.set_output_kind(
                        *src,
                        output,
                        TaskOutputKind::HashPartition {
                            key_columns: key_columns.clone(),
                            partitions_count: dst_tasks.len(),
                        },
                    )?;
                    for dst in dst_tasks {
                        self.graph.add_channel(*src, output, Some(*dst), input_index)?;
                    }
                }
            }
            Connection::Broadcast => {
                for src in src_tasks {
                    self.set_output_kind(*src, output, TaskOutputKind::Broadcast)?;
                    for dst in dst_tasks {
                        self.graph.add_channel(*src, output, Some(*dst), input_index)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::RangePartitionPruner;
    use quarry_common::TableId;
    use quarry_graph::{KeyRange, StageInput, TableKind, TablePartition, TxResultSpec, TxType};

    fn table(kind: TableKind, shards: &[u64]) -> TableInfo {
        let mut table = TableInfo::new(TableId(1), "/Root/t", kind);
        let n = shards.len();
        table.partitions = shards
            .iter()
            .enumerate()
            .map(|(i, s)| TablePartition {
                shard_id: ShardId(*s),
                end_key: if i + 1 == n { None } else { Some(vec![b'a' + i as u8 + 1]) },
            })
            .collect();
        table
    }

    fn scan_stage(sorted: bool) -> PhysicalStage {
        let mut stage = PhysicalStage::new(vec![], 1);
        stage.table_ops.push(TableOp {
            table: TableId(1),
            columns: vec!["k".into()],
            read: TableRead::ReadRange(KeyRange::full()),
            items_limit: 0,
            reverse: false,
            sorted,
        });
        stage
    }

    struct Fixture {
        graph: TasksGraph,
        settings: ExecuterSettings,
        shard_nodes: BTreeMap<ShardId, NodeId>,
        snapshot: ResourcesSnapshot,
        secrets: BTreeMap<String, String>,
        stats: QueryExecutionStats,
    }

    impl Fixture {
        fn new(table: TableInfo, stages: Vec<PhysicalStage>) -> Self {
            let mut graph = TasksGraph::new();
            let mut tx = PhysicalTx::new(TxType::Scan);
            tx.stages = stages;
            add_stages(&mut graph, &[tx]).unwrap();
            graph.meta_mut().tables.insert(table.id, Arc::new(table));
            Self {
                graph,
                settings: ExecuterSettings::default(),
                shard_nodes: BTreeMap::new(),
                snapshot: ResourcesSnapshot::default(),
                secrets: BTreeMap::new(),
                stats: QueryExecutionStats::default(),
            }
        }

        fn builder(&mut self) -> TasksBuilder<'_> {
            let ctx = BuildContext {
                settings: &self.settings,
                pruner: &RangePartitionPruner,
                shard_nodes: &self.shard_nodes,
                snapshot: &self.snapshot,
                secrets: &self.secrets,
                executer: ActorId::new(NodeId(100), 1),
                predictor: StagePredictor,
            };
            TasksBuilder::new(&mut self.graph, ctx, &mut self.stats)
        }
    }

    #[test]
    fn third_shard_on_node_merges_into_first_task() {
        let mut f = Fixture::new(table(TableKind::Datashard, &[1, 2, 3]), vec![scan_stage(false)]);
        f.settings.aggregation.ds_scan_minimal_threads = 2;
        for shard in 1..=3 {
            f.shard_nodes.insert(ShardId(shard), NodeId(7));
        }
        let stage = StageId::new(0, 0);
        f.builder().build_scan_tasks_from_shards(stage).unwrap();

        let tasks = f.graph.stage_tasks(stage).unwrap();
        assert_eq!(tasks.len(), 2);
        let first: Vec<_> = tasks[0].meta().shard_ids().collect();
        let second: Vec<_> = tasks[1].meta().shard_ids().collect();
        assert_eq!(first, vec![ShardId(1), ShardId(3)]);
        assert_eq!(second, vec![ShardId(2)]);
        assert!(tasks.iter().all(|t| t.node_id == Some(NodeId(7))));
        assert_eq!(f.stats.stage_node_shards[&stage][&NodeId(7)], 3);
    }

    #[test]
    fn sorted_olap_scan_gets_task_per_shard() {
        let mut f = Fixture::new(table(TableKind::Olap, &[1, 2, 3]), vec![scan_stage(true)]);
        f.settings.aggregation.cs_scan_threads_per_node = 1;
        for shard in 1..=3 {
            f.shard_nodes.insert(ShardId(shard), NodeId(1));
        }
        let stage = StageId::new(0, 0);
        f.builder().build_scan_tasks_from_shards(stage).unwrap();
        assert_eq!(f.graph.stage_tasks(stage).unwrap().len(), 3);
    }

    #[test]
    fn separated_reads_glue_one_meta_per_node() {
        let mut f = Fixture::new(table(TableKind::Datashard, &[1, 2, 3]), vec![scan_stage(false)]);
        f.settings.enable_read_compute_separation = true;
        f.settings.aggregation.ds_scan_minimal_threads = 2;
        f.shard_nodes.insert(ShardId(1), NodeId(1));
        f.shard_nodes.insert(ShardId(2), NodeId(2));
        f.shard_nodes.insert(ShardId(3), NodeId(1));
        let stage = StageId::new(0, 0);
        f.builder().build_scan_tasks_from_shards(stage).unwrap();

        let tasks = f.graph.stage_tasks(stage).unwrap();
        assert_eq!(tasks.len(), 4);
        let node1: Vec<_> = tasks.iter().filter(|t| t.node_id == Some(NodeId(1))).collect();
        assert_eq!(node1.len(), 2);
        assert!(Arc::ptr_eq(&node1[0].shared_meta(), &node1[1].shared_meta()));
        assert_eq!(node1[0].meta().reads.len(), 2);
        assert_ne!(node1[0].meta_glueing_id(), tasks.iter().find(|t| t.node_id == Some(NodeId(2))).unwrap().meta_glueing_id());
    }

    #[test]
    fn sink_on_glued_scan_keeps_one_meta_per_node() {
        let mut stage = scan_stage(false);
        stage.sink = Some(quarry_graph::StageSink {
            output_index: 0,
            sink_type: "S3Sink".into(),
            ..Default::default()
        });
        let mut f = Fixture::new(table(TableKind::Datashard, &[1, 2, 3]), vec![stage]);
        f.settings.enable_read_compute_separation = true;
        f.settings.aggregation.ds_scan_minimal_threads = 2;
        f.shard_nodes.insert(ShardId(1), NodeId(1));
        f.shard_nodes.insert(ShardId(2), NodeId(2));
        f.shard_nodes.insert(ShardId(3), NodeId(1));
        let stage = StageId::new(0, 0);
        {
            let mut builder = f.builder();
            builder.build_scan_tasks_from_shards(stage).unwrap();
            builder.build_sinks(stage, Some("trace-1")).unwrap();
        }

        let tasks = f.graph.stage_tasks(stage).unwrap();
        assert_eq!(tasks.len(), 4);
        for task in &tasks {
            assert!(task.meta_glueing_id().is_some());
            assert!(matches!(task.outputs[0].kind, TaskOutputKind::Sink { .. }));
            assert_eq!(task.meta().task_params[JOB_ID_PARAM], "trace-1");
            assert_eq!(task.meta().reads.len(), if task.node_id == Some(NodeId(1)) { 2 } else { 1 });
        }
        let node1: Vec<_> = tasks.iter().filter(|t| t.node_id == Some(NodeId(1))).collect();
        assert!(Arc::ptr_eq(&node1[0].shared_meta(), &node1[1].shared_meta()));
    }

    #[test]
    fn scan_threads_follow_program_shape() {
        let mut f = Fixture::new(table(TableKind::Datashard, &[1]), vec![scan_stage(false)]);
        f.settings.aggregation.ds_scan_minimal_threads = 1;
        f.settings.aggregation.ds_base_sort_scan_threads = 3;
        f.settings.aggregation.ds_base_join_scan_threads = 5;
        let mut plan = scan_stage(false);
        let builder = f.builder();
        assert_eq!(builder.scan_tasks_per_node(&plan, false, NodeId(1)), 1);
        plan.settings.has_sort = true;
        assert_eq!(builder.scan_tasks_per_node(&plan, false, NodeId(1)), 3);
        plan.settings.has_map_join = true;
        assert_eq!(builder.scan_tasks_per_node(&plan, false, NodeId(1)), 5);
        plan.settings.input_data_prediction = 0.5;
        assert_eq!(builder.scan_tasks_per_node(&plan, true, NodeId(1)), 4);
    }

    #[test]
    fn external_source_tasks_spread_params_round_robin() {
        let mut stage = PhysicalStage::new(vec![], 1);
        stage.source = Some(StageSource::External(ExternalSource {
            source_type: "S3Source".into(),
            source_name: "bucket".into(),
            partitioned_task_params: (0..5).map(|i| format!("p{i}")).collect(),
            auth_secret_names: vec!["key".into()],
            ..Default::default()
        }));
        let mut f = Fixture::new(table(TableKind::Datashard, &[1]), vec![stage]);
        f.secrets.insert("key".into(), "s3cr3t".into());
        f.snapshot = ResourcesSnapshot::new(vec![crate::admission::NodeResources::new(NodeId(4), 1, 1)]);
        let stage = StageId::new(0, 0);
        f.builder().build_read_tasks_from_source(stage).unwrap();

        let tasks = f.graph.stage_tasks(stage).unwrap();
        assert_eq!(tasks.len(), 2, "capped at twice the snapshot size");
        assert_eq!(tasks[0].meta().read_ranges, vec!["p0", "p2", "p4"]);
        assert_eq!(tasks[1].meta().read_ranges, vec!["p1", "p3"]);
        assert!(tasks.iter().all(|t| t.node_id == Some(NodeId(4)) && t.meta().task_type == TaskType::Scan));
        let token: serde_json::Value =
            serde_json::from_str(&tasks[0].meta().secure_params["bucket"]).unwrap();
        assert_eq!(token["secrets"]["key"], "s3cr3t");
    }

    #[test]
    fn external_source_without_snapshot_is_unpinned_compute() {
        let mut stage = PhysicalStage::new(vec![], 1);
        stage.source = Some(StageSource::External(ExternalSource {
            source_type: "S3Source".into(),
            partitioned_task_params: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        }));
        let mut f = Fixture::new(table(TableKind::Datashard, &[1]), vec![stage]);
        let stage = StageId::new(0, 0);
        f.builder().build_read_tasks_from_source(stage).unwrap();
        let tasks = f.graph.stage_tasks(stage).unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.node_id.is_none() && t.meta().task_type == TaskType::Compute));
    }

    #[test]
    fn sequential_source_reads_everything_in_one_task() {
        let mut stage = PhysicalStage::new(vec![], 1);
        stage.source = Some(StageSource::ReadRanges(ReadRangesSource {
            table: TableId(1),
            columns: vec!["k".into()],
            ranges: vec![KeyRange::full()],
            items_limit: 0,
            reverse: false,
            sorted: true,
            sequential_in_flight_shards: 1,
        }));
        let mut f = Fixture::new(table(TableKind::Datashard, &[1, 2, 3]), vec![stage]);
        f.shard_nodes.insert(ShardId(1), NodeId(5));
        f.shard_nodes.insert(ShardId(2), NodeId(6));
        f.shard_nodes.insert(ShardId(3), NodeId(6));
        let stage = StageId::new(0, 0);
        f.builder().build_scan_tasks_from_source(stage).unwrap();
        let tasks = f.graph.stage_tasks(stage).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].node_id, Some(NodeId(5)), "placed with the first shard");
        assert_eq!(tasks[0].shard_id, Some(ShardId(1)));
        assert_eq!(f.stats.stage_node_shards[&stage][&NodeId(5)], 3);
        assert_eq!(tasks[0].meta().max_in_flight_shards, Some(1));
        assert_eq!(tasks[0].meta().reads.len(), 3);
        assert!(matches!(tasks[0].inputs[0].kind, TaskInputKind::Source { .. }));
    }

    #[test]
    fn shuffle_channels_connect_every_pair() {
        let producer = scan_stage(false);
        let mut consumer = PhysicalStage::new(vec![], 1);
        consumer.inputs.push(StageInput {
            stage: 0,
            output_index: 0,
            connection: Connection::HashShuffle { key_columns: vec!["k".into()] },
        });
        let mut tx = PhysicalTx::new(TxType::Scan);
        tx.stages = vec![producer, consumer];
        tx.results.push(TxResultSpec::new(1));

        let mut f = Fixture::new(table(TableKind::Datashard, &[1, 2]), tx.stages.clone());
        f.shard_nodes.insert(ShardId(1), NodeId(1));
        f.shard_nodes.insert(ShardId(2), NodeId(2));
        {
            let mut builder = f.builder();
            builder.build_scan_tasks_from_shards(StageId::new(0, 0)).unwrap();
            builder.build_compute_tasks(StageId::new(0, 1)).unwrap();
            builder.build_channels(0, &tx, 0).unwrap();
        }
        f.graph.validate().unwrap();
        assert_eq!(f.graph.stage(StageId::new(0, 1)).unwrap().tasks.len(), 2);
        assert_eq!(f.graph.channels().len(), 2 * 2 + 2);
        assert_eq!(f.graph.result_channels(0).count(), 2);
    }

    #[test]
    fn sink_gets_job_id_and_output_kind() {
        let mut stage = PhysicalStage::new(vec![], 1);
        stage.sink = Some(quarry_graph::StageSink {
            output_index: 0,
            sink_type: "S3Sink".into(),
            ..Default::default()
        });
        let mut f = Fixture::new(table(TableKind::Datashard, &[1]), vec![stage]);
        let stage = StageId::new(0, 0);
        {
            let mut builder = f.builder();
            builder.build_compute_tasks(stage).unwrap();
            builder.build_sinks(stage, Some("trace-1")).unwrap();
        }
        let task = &f.graph.tasks()[0];
        assert!(matches!(task.outputs[0].kind, TaskOutputKind::Sink { .. }));
        assert_eq!(task.meta().task_params[JOB_ID_PARAM], "trace-1");
    }
}
