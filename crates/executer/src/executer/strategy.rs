//! Per query kind behavior plugged into the executer.

use quarry_common::{Counter, ExecuterCounters, StageId, StatusCode};
use quarry_graph::{StageSource, TasksGraph};

use crate::builder::TasksBuilder;
use crate::error::ExecuterError;

pub trait ExecutionStrategy: Send {
    fn name(&self) -> &'static str;

    /// Whether tasks can only be built once the cluster resource snapshot
    /// is known.
    fn needs_resources_snapshot(&self, graph: &TasksGraph) -> bool;

    /// Creates the tasks of one stage. Stages are visited in plan order so
    /// every producer is built before its consumers.
    fn build_tasks_for_stage(
        &self,
        builder: &mut TasksBuilder<'_>,
        stage: StageId,
    ) -> Result<(), ExecuterError> {
        let plan = &builder.graph().stage(stage)?.plan;
        let (read_ranges, external) = match &plan.source {
            Some(StageSource::ReadRanges(_)) => (true, false),
            Some(StageSource::External(_)) => (false, true),
            None => (false, false),
        };
        let is_sysview = plan.is_sysview;
        let has_table_ops = !plan.table_ops.is_empty();

        if read_ranges {
            builder.build_scan_tasks_from_source(stage)
        } else if external {
            builder.build_read_tasks_from_source(stage)
        } else if is_sysview {
            builder.build_sysview_tasks(stage)
        } else if has_table_ops {
            self.build_table_stage(builder, stage)
        } else {
            builder.build_compute_tasks(stage)
        }
    }

    /// Creates the tasks of a stage reading or writing table shards.
    fn build_table_stage(
        &self,
        builder: &mut TasksBuilder<'_>,
        stage: StageId,
    ) -> Result<(), ExecuterError>;

    /// Called once with the status of the terminal reply.
    fn on_complete(&self, _counters: &ExecuterCounters, _status: StatusCode) {}
}

fn has_external_sources(graph: &TasksGraph) -> bool {
    graph
        .stages()
        .any(|s| matches!(s.plan.source, Some(StageSource::External(_))))
}

/// Data queries: one task per touched shard.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataStrategy;

impl ExecutionStrategy for DataStrategy {
    fn name(&self) -> &'static str {
        "data"
    }

    fn needs_resources_snapshot(&self, graph: &TasksGraph) -> bool {
        has_external_sources(graph)
    }

    fn build_table_stage(
        &self,
        builder: &mut TasksBuilder<'_>,
        stage: StageId,
    ) -> Result<(), ExecuterError> {
        builder.build_datashard_tasks(stage)
    }

    fn on_complete(&self, counters: &ExecuterCounters, status: StatusCode) {
        if status.is_success() {
            counters.inc(Counter::ReportStatusOk);
        } else {
            counters.inc(Counter::ReportStatusNotOk);
        }
    }
}

/// Scan queries: shards are spread over a bounded number of scan tasks
/// per node.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStrategy;

impl ExecutionStrategy for ScanStrategy {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn needs_resources_snapshot(&self, _graph: &TasksGraph) -> bool {
        true
    }

    fn build_table_stage(
        &self,
        builder: &mut TasksBuilder<'_>,
        stage: StageId,
    ) -> Result<(), ExecuterError> {
        builder.build_scan_tasks_from_shards(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_graph::{ExternalSource, PhysicalStage};

    #[test]
    fn data_queries_fetch_resources_only_for_external_sources() {
        let mut graph = TasksGraph::new();
        graph
            .add_stage(StageId::new(0, 0), PhysicalStage::new(vec![], 1))
            .unwrap();
        assert!(!DataStrategy.needs_resources_snapshot(&graph));
        assert!(ScanStrategy.needs_resources_snapshot(&graph));

        let mut stage = PhysicalStage::new(vec![], 1);
        stage.source = Some(StageSource::External(ExternalSource::default()));
        graph.add_stage(StageId::new(0, 1), stage).unwrap();
        assert!(DataStrategy.needs_resources_snapshot(&graph));
    }

    #[test]
    fn data_queries_count_reply_statuses() {
        let counters = ExecuterCounters::new();
        DataStrategy.on_complete(&counters, StatusCode::Success);
        DataStrategy.on_complete(&counters, StatusCode::Aborted);
        ScanStrategy.on_complete(&counters, StatusCode::Success);
        assert_eq!(counters.get(Counter::ReportStatusOk), 1);
        assert_eq!(counters.get(Counter::ReportStatusNotOk), 1);
    }
}
