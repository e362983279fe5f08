//! Physical plan as handed over by the query compiler.
//!
//! The executer never changes a plan; it only reads stage shapes, table
//! operations and source/sink declarations to build tasks.

use quarry_common::TableId;
use serde::{Deserialize, Serialize};

use crate::key::KeyRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Compute,
    Data,
    Scan,
    Generic,
}

/// One physical transaction: a DAG of stages plus the results it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalTx {
    pub tx_type: TxType,
    pub stages: Vec<PhysicalStage>,
    pub results: Vec<TxResultSpec>,
}

impl PhysicalTx {
    pub fn new(tx_type: TxType) -> Self {
        Self {
            tx_type,
            stages: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: PhysicalStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_result(mut self, result: TxResultSpec) -> Self {
        self.results.push(result);
        self
    }
}

/// Flags derived by the compiler from the stage program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramSettings {
    pub has_sort: bool,
    pub has_map_join: bool,
    pub has_aggregation: bool,
    /// Compiler estimate of how much data flows through the stage, in
    /// `[0, 1]`. Used by the scan-threads predictor for column tables.
    pub input_data_prediction: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalStage {
    pub program: Vec<u8>,
    pub settings: ProgramSettings,
    pub inputs: Vec<StageInput>,
    pub outputs_count: u32,
    pub table_ops: Vec<TableOp>,
    pub source: Option<StageSource>,
    pub sink: Option<StageSink>,
    pub is_sysview: bool,
}

impl PhysicalStage {
    pub fn new(program: Vec<u8>, outputs_count: u32) -> Self {
        Self {
            program,
            outputs_count,
            ..Default::default()
        }
    }

    /// Number of input ports: connection inputs first, then the source.
    pub fn inputs_count(&self) -> usize {
        self.inputs.len() + usize::from(self.source.is_some())
    }

    /// Port index the source reads into.
    pub fn source_input_index(&self) -> usize {
        self.inputs.len()
    }

    /// Table this stage reads from, if any.
    pub fn table(&self) -> Option<TableId> {
        if let Some(op) = self.table_ops.first() {
            return Some(op.table);
        }
        match &self.source {
            Some(StageSource::ReadRanges(source)) => Some(source.table),
            _ => None,
        }
    }

    /// Secret names referenced by the stage source and sink.
    pub fn secret_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(StageSource::External(source)) = &self.source {
            names.extend(source.auth_secret_names.iter().cloned());
        }
        if let Some(sink) = &self.sink {
            names.extend(sink.auth_secret_names.iter().cloned());
        }
        names
    }
}

/// Edge from an output of an upstream stage of the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub stage: u32,
    pub output_index: u32,
    pub connection: Connection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Connection {
    UnionAll,
    Map,
    HashShuffle { key_columns: Vec<String> },
    Broadcast,
    Merge { sort_columns: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadType {
    Rows,
    Blocks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOp {
    pub table: TableId,
    pub columns: Vec<String>,
    pub read: TableRead,
    pub items_limit: u64,
    pub reverse: bool,
    pub sorted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TableRead {
    ReadRange(KeyRange),
    ReadRanges(Vec<KeyRange>),
    ReadOlapRange {
        ranges: Vec<KeyRange>,
        olap_program: Vec<u8>,
        read_type: ReadType,
    },
    /// Writes to every shard owning one of the keys.
    Upsert(Vec<Vec<u8>>),
}

impl TableRead {
    pub fn ranges(&self) -> Vec<KeyRange> {
        match self {
            TableRead::ReadRange(range) => vec![range.clone()],
            TableRead::ReadRanges(ranges) => ranges.clone(),
            TableRead::ReadOlapRange { ranges, .. } => ranges.clone(),
            TableRead::Upsert(keys) => keys.iter().cloned().map(KeyRange::point).collect(),
        }
    }

    pub fn is_olap(&self) -> bool {
        matches!(self, TableRead::ReadOlapRange { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageSource {
    ReadRanges(ReadRangesSource),
    External(ExternalSource),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRangesSource {
    pub table: TableId,
    pub columns: Vec<String>,
    pub ranges: Vec<KeyRange>,
    pub items_limit: u64,
    pub reverse: bool,
    pub sorted: bool,
    /// When non-zero and below the partition count, a single task reads
    /// every partition with this many shards in flight.
    pub sequential_in_flight_shards: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalSource {
    pub source_type: String,
    pub source_name: String,
    pub settings: Vec<u8>,
    /// Opaque per-partition parameters, distributed round-robin over tasks.
    pub partitioned_task_params: Vec<String>,
    pub auth_secret_names: Vec<String>,
    /// Upper bound on parallelism requested by the compiler, 0 for none.
    pub max_tasks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSink {
    pub output_index: u32,
    pub sink_type: String,
    pub sink_name: String,
    pub settings: Vec<u8>,
    pub auth_secret_names: Vec<String>,
}

/// A result of the transaction: one output of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResultSpec {
    pub stage: u32,
    pub output_index: u32,
    pub is_stream: bool,
    pub query_result_index: Option<u32>,
    pub column_order: Vec<String>,
}

impl TxResultSpec {
    pub fn new(stage: u32) -> Self {
        Self {
            stage,
            output_index: 0,
            is_stream: false,
            query_result_index: None,
            column_order: Vec::new(),
        }
    }

    /// Streams to the caller instead of buffering into the response.
    pub fn streaming(mut self, query_result_index: u32) -> Self {
        self.is_stream = true;
        self.query_result_index = Some(query_result_index);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_port_follows_connection_inputs() {
        let mut stage = PhysicalStage::new(vec![], 1);
        stage.inputs.push(StageInput {
            stage: 0,
            output_index: 0,
            connection: Connection::Broadcast,
        });
        stage.source = Some(StageSource::External(ExternalSource::default()));
        assert_eq!(stage.inputs_count(), 2);
        assert_eq!(stage.source_input_index(), 1);
    }

    #[test]
    fn secret_names_collect_source_and_sink() {
        let mut stage = PhysicalStage::new(vec![], 1);
        stage.source = Some(StageSource::External(ExternalSource {
            auth_secret_names: vec!["token".into()],
            ..Default::default()
        }));
        stage.sink = Some(StageSink {
            auth_secret_names: vec!["sink_key".into()],
            ..Default::default()
        });
        assert_eq!(stage.secret_names(), vec!["token".to_string(), "sink_key".to_string()]);
    }
}
