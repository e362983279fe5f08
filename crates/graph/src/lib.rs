//! Graph crate
//!
//! The physical plan consumed from the compiler and the tasks graph the
//! executer builds from it: stages, tasks, channels and per-task metadata.
//!
//! # Example
//! ```rust
//! use quarry_common::StageId;
//! use quarry_graph::{PhysicalStage, TasksGraph};
//! let mut graph = TasksGraph::new();
//! let stage = StageId::new(0, 0);
//! graph.add_stage(stage, PhysicalStage::new(vec![], 1)).unwrap();
//! let task = graph.add_task(stage).unwrap().id;
//! let channel = graph.add_channel(task, 0, None, 0).unwrap();
//! assert!(graph.channel(channel).unwrap().is_result());
//! ```

pub mod error;
pub mod graph;
pub mod key;
pub mod plan;
pub mod table;
pub mod task;

pub use error::{GraphError, GraphResult};
pub use graph::{ChannelTransportVersion, GraphMeta, Snapshot, StageInfo, TasksGraph};
pub use key::{KeyRange, RightBorder};
pub use plan::{
    Connection, ExternalSource, PhysicalStage, PhysicalTx, ProgramSettings, ReadRangesSource,
    ReadType, StageInput, StageSink, StageSource, TableOp, TableRead, TxResultSpec, TxType,
};
pub use table::{ColumnInfo, TableInfo, TableKind, TablePartition};
pub use task::{
    Channel, ReadInfo, ShardReadInfo, Task, TaskInput, TaskInputKind, TaskMeta, TaskOutput,
    TaskOutputKind, TaskType,
};
