//! Executer crate
//!
//! Turns a physical plan into a graph of compute tasks spread across the
//! cluster and follows the query until every task finished. An
//! [`Executer`] is a single-threaded state machine fed through its inbox;
//! [`spawn_executer`] hosts one on a tokio runtime.
//!
//! # Example
//! ```rust
//! use quarry_executer::{DataStrategy, ExecuterSettings, ExecutionStrategy, ScanStrategy};
//! use quarry_graph::TasksGraph;
//! let settings = ExecuterSettings::default();
//! assert_eq!(settings.retries.max_retry_number, 10);
//! let graph = TasksGraph::new();
//! assert!(ScanStrategy.needs_resources_snapshot(&graph));
//! assert!(!DataStrategy.needs_resources_snapshot(&graph));
//! ```

pub mod admission;
pub mod builder;
pub mod channels;
pub mod config;
pub mod error;
pub mod executer;
pub mod messages;
pub mod planner;
pub mod resolver;
pub mod resource_usage;
pub mod results;
pub mod runtime;
pub mod services;
pub mod stats;

pub use admission::{NodeResources, ResourcesSnapshot};
pub use crate::config::{AggregationSettings, ExecuterSettings, RetrySettings};
pub use error::ExecuterError;
pub use executer::{
    DataStrategy, Executer, ExecuterReply, ExecuterState, ExecutionStrategy, ScanStrategy,
    TxResponse, WaitPhase,
};
pub use messages::{EventSender, ExecuterEvent, TxRequest};
pub use planner::Planner;
pub use resolver::{PartitionPruner, RangePartitionPruner, ShardsResolveStatus, TableResolveStatus};
pub use results::{result_stream, ResultStream, StreamBatch, TxResult};
pub use runtime::{init_tracing, spawn_executer, ExecuterHandle, TokioTimer};
pub use services::ExecuterServices;
pub use stats::{QueryExecutionStats, TaskStats};
