use quarry_common::{ChannelId, StageId, TaskId};
use thiserror::Error;

/// Misuse of the tasks graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Unknown stage: {0}")]
    UnknownStage(StageId),
    #[error("Stage {0} is already registered")]
    DuplicateStage(StageId),
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),
    #[error("Task {task} has no port {index}")]
    UnknownPort { task: TaskId, index: usize },
    #[error("Task {0} shares glued metadata which cannot be mutated")]
    GluedMetaMutation(TaskId),
    #[error("Broken graph invariant: {0}")]
    BrokenInvariant(String),
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;
