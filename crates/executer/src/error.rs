use quarry_common::{Issue, IssueCode, Issues, StatusCode, TaskId};
use quarry_graph::GraphError;
use thiserror::Error;

/// Failure of an executer phase.
///
/// Every variant maps onto the status and issues of the terminal reply
/// through [`ExecuterError::status`] and [`ExecuterError::issues`].
#[derive(Error, Debug)]
pub enum ExecuterError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Plan(#[from] quarry_common::Error),

    #[error("Tasks graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Failed to serialize task: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Failed to build structured token: {0}")]
    Token(#[from] serde_json::Error),

    #[error("An internal error occurred: {0}")]
    Internal(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{message}")]
    Overloaded { message: String },

    #[error("{message}")]
    PreconditionFailed { message: String },

    #[error("Datashard program size limit exceeded ({size} > {limit})")]
    TaskTooLarge { task: TaskId, size: usize, limit: usize },

    #[error("Request failed with {status}")]
    Failed { status: StatusCode, issues: Issues },
}

impl ExecuterError {
    pub fn internal(message: impl Into<String>) -> Self {
        ExecuterError::Internal(message.into())
    }

    pub fn failed(status: StatusCode, issues: Issues) -> Self {
        ExecuterError::Failed { status, issues }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ExecuterError::Config(_)
            | ExecuterError::Plan(_)
            | ExecuterError::Graph(_)
            | ExecuterError::Serialization(_)
            | ExecuterError::Token(_)
            | ExecuterError::Internal(_) => StatusCode::InternalError,
            ExecuterError::Unavailable(_) => StatusCode::Unavailable,
            ExecuterError::Overloaded { .. } => StatusCode::Overloaded,
            ExecuterError::PreconditionFailed { .. } => StatusCode::PreconditionFailed,
            ExecuterError::TaskTooLarge { .. } => StatusCode::Aborted,
            ExecuterError::Failed { status, .. } => *status,
        }
    }

    pub fn issues(&self) -> Issues {
        match self {
            ExecuterError::Config(_)
            | ExecuterError::Plan(_)
            | ExecuterError::Graph(_)
            | ExecuterError::Serialization(_)
            | ExecuterError::Token(_) => internal_error_issues(self.to_string()),
            ExecuterError::Internal(message) => internal_error_issues(message.clone()),
            ExecuterError::Unavailable(message) => unavailable_issues(message.clone()),
            ExecuterError::Overloaded { message } => {
                Issues::single(Issue::with_code(IssueCode::Overloaded, message.clone()))
            }
            ExecuterError::PreconditionFailed { message } => {
                Issues::single(Issue::with_code(IssueCode::PreconditionFailed, message.clone()))
            }
            ExecuterError::TaskTooLarge { .. } => Issues::single(Issue::with_code(
                IssueCode::ShardProgramSizeExceeded,
                self.to_string(),
            )),
            ExecuterError::Failed { issues, .. } => issues.clone(),
        }
    }
}

/// Wraps `message` into the generic internal error issue.
pub fn internal_error_issues(message: impl Into<String>) -> Issues {
    let mut issue = Issue::with_code(
        IssueCode::Unexpected,
        "Internal error while executing transaction.",
    );
    issue.add_sub_issue(Issue::new(message));
    Issues::single(issue)
}

pub fn unavailable_issues(message: impl Into<String>) -> Issues {
    let mut issue = Issue::with_code(
        IssueCode::TemporarilyUnavailable,
        "Cluster or one of its subsystems is temporarily unavailable.",
    );
    issue.add_sub_issue(Issue::new(message));
    Issues::single(issue)
}
