use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-facing status of a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    BadRequest,
    Unauthorized,
    InternalError,
    Aborted,
    Unavailable,
    Overloaded,
    SchemeError,
    GenericError,
    Timeout,
    BadSession,
    PreconditionFailed,
    Cancelled,
    Undetermined,
    Unsupported,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }

    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::BadRequest => "BAD_REQUEST",
            StatusCode::Unauthorized => "UNAUTHORIZED",
            StatusCode::InternalError => "INTERNAL_ERROR",
            StatusCode::Aborted => "ABORTED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Overloaded => "OVERLOADED",
            StatusCode::SchemeError => "SCHEME_ERROR",
            StatusCode::GenericError => "GENERIC_ERROR",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::BadSession => "BAD_SESSION",
            StatusCode::PreconditionFailed => "PRECONDITION_FAILED",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Undetermined => "UNDETERMINED",
            StatusCode::Unsupported => "UNSUPPORTED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status codes spoken by compute actors.
///
/// Compute actors use a narrower vocabulary than the client protocol;
/// [`ComputeStatus::to_status`] and [`ComputeStatus::from_status`] translate
/// between the two at the executer boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputeStatus {
    Unspecified,
    Success,
    BadRequest,
    Overloaded,
    Limits,
    InternalError,
    Aborted,
    Unavailable,
    Timeout,
    Cancelled,
    PreconditionFailed,
    GenericError,
}

impl ComputeStatus {
    pub fn to_status(self) -> StatusCode {
        match self {
            ComputeStatus::Unspecified => StatusCode::Unsupported,
            ComputeStatus::Success => StatusCode::Success,
            ComputeStatus::BadRequest => StatusCode::BadRequest,
            ComputeStatus::Overloaded => StatusCode::Overloaded,
            ComputeStatus::Limits => StatusCode::PreconditionFailed,
            ComputeStatus::InternalError => StatusCode::InternalError,
            ComputeStatus::Aborted => StatusCode::Aborted,
            ComputeStatus::Unavailable => StatusCode::Unavailable,
            ComputeStatus::Timeout => StatusCode::Timeout,
            ComputeStatus::Cancelled => StatusCode::Cancelled,
            ComputeStatus::PreconditionFailed => StatusCode::PreconditionFailed,
            ComputeStatus::GenericError => StatusCode::GenericError,
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::Success => ComputeStatus::Success,
            StatusCode::BadRequest => ComputeStatus::BadRequest,
            StatusCode::Overloaded => ComputeStatus::Overloaded,
            StatusCode::InternalError => ComputeStatus::InternalError,
            StatusCode::Aborted => ComputeStatus::Aborted,
            StatusCode::Unavailable => ComputeStatus::Unavailable,
            StatusCode::Timeout => ComputeStatus::Timeout,
            StatusCode::Cancelled => ComputeStatus::Cancelled,
            StatusCode::PreconditionFailed => ComputeStatus::PreconditionFailed,
            StatusCode::GenericError
            | StatusCode::SchemeError
            | StatusCode::Unauthorized
            | StatusCode::BadSession
            | StatusCode::Undetermined
            | StatusCode::Unsupported => ComputeStatus::GenericError,
        }
    }
}
