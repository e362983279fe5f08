//! Common crate
//!
//! Identifiers, status codes, issues, counters and the shared error type
//! used by the Quarry executer crates.
//!
//! # Example
//! ```rust
//! use quarry_common::{Issue, Issues, StatusCode};
//! let issues = Issues::single(Issue::new("shard resolve failed"));
//! assert!(!StatusCode::Unavailable.is_success());
//! assert_eq!(issues.len(), 1);
//! ```

pub mod counters;
pub mod error;
pub mod ids;
pub mod issue;
pub mod status;

pub use counters::{Counter, DbCountersRegistry, ExecuterCounters};
pub use error::{Error, Result};
pub use ids::{ActorId, ChannelId, NodeId, ShardId, StageId, TableId, TaskId, TxId};
pub use issue::{Issue, IssueCode, Issues};
pub use status::{ComputeStatus, StatusCode};
