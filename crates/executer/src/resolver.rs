//! Table and shard resolution results, and partition pruning.

use std::collections::BTreeMap;

use quarry_common::{Issues, NodeId, ShardId, StatusCode};
use quarry_graph::{KeyRange, TableInfo};

#[derive(Debug, Clone)]
pub struct TableResolveStatus {
    pub status: StatusCode,
    pub issues: Issues,
    pub tables: Vec<TableInfo>,
}

impl TableResolveStatus {
    pub fn success(tables: Vec<TableInfo>) -> Self {
        Self {
            status: StatusCode::Success,
            issues: Issues::new(),
            tables,
        }
    }

    pub fn failure(status: StatusCode, issues: Issues) -> Self {
        Self {
            status,
            issues,
            tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardsResolveStatus {
    pub status: StatusCode,
    pub issues: Issues,
    pub shard_nodes: BTreeMap<ShardId, NodeId>,
    pub unresolved: u32,
}

impl ShardsResolveStatus {
    pub fn success(shard_nodes: BTreeMap<ShardId, NodeId>) -> Self {
        Self {
            status: StatusCode::Success,
            issues: Issues::new(),
            shard_nodes,
            unresolved: 0,
        }
    }
}

/// Key ranges of a read that fall into one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedPartition {
    pub shard_id: ShardId,
    pub ranges: Vec<KeyRange>,
}

/// Maps key ranges onto the partitions of a resolved table.
pub trait PartitionPruner: Send + Sync {
    /// Returns the touched partitions in key order, each with its clipped
    /// ranges.
    fn prune(&self, table: &TableInfo, ranges: &[KeyRange]) -> Vec<PrunedPartition>;
}

/// Intersects every range with every partition interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct RangePartitionPruner;

impl PartitionPruner for RangePartitionPruner {
    fn prune(&self, table: &TableInfo, ranges: &[KeyRange]) -> Vec<PrunedPartition> {
        table
            .partition_bounds()
            .filter_map(|(shard_id, lo, hi)| {
                let clipped: Vec<KeyRange> =
                    ranges.iter().filter_map(|r| r.clip(lo, hi)).collect();
                if clipped.is_empty() {
                    None
                } else {
                    Some(PrunedPartition {
                        shard_id,
                        ranges: clipped,
                    })
                }
            })
            .collect()
    }
}
