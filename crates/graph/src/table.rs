//! Resolved table metadata.

use quarry_common::{ShardId, TableId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Row-oriented table served by datashards.
    Datashard,
    /// Column-oriented table.
    Olap,
    SysView,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: u32,
    pub name: String,
    pub type_name: String,
}

/// A shard owning the half-open key interval that ends at `end_key`.
///
/// Partitions are sorted; the first starts at minus infinity and the last
/// has no end key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePartition {
    pub shard_id: ShardId,
    pub end_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub path: String,
    pub schema_version: u64,
    pub kind: TableKind,
    pub key_column_types: Vec<String>,
    pub columns: Vec<ColumnInfo>,
    pub partitions: Vec<TablePartition>,
}

impl TableInfo {
    pub fn new(id: TableId, path: impl Into<String>, kind: TableKind) -> Self {
        Self {
            id,
            path: path.into(),
            schema_version: 1,
            kind,
            key_column_types: Vec::new(),
            columns: Vec::new(),
            partitions: Vec::new(),
        }
    }

    pub fn is_olap(&self) -> bool {
        self.kind == TableKind::Olap
    }

    /// Iterates partitions as `(shard, lo, hi)` with `hi == None` meaning
    /// plus infinity.
    pub fn partition_bounds(&self) -> impl Iterator<Item = (ShardId, &[u8], Option<&[u8]>)> {
        let mut lo: &[u8] = &[];
        self.partitions.iter().map(move |partition| {
            let start = lo;
            if let Some(end) = &partition.end_key {
                lo = end.as_slice();
            }
            (partition.shard_id, start, partition.end_key.as_deref())
        })
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.partitions.iter().map(|p| p.shard_id).collect()
    }
}
