//! Identifier newtypes shared by the graph and the executer.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(
    /// Transaction id assigned by the session layer.
    TxId(u64),
    "tx:"
);
id_newtype!(
    /// Cluster node id.
    NodeId(u32),
    "node:"
);
id_newtype!(
    /// Storage shard (tablet) id.
    ShardId(u64),
    "shard:"
);
id_newtype!(
    /// Task id, dense and unique within one tasks graph.
    TaskId(u64),
    "task:"
);
id_newtype!(
    /// Channel id, dense and unique within one tasks graph.
    ChannelId(u64),
    "channel:"
);
id_newtype!(
    /// Table id as known to the schema catalog.
    TableId(u64),
    "table:"
);

/// Stage identity: physical transaction index plus stage index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId {
    pub tx: u32,
    pub stage: u32,
}

impl StageId {
    pub fn new(tx: u32, stage: u32) -> Self {
        Self { tx, stage }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage:{}/{}", self.tx, self.stage)
    }
}

/// Address of an actor (executer, compute actor, helper) in the cluster.
///
/// The node part is what node-loss handling keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId {
    pub node: NodeId,
    pub local: u64,
}

impl ActorId {
    pub fn new(node: NodeId, local: u64) -> Self {
        Self { node, local }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.node.0, self.local)
    }
}
