//! Collaborators the executer talks to.
//!
//! Every call is fire-and-forget: answers come back as [`ExecuterEvent`]s
//! posted into the executer inbox through the supplied [`EventSender`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use quarry_common::{ActorId, ComputeStatus, ExecuterCounters, Issues, NodeId, ShardId, TxId};
use quarry_graph::PhysicalTx;

use crate::messages::{
    ChannelDataAck, ChannelsInfo, EventSender, ExecuterEvent, RateLimiterPath, StartTasksRequest,
};
use crate::resolver::PartitionPruner;

pub trait TableResolverService: Send + Sync {
    /// Starts a resolver helper; the outcome arrives as
    /// [`ExecuterEvent::TablesResolved`].
    fn resolve_tables(&self, tx_id: TxId, transactions: &[PhysicalTx], reply: EventSender) -> ActorId;

    /// Stops a resolver helper that has not answered yet.
    fn cancel(&self, resolver: ActorId);
}

pub trait ShardsResolverService: Send + Sync {
    /// The outcome arrives as [`ExecuterEvent::ShardsResolved`].
    fn resolve_shards(&self, tx_id: TxId, shards: BTreeSet<ShardId>, reply: EventSender) -> ActorId;

    fn cancel(&self, resolver: ActorId);
}

pub trait ResourceManager: Send + Sync {
    /// The outcome arrives as [`ExecuterEvent::ResourcesSnapshot`].
    fn request_cluster_resources(&self, reply: EventSender);
}

pub trait NodeTransport: Send + Sync {
    /// Delivers a start request to the node's task manager. Answers arrive
    /// as [`ExecuterEvent::StartTasksResponse`] or
    /// [`ExecuterEvent::Undelivered`]; losing the session to the node is
    /// reported as [`ExecuterEvent::NodeDisconnected`].
    fn start_tasks(&self, node: NodeId, request: StartTasksRequest, reply: EventSender);

    fn send_channels_info(&self, actor: ActorId, info: ChannelsInfo);

    fn abort_compute_actor(&self, actor: ActorId, status: ComputeStatus, issues: Issues);

    fn ack_channel_data(&self, ack: ChannelDataAck);

    /// Drops disconnect subscriptions taken by `start_tasks`.
    fn unsubscribe(&self, nodes: &[NodeId]);
}

pub trait RateLimiter: Send + Sync {
    /// Bills `ru` request units; returns the reporting helper.
    fn report_resource_usage(&self, ru: u64, path: &RateLimiterPath) -> ActorId;
}

pub trait SecretsService: Send + Sync {
    /// Snapshots arrive as [`ExecuterEvent::SecretsSnapshot`] until
    /// unsubscribed.
    fn subscribe(&self, user_sid: Option<&str>, names: &[String], reply: EventSender) -> u64;

    fn unsubscribe(&self, subscription: u64);
}

pub trait PipeCache: Send + Sync {
    /// Drops the cached pipe so the next request reconnects.
    fn force_reconnect(&self, shard: ShardId);
}

pub trait Timer: Send + Sync {
    /// Posts `event` to `reply` once `delay` has passed.
    fn schedule(&self, delay: Duration, event: ExecuterEvent, reply: EventSender);
}

pub trait TimeProvider: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeProvider for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock advanced explicitly, for deterministic runs.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything an executer needs from the outside world.
#[derive(Clone)]
pub struct ExecuterServices {
    pub table_resolver: Arc<dyn TableResolverService>,
    pub shards_resolver: Arc<dyn ShardsResolverService>,
    pub resource_manager: Arc<dyn ResourceManager>,
    pub transport: Arc<dyn NodeTransport>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub secrets: Arc<dyn SecretsService>,
    pub pipe_cache: Arc<dyn PipeCache>,
    pub timer: Arc<dyn Timer>,
    pub clock: Arc<dyn TimeProvider>,
    pub partition_pruner: Arc<dyn PartitionPruner>,
    pub counters: Arc<ExecuterCounters>,
}
