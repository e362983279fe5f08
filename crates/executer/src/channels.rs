//! Channel endpoint propagation.
//!
//! When a task gets its compute actor, every channel linking it to an
//! already running peer becomes fully addressable. Both actors learn the
//! new endpoints in one batched `ChannelsInfo` each.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use quarry_common::{ActorId, ChannelId, TaskId, TxId};
use quarry_graph::{Channel, GraphError, GraphResult, TasksGraph};
use tracing::trace;

use crate::messages::{ChannelDesc, ChannelsInfo, Endpoint};
use crate::services::NodeTransport;

pub type ChannelUpdates = BTreeMap<ActorId, BTreeSet<ChannelId>>;

/// Describes `channel` with every endpoint currently known.
pub fn channel_desc(graph: &TasksGraph, channel: &Channel) -> GraphResult<ChannelDesc> {
    let src = graph.task(channel.src_task)?;
    let dst_endpoint = match channel.dst_task {
        Some(dst) => Endpoint::from_actor(graph.task(dst)?.compute_actor),
        None => Endpoint::from_actor(
            graph.meta().result_channel_proxies.get(&channel.id).copied(),
        ),
    };
    Ok(ChannelDesc {
        id: channel.id,
        src_task: channel.src_task,
        src_endpoint: Endpoint::from_actor(src.compute_actor),
        dst_task: channel.dst_task,
        dst_endpoint,
        in_memory: channel.in_memory,
        transport_version: graph.meta().channel_transport_version,
    })
}

/// Adds the channels of `task_id` whose peer already has an actor.
pub fn collect_task_updates(
    graph: &TasksGraph,
    task_id: TaskId,
    updates: &mut ChannelUpdates,
) -> GraphResult<()> {
    let task = graph.task(task_id)?;
    let Some(actor) = task.compute_actor else {
        return Ok(());
    };

    for input in &task.inputs {
        for channel_id in &input.channels {
            let channel = graph.channel(*channel_id)?;
            if channel.dst_task != Some(task_id) {
                return Err(GraphError::BrokenInvariant(format!(
                    "{} is listed as an input of {} but ends elsewhere",
                    channel_id, task_id
                )));
            }
            if let Some(src_actor) = graph.task(channel.src_task)?.compute_actor {
                updates.entry(src_actor).or_default().insert(*channel_id);
                updates.entry(actor).or_default().insert(*channel_id);
            }
        }
    }

    for output in &task.outputs {
        for channel_id in &output.channels {
            let channel = graph.channel(*channel_id)?;
            let Some(dst) = channel.dst_task else {
                continue;
            };
            if let Some(dst_actor) = graph.task(dst)?.compute_actor {
                updates.entry(dst_actor).or_default().insert(*channel_id);
                updates.entry(actor).or_default().insert(*channel_id);
            }
        }
    }
    Ok(())
}

/// Remembers what each actor was told so repeated propagation is a no-op.
#[derive(Debug, Default)]
pub struct ChannelsPropagator {
    sent: HashMap<(ActorId, ChannelId), (Endpoint, Endpoint)>,
}

impl ChannelsPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends one `ChannelsInfo` per actor with the descriptors it has not
    /// seen yet. Returns the number of messages sent.
    pub fn propagate(
        &mut self,
        graph: &TasksGraph,
        tx_id: TxId,
        updates: ChannelUpdates,
        transport: &dyn NodeTransport,
    ) -> GraphResult<usize> {
        let mut messages = 0;
        for (actor, channel_ids) in updates {
            let mut channels = Vec::with_capacity(channel_ids.len());
            for channel_id in channel_ids {
                let desc = channel_desc(graph, graph.channel(channel_id)?)?;
                let endpoints = (desc.src_endpoint, desc.dst_endpoint);
                if self.sent.get(&(actor, channel_id)) == Some(&endpoints) {
                    continue;
                }
                self.sent.insert((actor, channel_id), endpoints);
                channels.push(desc);
            }
            if channels.is_empty() {
                continue;
            }
            trace!(%actor, channels = channels.len(), "sending channels info");
            transport.send_channels_info(actor, ChannelsInfo { tx_id, channels });
            messages += 1;
        }
        Ok(messages)
    }
}
