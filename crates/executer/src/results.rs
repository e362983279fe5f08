//! Result channel proxies.
//!
//! Every result channel is bound to a local proxy. Streaming proxies
//! forward batches to the caller as they arrive; data proxies buffer them
//! into the final response. Both acknowledge every batch and drop
//! duplicates by sequence number.

use std::collections::BTreeMap;

use arrow::record_batch::RecordBatch;
use quarry_common::{ActorId, ChannelId};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{trace, warn};

use crate::messages::{ChannelData, ChannelDataAck};

/// Batch forwarded to the caller of a streaming query.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub query_result_index: u32,
    pub seq_no: u64,
    pub batch: RecordBatch,
}

pub type ResultStream = UnboundedReceiverStream<StreamBatch>;

/// Creates the caller side of a result stream.
pub fn result_stream() -> (UnboundedSender<StreamBatch>, ResultStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx))
}

/// One result of the response, in transaction result order.
#[derive(Debug, Clone, Default)]
pub struct TxResult {
    pub column_order: Vec<String>,
    pub is_stream: bool,
    pub query_result_index: Option<u32>,
    pub batches: Vec<RecordBatch>,
    pub rows: u64,
}

#[derive(Debug)]
enum ProxyKind {
    Stream {
        query_result_index: u32,
        sink: UnboundedSender<StreamBatch>,
    },
    Data,
}

#[derive(Debug)]
struct ResultProxy {
    result_index: usize,
    kind: ProxyKind,
    last_seq_no: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    Accepted { rows: u64 },
    Duplicate,
    UnknownChannel,
    StreamClosed,
}

#[derive(Debug, Default)]
pub struct ResultAggregator {
    proxies: BTreeMap<ChannelId, ResultProxy>,
    results: Vec<TxResult>,
}

impl ResultAggregator {
    pub fn new(results: Vec<TxResult>) -> Self {
        Self {
            proxies: BTreeMap::new(),
            results,
        }
    }

    /// Binds `channel` to a proxy feeding result `result_index`. Streams
    /// when the result is a streaming one and a sink is supplied.
    pub fn bind(
        &mut self,
        channel: ChannelId,
        proxy: ActorId,
        result_index: usize,
        stream: Option<UnboundedSender<StreamBatch>>,
    ) {
        let kind = match (self.results.get(result_index), stream) {
            (Some(result), Some(sink)) if result.is_stream => ProxyKind::Stream {
                query_result_index: result.query_result_index.unwrap_or(result_index as u32),
                sink,
            },
            _ => ProxyKind::Data,
        };
        trace!(%channel, %proxy, result_index, "result channel bound");
        self.proxies.insert(
            channel,
            ResultProxy {
                result_index,
                kind,
                last_seq_no: 0,
            },
        );
    }

    /// Consumes one data message. The returned ack is sent whatever the
    /// outcome, so a sender never waits on a dropped duplicate.
    pub fn on_data(&mut self, data: ChannelData) -> (DataOutcome, Option<ChannelDataAck>) {
        let Some(proxy) = self.proxies.get_mut(&data.channel) else {
            warn!(channel = %data.channel, "data for unknown result channel");
            return (DataOutcome::UnknownChannel, None);
        };
        let ack = ChannelDataAck {
            channel: data.channel,
            seq_no: data.seq_no,
            to: data.sender,
        };
        if data.seq_no <= proxy.last_seq_no {
            trace!(channel = %data.channel, seq_no = data.seq_no, "duplicate result data dropped");
            return (DataOutcome::Duplicate, Some(ack));
        }
        proxy.last_seq_no = data.seq_no;

        let Some(batch) = data.batch else {
            return (DataOutcome::Accepted { rows: 0 }, Some(ack));
        };
        let rows = batch.num_rows() as u64;
        if let Some(result) = self.results.get_mut(proxy.result_index) {
            result.rows += rows;
        }
        match &proxy.kind {
            ProxyKind::Stream {
                query_result_index,
                sink,
            } => {
                let sent = sink.send(StreamBatch {
                    query_result_index: *query_result_index,
                    seq_no: data.seq_no,
                    batch,
                });
                if sent.is_err() {
                    return (DataOutcome::StreamClosed, Some(ack));
                }
            }
            ProxyKind::Data => {
                if let Some(result) = self.results.get_mut(proxy.result_index) {
                    result.batches.push(batch);
                }
            }
        }
        (DataOutcome::Accepted { rows }, Some(ack))
    }

    /// Drops stream sinks and hands out buffered results.
    pub fn into_results(self) -> Vec<TxResult> {
        self.results
    }
}
