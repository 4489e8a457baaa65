//! Subscriber side of a replication session.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meridian_protocol::{
    DownstreamFrame, RequestedNode, SubscribeRequest, SubscriberCodec, SubscriptionNode,
    TableSelection, UpstreamFrame,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::decoder::TableDecoder;
use crate::store::AuditStore;
use crate::ReplicationError;

/// What one subscription should pull.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionPlan {
    pub database: String,
    /// Origins to request; the first is the node being dialled.
    pub nodes: Vec<SubscriptionNode>,
    pub tables: TableSelection,
}

impl SubscriptionPlan {
    pub fn primary(&self) -> Option<&SubscriptionNode> {
        self.nodes.first()
    }

    /// Build the SUBSCRIBE request, resuming each origin from what we already hold.
    pub fn request(&self, store: &dyn AuditStore) -> SubscribeRequest {
        let nodes: Vec<RequestedNode> = self
            .nodes
            .iter()
            .map(|node| {
                let configured = node.start_time.unwrap_or(0.0);
                let resume = store
                    .last_received_time(&self.database, &node.name)
                    .unwrap_or(0.0);
                RequestedNode {
                    name: node.name.clone(),
                    start_time: configured.max(resume),
                    end_time: node.end_time,
                }
            })
            .collect();
        SubscribeRequest {
            database: self.database.clone(),
            start_time: nodes.first().map_or(0.0, |n| n.start_time),
            nodes,
        }
    }
}

/// Run one subscription over an established stream until it closes.
///
/// Returns `Ok` when the source closes the stream or `shutdown` fires; any
/// protocol or apply failure is an error and the caller reconnects.
pub async fn run_subscription<R, W>(
    store: Arc<dyn AuditStore>,
    plan: &SubscriptionPlan,
    confirm_interval: Duration,
    max_frame_bytes: usize,
    reader: R,
    writer: W,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ReplicationError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(reader, SubscriberCodec::with_max(max_frame_bytes));
    let mut out = FramedWrite::new(writer, SubscriberCodec::with_max(max_frame_bytes));
    let database = plan.database.as_str();

    let request = plan.request(store.as_ref());
    tracing::debug!(database, start = request.start_time, nodes = ?request.nodes, "subscribing");
    out.send(UpstreamFrame::Subscribe(request)).await?;

    let mut decoder = TableDecoder::new();
    let mut received = 0f64;
    let mut reported = 0f64;
    let mut ticker = tokio::time::interval(confirm_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(DownstreamFrame::Transaction { txn_time, records })) => {
                    let txn = decoder.decode(txn_time, records, &plan.tables)?;
                    if !txn.entries.is_empty() {
                        let applied = store.apply_transaction(database, &txn)?;
                        tracing::trace!(database, txn_time, applied, "transaction applied");
                    }
                    received = received.max(txn_time);
                }
                Some(Ok(control)) => {
                    if let Some(update) = decoder.on_control(control) {
                        if plan.tables.includes(&update.name) {
                            store.ensure_table(database, &update.name, &update.structure)?;
                        }
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    tracing::debug!(database, "source closed stream");
                    return Ok(());
                }
            },
            _ = ticker.tick() => {
                if received > reported {
                    out.send(UpstreamFrame::ReceivedUpTo(received)).await?;
                    reported = received;
                }
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}
