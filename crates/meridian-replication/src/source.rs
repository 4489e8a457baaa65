//! Source side of a replication session.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use meridian_protocol::{RequestedNode, SourceCodec, SubscribeRequest, UpstreamFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::audit::{AuditEntry, Transaction};
use crate::confirm::ConfirmationTracker;
use crate::encoder::TransactionEncoder;
use crate::store::AuditStore;
use crate::ReplicationError;

/// Which origins, and which time window per origin, a subscriber asked for.
#[derive(Debug, Clone)]
struct OriginFilter {
    nodes: Vec<RequestedNode>,
}

impl OriginFilter {
    fn from_request(request: &SubscribeRequest, local_name: &str) -> Self {
        let nodes = if request.nodes.is_empty() {
            vec![RequestedNode {
                name: local_name.to_string(),
                start_time: request.start_time,
                end_time: None,
            }]
        } else {
            request.nodes.clone()
        };
        Self { nodes }
    }

    fn earliest(&self) -> f64 {
        self.nodes
            .iter()
            .map(|n| n.start_time)
            .fold(f64::INFINITY, f64::min)
    }

    fn accepts(&self, entry: &AuditEntry) -> bool {
        self.nodes.iter().any(|n| {
            n.name == entry.origin
                && entry.version >= n.start_time
                && n.end_time.map_or(true, |end| entry.version < end)
        })
    }
}

/// Serve one subscriber until it disconnects or `shutdown` fires.
///
/// `peer` is the subscriber's node name; its RECEIVED_UP_TO reports advance
/// the confirmation slot for `(database, peer)`. Frames larger than
/// `max_frame_bytes` are refused in both directions.
#[allow(clippy::too_many_arguments)]
pub async fn serve_subscriber<R, W>(
    store: Arc<dyn AuditStore>,
    local_name: &str,
    peer: &str,
    tracker: &ConfirmationTracker,
    max_frame_bytes: usize,
    reader: R,
    writer: W,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ReplicationError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(reader, SourceCodec::with_max(max_frame_bytes));
    let mut out = FramedWrite::new(writer, SourceCodec::with_max(max_frame_bytes));

    let request = match frames.next().await {
        Some(Ok(UpstreamFrame::Subscribe(request))) => request,
        Some(Ok(UpstreamFrame::ReceivedUpTo(_))) => {
            return Err(ReplicationError::UnexpectedFrame(
                "RECEIVED_UP_TO before SUBSCRIBE",
            ))
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Ok(()),
    };
    let database = request.database.clone();
    let filter = OriginFilter::from_request(&request, local_name);
    tracing::info!(
        database = %database,
        peer = %peer,
        start = request.start_time,
        origins = filter.nodes.len(),
        "serving subscription"
    );

    // Attach to the live feed before the snapshot so nothing falls in between.
    let mut live = store.subscribe_commits(&database)?;
    let mut encoder = TransactionEncoder::new();

    let backlog: Vec<AuditEntry> = store
        .database_entries_since(&database, filter.earliest())?
        .into_iter()
        .filter(|e| filter.accepts(e))
        .collect();
    let mut sent = 0usize;
    for txn in Transaction::group(backlog) {
        sent += send_transaction(&mut out, &mut encoder, store.as_ref(), &database, &txn.entries, &filter).await?;
    }
    tracing::debug!(database = %database, peer = %peer, records = sent, "snapshot sent");

    // A previous session for this peer may still hold the slot; the claim is
    // retried on each report until it is released.
    let mut confirmations = match tracker.claim(&database, peer) {
        Ok(writer) => Some(writer),
        Err(e) => {
            tracing::warn!(database = %database, peer = %peer, error = %e, "confirmations not tracked yet");
            None
        }
    };

    loop {
        tokio::select! {
            commit = live.recv() => match commit {
                Ok(txn) => {
                    send_transaction(&mut out, &mut encoder, store.as_ref(), &database, &txn.entries, &filter).await?;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(ReplicationError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            frame = frames.next() => match frame {
                Some(Ok(UpstreamFrame::ReceivedUpTo(time))) => {
                    if confirmations.is_none() {
                        confirmations = tracker.claim(&database, peer).ok();
                        if confirmations.is_some() {
                            tracing::debug!(database = %database, peer = %peer, "confirmations tracked");
                        }
                    }
                    if let Some(writer) = &confirmations {
                        writer.advance(time);
                    }
                }
                Some(Ok(UpstreamFrame::Subscribe(_))) => {
                    return Err(ReplicationError::UnexpectedFrame("second SUBSCRIBE"));
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    tracing::debug!(database = %database, peer = %peer, "subscriber closed stream");
                    return Ok(());
                }
            },
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

async fn send_transaction<W>(
    out: &mut FramedWrite<W, SourceCodec>,
    encoder: &mut TransactionEncoder,
    store: &dyn AuditStore,
    database: &str,
    entries: &[AuditEntry],
    filter: &OriginFilter,
) -> Result<usize, ReplicationError>
where
    W: AsyncWrite + Unpin,
{
    let mut count = 0;
    for entry in entries.iter().filter(|e| filter.accepts(e)) {
        let structure = store.table_structure(database, &entry.table);
        encoder.push(entry, structure.as_ref())?;
        count += 1;
    }
    if count == 0 {
        return Ok(0);
    }
    encoder.flush();
    for frame in encoder.drain() {
        out.feed(frame).await?;
    }
    out.flush().await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditOp;
    use serde_json::Map;

    fn entry(origin: &str, version: f64) -> AuditEntry {
        AuditEntry {
            table: "dog".into(),
            key: "1".into(),
            origin: origin.into(),
            version,
            op: AuditOp::Put,
            record: Map::new(),
        }
    }

    #[test]
    fn test_default_origin_is_source() {
        let request = SubscribeRequest {
            database: "data".into(),
            start_time: 10.0,
            nodes: vec![],
        };
        let filter = OriginFilter::from_request(&request, "node-a");
        assert!(filter.accepts(&entry("node-a", 10.0)));
        assert!(!filter.accepts(&entry("node-a", 9.0)));
        assert!(!filter.accepts(&entry("node-b", 20.0)));
        assert_eq!(filter.earliest(), 10.0);
    }

    #[test]
    fn test_origin_windows() {
        let request = SubscribeRequest {
            database: "data".into(),
            start_time: 0.0,
            nodes: vec![
                RequestedNode {
                    name: "node-a".into(),
                    start_time: 5.0,
                    end_time: None,
                },
                RequestedNode {
                    name: "node-c".into(),
                    start_time: 1.0,
                    end_time: Some(3.0),
                },
            ],
        };
        let filter = OriginFilter::from_request(&request, "node-a");
        assert!(filter.accepts(&entry("node-c", 2.0)));
        assert!(!filter.accepts(&entry("node-c", 3.0)));
        assert!(filter.accepts(&entry("node-a", 100.0)));
        assert_eq!(filter.earliest(), 1.0);
    }
}
