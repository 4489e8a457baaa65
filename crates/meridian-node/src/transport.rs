//! Transport seam between replication workers and the network.
//!
//! A `Connector` opens one bidirectional byte stream to a peer's replication
//! endpoint. The accepting side hands every inbound stream to
//! `SourceContext::serve`, which runs the source half of the session.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use meridian_replication::{serve_subscriber, AuditStore, ConfirmationTracker, ReplicationError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

/// Errors while reaching a peer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    Unreachable(String),
    #[error("peer {0} has no url")]
    NoUrl(String),
    #[error("tls error: {0}")]
    Tls(#[from] meridian_protocol::ProtocolError),
    #[error("connect error: {0}")]
    Connect(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One established replication stream, already past the transport preamble.
pub struct SessionStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SessionStream, TransportError>> + Send + 'a>>;

/// Dials peers on behalf of replication workers.
pub trait Connector: Send + Sync + 'static {
    /// Open a stream to `peer` at `url`, announcing ourselves as `local_name`.
    fn connect<'a>(&'a self, peer: &'a str, url: &'a str, local_name: &'a str) -> ConnectFuture<'a>;
}

/// Everything the source side of a session needs.
#[derive(Clone)]
pub struct SourceContext {
    pub local_name: String,
    pub store: Arc<dyn AuditStore>,
    pub tracker: ConfirmationTracker,
    pub max_frame_bytes: usize,
}

impl SourceContext {
    /// Serve one inbound subscriber until it disconnects or `shutdown` fires.
    pub async fn serve<R, W>(
        &self,
        peer: &str,
        reader: R,
        writer: W,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ReplicationError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        serve_subscriber(
            self.store.clone(),
            &self.local_name,
            peer,
            &self.tracker,
            self.max_frame_bytes,
            reader,
            writer,
            shutdown,
        )
        .await
    }
}
