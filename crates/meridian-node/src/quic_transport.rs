//! QUIC transport -- endpoint management, accept/dial, stream preamble.
//!
//! Every replication session is one bidirectional QUIC stream opened by the
//! subscriber. The stream starts with a protocol byte and the subscriber's
//! node name (`[0x01][len: u8][name]`); replication frames follow.

use std::net::SocketAddr;
use std::sync::Arc;

use meridian_protocol::tls::{build_client_config, build_server_config};
use meridian_protocol::{IdentityProvider, LocalIdentity, ReplicationTiming};
use tokio::sync::broadcast;

use crate::transport::{ConnectFuture, Connector, SessionStream, SourceContext, TransportError};

/// Protocol stream identifiers.
pub const PROTO_REPLICATION: u8 = 0x01;

/// QUIC transport layer.
pub struct QuicTransport {
    pub endpoint: quinn::Endpoint,
    identity: Arc<dyn IdentityProvider>,
    timing: ReplicationTiming,
}

impl QuicTransport {
    /// Bind to `listen_addr`, presenting `local`'s leaf certificate to dialling peers.
    ///
    /// Outbound connections trust whatever CA `identity` returns for the peer.
    pub fn bind(
        listen_addr: SocketAddr,
        local: &LocalIdentity,
        identity: Arc<dyn IdentityProvider>,
        timing: ReplicationTiming,
    ) -> Result<Self, TransportError> {
        let server_config = build_server_config(&local.own_identity(), &timing)?;
        let endpoint = quinn::Endpoint::server(server_config, listen_addr)?;
        Ok(Self {
            endpoint,
            identity,
            timing,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Dial `peer` at `addr`, verifying its certificate against the peer's registered CA.
    pub async fn dial(&self, peer: &str, addr: SocketAddr) -> Result<quinn::Connection, TransportError> {
        let identity = self.identity.connection_identity(peer)?;
        let client_config = build_client_config(&identity, &self.timing)?;
        let conn = self
            .endpoint
            .connect_with(client_config, addr, peer)
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(conn)
    }

    /// Run the accept loop -- spawns a task per inbound connection.
    pub async fn listen(&self, context: SourceContext, shutdown: broadcast::Receiver<()>) {
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    match incoming {
                        Some(incoming) => {
                            let context = context.clone();
                            let shutdown = shutdown.resubscribe();
                            tokio::spawn(async move {
                                match incoming.await {
                                    Ok(conn) => {
                                        tracing::info!(
                                            remote = %conn.remote_address(),
                                            "accepted inbound connection"
                                        );
                                        run_connection(conn, context, shutdown).await;
                                    }
                                    Err(e) => {
                                        tracing::warn!("failed to accept connection: {e}");
                                    }
                                }
                            });
                        }
                        None => {
                            tracing::info!("endpoint closed, stopping accept loop");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal, stopping accept loop");
                    self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
                    break;
                }
            }
        }
    }
}

/// Accept streams on one connection and dispatch by protocol byte.
pub async fn run_connection(
    conn: quinn::Connection,
    context: SourceContext,
    shutdown: broadcast::Receiver<()>,
) {
    let remote = conn.remote_address();

    loop {
        match conn.accept_bi().await {
            Ok((send, mut recv)) => {
                let context = context.clone();
                let shutdown = shutdown.resubscribe();
                tokio::spawn(async move {
                    // Read protocol byte
                    let mut proto_buf = [0u8; 1];
                    if let Err(e) = recv.read_exact(&mut proto_buf).await {
                        tracing::debug!("failed to read protocol byte: {e}");
                        return;
                    }

                    match proto_buf[0] {
                        PROTO_REPLICATION => {
                            let peer = match read_name(&mut recv).await {
                                Ok(peer) => peer,
                                Err(e) => {
                                    tracing::debug!(%remote, "bad replication preamble: {e}");
                                    return;
                                }
                            };
                            if let Err(e) = context.serve(&peer, recv, send, shutdown).await {
                                tracing::warn!(%remote, peer = %peer, error = %e, "replication session failed");
                            }
                        }
                        other => {
                            tracing::warn!("unknown protocol byte: {other:#04x}");
                        }
                    }
                });
            }
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                tracing::info!(%remote, "connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!(%remote, "connection error: {e}");
                break;
            }
        }
    }
}

async fn read_name(recv: &mut quinn::RecvStream) -> Result<String, TransportError> {
    let mut len = [0u8; 1];
    recv.read_exact(&mut len)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let mut name = vec![0u8; len[0] as usize];
    recv.read_exact(&mut name)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    String::from_utf8(name).map_err(|_| TransportError::Connect("node name is not utf-8".into()))
}

/// Open a bidirectional stream with a protocol byte prefix.
pub async fn open_protocol_stream(
    conn: &quinn::Connection,
    protocol: u8,
) -> Result<(quinn::SendStream, quinn::RecvStream), TransportError> {
    let (mut send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    send.write_all(&[protocol])
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    Ok((send, recv))
}

impl Connector for QuicTransport {
    fn connect<'a>(&'a self, peer: &'a str, url: &'a str, local_name: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let addr = crate::resolve_node_url(url)
                .await
                .map_err(|e| TransportError::Unreachable(format!("{url}: {e}")))?;
            let conn = self.dial(peer, addr).await?;
            let (mut send, recv) = open_protocol_stream(&conn, PROTO_REPLICATION).await?;

            let name = local_name.as_bytes();
            let len = u8::try_from(name.len())
                .map_err(|_| TransportError::Connect(format!("node name too long: {local_name}")))?;
            let mut preamble = Vec::with_capacity(name.len() + 1);
            preamble.push(len);
            preamble.extend_from_slice(name);
            send.write_all(&preamble)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            Ok(SessionStream {
                reader: Box::new(recv),
                writer: Box::new(send),
            })
        })
    }
}
