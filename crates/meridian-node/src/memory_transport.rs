//! In-process network of replication endpoints.
//!
//! Nodes attach their source side under their url; dialling a url opens a
//! `tokio::io::duplex` pipe and serves the far end on a spawned task. Used to
//! run several nodes inside one test process. A node can be cut off the
//! network entirely (`detach`) or only from one dialler (`partition`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::transport::{ConnectFuture, Connector, SessionStream, SourceContext, TransportError};

const PIPE_BUFFER: usize = 64 * 1024;

/// (dialling node name, target url)
type Link = (String, String);

#[derive(Default)]
struct State {
    endpoints: HashMap<String, SourceContext>,
    /// Fires to close every open session on a link.
    links: HashMap<Link, broadcast::Sender<()>>,
    blocked: HashSet<Link>,
}

impl State {
    fn cut(&mut self, keep: impl Fn(&Link) -> bool) {
        self.links.retain(|link, closed| {
            if keep(link) {
                return true;
            }
            let _ = closed.send(());
            false
        });
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<State>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Connect("network lock poisoned".into()))
    }

    /// Make `context` reachable at `url`, replacing any previous endpoint.
    pub fn attach(&self, url: &str, context: SourceContext) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if state.endpoints.insert(url.to_string(), context).is_some() {
            state.cut(|(_, target)| target != url);
        }
        tracing::debug!(url, "endpoint attached");
    }

    /// Take `url` off the network and drop every session it is serving.
    pub fn detach(&self, url: &str) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        state.cut(|(_, target)| target != url);
        let removed = state.endpoints.remove(url).is_some();
        tracing::debug!(url, removed, "endpoint detached");
        removed
    }

    pub fn is_attached(&self, url: &str) -> bool {
        self.lock()
            .map(|s| s.endpoints.contains_key(url))
            .unwrap_or(false)
    }

    /// Stop `dialer` from reaching `url`, closing its open sessions there.
    pub fn partition(&self, dialer: &str, url: &str) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        let link = (dialer.to_string(), url.to_string());
        state.cut(|l| *l != link);
        state.blocked.insert(link);
        tracing::debug!(dialer, url, "link partitioned");
    }

    pub fn heal(&self, dialer: &str, url: &str) {
        if let Ok(mut state) = self.lock() {
            state.blocked.remove(&(dialer.to_string(), url.to_string()));
            tracing::debug!(dialer, url, "link healed");
        }
    }
}

impl Connector for MemoryNetwork {
    fn connect<'a>(&'a self, peer: &'a str, url: &'a str, local_name: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let (context, closed) = {
                let mut state = self.lock()?;
                let link = (local_name.to_string(), url.to_string());
                if state.blocked.contains(&link) {
                    return Err(TransportError::Unreachable(url.to_string()));
                }
                let context = state
                    .endpoints
                    .get(url)
                    .cloned()
                    .ok_or_else(|| TransportError::Unreachable(url.to_string()))?;
                let closed = state
                    .links
                    .entry(link)
                    .or_insert_with(|| broadcast::channel(1).0)
                    .subscribe();
                (context, closed)
            };
            if context.local_name != peer {
                return Err(TransportError::Connect(format!(
                    "{url} answers as {}, expected {peer}",
                    context.local_name
                )));
            }

            let (client, server) = tokio::io::duplex(PIPE_BUFFER);
            let subscriber = local_name.to_string();
            tokio::spawn(async move {
                let (reader, writer) = tokio::io::split(server);
                if let Err(e) = context.serve(&subscriber, reader, writer, closed).await {
                    tracing::debug!(peer = %subscriber, error = %e, "memory session ended");
                }
            });

            let (reader, writer) = tokio::io::split(client);
            Ok(SessionStream {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })
        })
    }
}
