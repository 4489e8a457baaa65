//! Meridian Node -- library crate for the replication node.
//!
//! Exposes config, transports, the worker pool and node assembly so the
//! binary and the integration tests build nodes the same way.

pub mod config;
pub mod identity;
pub mod memory_transport;
pub mod node;
pub mod quic_transport;
pub mod transport;
pub mod worker;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn load_or_create_token(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated bearer token");
    Ok(token)
}

/// `host:port` part of a node url such as `http://db1.example:9925/`.
pub fn url_authority(url: &str) -> anyhow::Result<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        anyhow::bail!("node url {url:?} has no host");
    }
    if !authority.contains(':') {
        anyhow::bail!("node url {url:?} has no port");
    }
    Ok(authority)
}

/// Resolve a node url to the socket address its QUIC endpoint listens on.
///
/// The replication endpoint shares the port number of the node's HTTP API.
pub async fn resolve_node_url(url: &str) -> anyhow::Result<SocketAddr> {
    let authority = url_authority(url)?;
    tokio::net::lookup_host(authority)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {authority}"))
}
