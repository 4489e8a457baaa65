//! Connection identities backed by the node registry.

use std::sync::Arc;

use meridian_protocol::{ConnectionIdentity, IdentityProvider, LocalIdentity, PeerIdentity, ProtocolError, SystemInfo};
use meridian_registry::NodeRegistry;

/// Presents our leaf certificate and trusts the CA a peer registered with.
pub struct RegistryIdentity {
    local: LocalIdentity,
    registry: Arc<NodeRegistry>,
}

impl RegistryIdentity {
    pub fn new(local: LocalIdentity, registry: Arc<NodeRegistry>) -> Self {
        Self { local, registry }
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }
}

impl IdentityProvider for RegistryIdentity {
    fn connection_identity(&self, peer: &str) -> Result<ConnectionIdentity, ProtocolError> {
        let record = self
            .registry
            .get(peer)
            .map_err(|e| ProtocolError::Tls(format!("registry lookup for {peer}: {e}")))?
            .record()
            .ok_or_else(|| ProtocolError::Tls(format!("unknown peer {peer}")))?;
        if record.ca.is_empty() {
            return Err(ProtocolError::Tls(format!("no CA registered for {peer}")));
        }
        Ok(ConnectionIdentity {
            cert: self.local.leaf_cert.clone(),
            key: self.local.leaf_key.clone(),
            trusted_cas: vec![record.ca],
        })
    }
}

/// What this node tells peers about itself during registration.
pub fn peer_identity(local: &LocalIdentity, url: &str, databases: &[String], workers: usize) -> PeerIdentity {
    PeerIdentity {
        name: local.node_name.clone(),
        url: url.to_string(),
        ca: local.ca_cert.clone(),
        ca_info: Some(local.ca_info.clone()),
        system_info: Some(SystemInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            databases: databases.to_vec(),
            workers,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_registry::NodePatch;

    #[test]
    fn test_trusts_registered_ca() {
        let registry = Arc::new(NodeRegistry::open_in_memory().unwrap());
        let ours = LocalIdentity::generate("node-a").unwrap();
        let theirs = LocalIdentity::generate("node-b").unwrap();
        registry
            .ensure(
                "node-b",
                &NodePatch::from_identity(&peer_identity(&theirs, "http://b:9925", &[], 1)),
            )
            .unwrap();

        let provider = RegistryIdentity::new(ours.clone(), registry);
        let id = provider.connection_identity("node-b").unwrap();
        assert_eq!(id.cert, ours.leaf_cert);
        assert_eq!(id.trusted_cas, vec![theirs.ca_cert]);
    }

    #[test]
    fn test_unknown_or_caless_peer_fails() {
        let registry = Arc::new(NodeRegistry::open_in_memory().unwrap());
        registry
            .ensure(
                "node-c",
                &NodePatch {
                    url: Some("http://c:9925".into()),
                    ..NodePatch::default()
                },
            )
            .unwrap();
        let provider = RegistryIdentity::new(LocalIdentity::generate("node-a").unwrap(), registry);
        assert!(provider.connection_identity("node-b").is_err());
        assert!(provider.connection_identity("node-c").is_err());
    }

    #[test]
    fn test_peer_identity_fields() {
        let local = LocalIdentity::generate("node-a").unwrap();
        let id = peer_identity(&local, "http://a:9925", &["data".into()], 3);
        assert_eq!(id.name, "node-a");
        assert_eq!(id.ca, local.ca_cert);
        let info = id.system_info.unwrap();
        assert_eq!(info.databases, vec!["data"]);
        assert_eq!(info.workers, 3);
    }
}
