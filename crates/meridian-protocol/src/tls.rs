//! Node certificates and QUIC TLS configuration.
//!
//! Each node owns a private CA and a leaf certificate whose subject
//! alternative name is the node name. Peers learn each other's CA through the
//! registration handshake; a dialling node verifies the source's leaf against
//! the CA stored in its registry record.
//! ALPN protocol: "meridian-repl/1".

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ProtocolError, ReplicationTiming};

/// ALPN protocol identifier.
pub const ALPN_MERIDIAN: &[u8] = b"meridian-repl/1";

/// Descriptive fields of a CA certificate, kept for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaInfo {
    pub issuer: String,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// SHA-256 of the DER certificate, lowercase hex.
    pub fingerprint: String,
}

/// Everything needed to open a TLS session to one peer.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    /// Our leaf certificate, DER.
    pub cert: Vec<u8>,
    /// Our leaf private key, PKCS#8 DER.
    pub key: Vec<u8>,
    /// CA certificates (DER) accepted for the remote side.
    pub trusted_cas: Vec<Vec<u8>>,
}

/// Certificate subsystem boundary: hand out a connection-ready identity.
pub trait IdentityProvider: Send + Sync {
    fn connection_identity(&self, peer: &str) -> Result<ConnectionIdentity, ProtocolError>;
}

pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn tls_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Tls(e.to_string())
}

/// This node's CA and leaf certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub node_name: String,
    #[serde(with = "crate::base64_bytes")]
    pub ca_cert: Vec<u8>,
    pub ca_info: CaInfo,
    #[serde(with = "crate::base64_bytes")]
    pub leaf_cert: Vec<u8>,
    #[serde(with = "crate::base64_bytes")]
    pub leaf_key: Vec<u8>,
}

impl LocalIdentity {
    /// Generate a fresh CA and a leaf certificate for `node_name`.
    pub fn generate(node_name: &str) -> Result<Self, ProtocolError> {
        let ca_key = rcgen::KeyPair::generate().map_err(tls_err)?;
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).map_err(tls_err)?;
        let ca_subject = format!("Meridian CA {node_name}");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.distinguished_name = rcgen::DistinguishedName::new();
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, ca_subject.clone());
        let not_before = ca_params.not_before.unix_timestamp();
        let not_after = ca_params.not_after.unix_timestamp();
        let ca = ca_params.self_signed(&ca_key).map_err(tls_err)?;

        let leaf_key = rcgen::KeyPair::generate().map_err(tls_err)?;
        let mut leaf_params =
            rcgen::CertificateParams::new(vec![node_name.to_string()]).map_err(tls_err)?;
        leaf_params.distinguished_name = rcgen::DistinguishedName::new();
        leaf_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, node_name);
        let leaf = leaf_params
            .signed_by(&leaf_key, &ca, &ca_key)
            .map_err(tls_err)?;

        let ca_cert = ca.der().to_vec();
        let ca_info = CaInfo {
            issuer: ca_subject.clone(),
            subject: ca_subject,
            not_before: DateTime::from_timestamp(not_before, 0).unwrap_or_default(),
            not_after: DateTime::from_timestamp(not_after, 0).unwrap_or_default(),
            fingerprint: fingerprint(&ca_cert),
        };

        Ok(Self {
            node_name: node_name.to_string(),
            ca_cert,
            ca_info,
            leaf_cert: leaf.der().to_vec(),
            leaf_key: leaf_key.serialize_der(),
        })
    }

    /// Load the identity stored at `path`, or generate and store a new one.
    ///
    /// A stored identity for a different node name is replaced.
    pub fn load_or_generate(path: &Path, node_name: &str) -> Result<Self, ProtocolError> {
        if path.exists() {
            let existing: LocalIdentity = serde_json::from_slice(&std::fs::read(path)?)?;
            if existing.node_name == node_name {
                return Ok(existing);
            }
            tracing::warn!(
                stored = %existing.node_name,
                node = %node_name,
                "stored identity belongs to another node, regenerating"
            );
        }

        let identity = Self::generate(node_name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&identity)?)?;
        tracing::info!(node = %node_name, fingerprint = %identity.ca_info.fingerprint, "generated node identity");
        Ok(identity)
    }

    /// Identity for a session where only our own CA is trusted.
    pub fn own_identity(&self) -> ConnectionIdentity {
        ConnectionIdentity {
            cert: self.leaf_cert.clone(),
            key: self.leaf_key.clone(),
            trusted_cas: vec![self.ca_cert.clone()],
        }
    }
}

impl IdentityProvider for LocalIdentity {
    fn connection_identity(&self, _peer: &str) -> Result<ConnectionIdentity, ProtocolError> {
        Ok(self.own_identity())
    }
}

fn transport_config(timing: &ReplicationTiming) -> Result<quinn::TransportConfig, ProtocolError> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(Duration::from_secs(timing.idle_timeout_secs))
            .map_err(tls_err)?,
    ));
    transport.keep_alive_interval(Some(Duration::from_secs(timing.keepalive_interval_secs)));
    Ok(transport)
}

/// QUIC server config presenting our leaf certificate.
pub fn build_server_config(
    identity: &ConnectionIdentity,
    timing: &ReplicationTiming,
) -> Result<quinn::ServerConfig, ProtocolError> {
    let cert = rustls::pki_types::CertificateDer::from(identity.cert.clone());
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(identity.key.clone()),
    );

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(tls_err)?;
    server_crypto.alpn_protocols = vec![ALPN_MERIDIAN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).map_err(tls_err)?,
    ));
    server_config.transport_config(Arc::new(transport_config(timing)?));
    Ok(server_config)
}

/// QUIC client config trusting only `identity.trusted_cas`.
pub fn build_client_config(
    identity: &ConnectionIdentity,
    timing: &ReplicationTiming,
) -> Result<quinn::ClientConfig, ProtocolError> {
    let mut roots = rustls::RootCertStore::empty();
    for ca in &identity.trusted_cas {
        roots
            .add(rustls::pki_types::CertificateDer::from(ca.clone()))
            .map_err(tls_err)?;
    }
    if roots.is_empty() {
        return Err(ProtocolError::Tls("no trusted CA for peer".into()));
    }

    let mut client_crypto = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN_MERIDIAN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto).map_err(tls_err)?,
    ));
    client_config.transport_config(Arc::new(transport_config(timing)?));
    Ok(client_config)
}
