//! Outbound calls to another node's registration routes.

use std::future::Future;
use std::pin::Pin;

use meridian_protocol::{RegisterRequest, RegisterResponse, RemoveRequest};
use serde::{de::DeserializeOwned, Serialize};

use crate::{ApiError, ErrorBody};

pub type PeerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Client side of the peer registration handshake.
pub trait PeerClient: Send + Sync {
    fn register<'a>(
        &'a self,
        url: &'a str,
        token: Option<&'a str>,
        request: RegisterRequest,
    ) -> PeerFuture<'a, RegisterResponse>;

    fn remove<'a>(
        &'a self,
        url: &'a str,
        token: Option<&'a str>,
        request: RemoveRequest,
    ) -> PeerFuture<'a, ()>;
}

pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        path: &str,
        token: Option<&str>,
        body: &B,
    ) -> Result<R, ApiError> {
        let peer_err = |message: String| ApiError::Peer {
            url: url.to_string(),
            message,
        };
        let endpoint = format!("{}{}", url.trim_end_matches('/'), path);
        let mut request = self.client.post(&endpoint).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| peer_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(peer_err(format!("{status}: {message}")));
        }
        resp.json().await.map_err(|e| peer_err(e.to_string()))
    }
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerClient for HttpPeerClient {
    fn register<'a>(
        &'a self,
        url: &'a str,
        token: Option<&'a str>,
        request: RegisterRequest,
    ) -> PeerFuture<'a, RegisterResponse> {
        Box::pin(async move {
            self.post(url, "/api/v1/replication/register", token, &request)
                .await
        })
    }

    fn remove<'a>(
        &'a self,
        url: &'a str,
        token: Option<&'a str>,
        request: RemoveRequest,
    ) -> PeerFuture<'a, ()> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .post(url, "/api/v1/replication/remove", token, &request)
                .await?;
            Ok(())
        })
    }
}
