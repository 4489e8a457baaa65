//! Node membership operations behind the HTTP routes.

use meridian_protocol::{RegisterRequest, RegisterResponse, RemoveRequest};
use meridian_registry::{NodePatch, Replicates, Subscription};
use serde::{Deserialize, Serialize};

use crate::{ApiError, AppState};

#[derive(Debug, Clone, Deserialize)]
pub struct AddNodeRequest {
    pub url: String,
    #[serde(default)]
    pub subscriptions: Option<Vec<Subscription>>,
    #[serde(default)]
    pub replicates: Option<Replicates>,
    #[serde(default)]
    pub shard: Option<u32>,
    /// Bearer token for the remote node's API.
    #[serde(default)]
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveNodeRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn add_node(state: &AppState, req: AddNodeRequest) -> Result<MessageResponse, ApiError> {
    validate(&req)?;
    if state.registry.find_by_url(&req.url)?.is_some() {
        return Err(ApiError::Conflict(
            "node already added, use update_node".into(),
        ));
    }
    let name = handshake(state, &req).await?;
    Ok(MessageResponse {
        message: format!("Successfully added '{name}' to cluster"),
    })
}

pub async fn update_node(
    state: &AppState,
    req: AddNodeRequest,
) -> Result<MessageResponse, ApiError> {
    validate(&req)?;
    let name = handshake(state, &req).await?;
    Ok(MessageResponse {
        message: format!("Successfully updated '{name}'"),
    })
}

fn validate(req: &AddNodeRequest) -> Result<(), ApiError> {
    if req.url.trim().is_empty() {
        return Err(ApiError::BadRequest("url is required".into()));
    }
    if req.subscriptions.is_none() && req.replicates.is_none() {
        return Err(ApiError::BadRequest(
            "either subscriptions or replicates is required".into(),
        ));
    }
    if let Some(subs) = &req.subscriptions {
        if let Some(bad) = subs.iter().find(|s| s.database.is_empty()) {
            return Err(ApiError::BadRequest(format!(
                "subscription is missing a database: {bad:?}"
            )));
        }
    }
    Ok(())
}

/// Exchange identities with the node at `req.url` and record it locally.
async fn handshake(state: &AppState, req: &AddNodeRequest) -> Result<String, ApiError> {
    let mirrored: Option<Vec<Subscription>> = req
        .subscriptions
        .as_ref()
        .map(|subs| subs.iter().map(Subscription::mirrored).collect());
    let request = RegisterRequest {
        identity: state.identity.clone(),
        subscriptions: mirrored.map(serde_json::to_value).transpose()?,
        replicates: req.replicates.map(serde_json::to_value).transpose()?,
    };
    let RegisterResponse { identity: remote } = state
        .peers
        .register(&req.url, req.authorization.as_deref(), request)
        .await?;
    if remote.name == state.identity.name {
        return Err(ApiError::BadRequest(format!(
            "{} is this node, not a peer",
            req.url
        )));
    }

    let mut patch = NodePatch::from_identity(&remote);
    patch.url = Some(req.url.clone());
    patch.subscriptions = req.subscriptions.clone();
    patch.replicates = req.replicates;
    patch.shard = req.shard;
    state.registry.restore(&remote.name, &patch)?;
    tracing::info!(
        node = %remote.name,
        url = %req.url,
        replicates = ?req.replicates,
        "node registered"
    );
    Ok(remote.name)
}

/// Remove a node by name or url.
///
/// A node with explicit subscriptions is deleted outright. A fully
/// replicating node is kept but downgraded so it stops replicating.
pub async fn remove_node(
    state: &AppState,
    req: RemoveNodeRequest,
) -> Result<MessageResponse, ApiError> {
    let record = match (&req.name, &req.url) {
        (Some(name), _) => state.registry.get(name)?.record(),
        (None, Some(url)) => state.registry.find_by_url(url)?,
        (None, None) => return Err(ApiError::BadRequest("name or url is required".into())),
    }
    .ok_or_else(|| ApiError::NotFound("node not found".into()))?;

    if record.replicates_fully() && record.subscriptions.is_empty() {
        let patch = NodePatch {
            replicates: Some(Replicates::Disabled),
            ..NodePatch::default()
        };
        state.registry.ensure(&record.name, &patch)?;
        tracing::info!(node = %record.name, "node downgraded, replication disabled");
    } else {
        state.registry.delete(&record.name)?;
        tracing::info!(node = %record.name, "node deleted");
    }

    if let Some(url) = &record.url {
        let notice = RemoveRequest {
            name: state.identity.name.clone(),
        };
        if let Err(e) = state
            .peers
            .remove(url, req.authorization.as_deref(), notice)
            .await
        {
            tracing::warn!(node = %record.name, error = %e, "peer not notified of removal");
        }
    }

    Ok(MessageResponse {
        message: format!("Successfully removed '{}' from cluster", record.name),
    })
}

/// A peer running `add_node`/`update_node` against us.
pub fn register_peer(state: &AppState, req: RegisterRequest) -> Result<RegisterResponse, ApiError> {
    let identity = req.identity;
    if identity.name == state.identity.name {
        return Err(ApiError::BadRequest(format!(
            "peer claims this node's name {}",
            identity.name
        )));
    }
    let mut patch = NodePatch::from_identity(&identity);
    patch.subscriptions = req
        .subscriptions
        .map(serde_json::from_value::<Vec<Subscription>>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("invalid subscriptions: {e}")))?;
    patch.replicates = req
        .replicates
        .map(serde_json::from_value::<Replicates>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("invalid replicates: {e}")))?;
    state.registry.restore(&identity.name, &patch)?;
    tracing::info!(node = %identity.name, url = %identity.url, "peer registered with us");
    Ok(RegisterResponse {
        identity: state.identity.clone(),
    })
}

/// A peer dropped us; forget it.
pub fn remove_peer(state: &AppState, req: RemoveRequest) -> Result<MessageResponse, ApiError> {
    let removed = state.registry.delete(&req.name)?;
    tracing::info!(node = %req.name, removed, "peer removed us");
    Ok(MessageResponse {
        message: format!("Removed '{}'", req.name),
    })
}
