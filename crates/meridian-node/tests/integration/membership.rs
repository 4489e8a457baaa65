//! Cluster membership over the HTTP API: add, conflict, remove, status.

use std::time::Duration;

use meridian_registry::{Lookup, Replicates};
use serde_json::json;

use crate::harness::{TestMesh, DB};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_add_node_registers_both_sides() -> anyhow::Result<()> {
    let mesh = TestMesh::new(&["alpha", "beta"]).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    let (status, body) = a.add_node(b, json!({"replicates": true})).await?;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["message"], "Successfully added 'beta' to cluster");

    let on_a = a
        .registry
        .get("beta")?
        .record()
        .ok_or_else(|| anyhow::anyhow!("alpha has no record for beta"))?;
    assert_eq!(on_a.url.as_deref(), Some(b.url.as_str()));
    assert_eq!(on_a.replicates, Some(Replicates::Full));
    assert!(!on_a.ca.is_empty());

    let on_b = b
        .registry
        .get("alpha")?
        .record()
        .ok_or_else(|| anyhow::anyhow!("beta has no record for alpha"))?;
    assert_eq!(on_b.url.as_deref(), Some(a.url.as_str()));
    assert_eq!(on_b.replicates, Some(Replicates::Full));

    mesh.wait_converged(TIMEOUT).await?;
    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_add_node_twice_conflicts() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["alpha", "beta"]).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    let (status, body) = a.add_node(b, json!({"replicates": true})).await?;
    assert_eq!(status, 409);
    assert!(body.to_string().contains("use update_node"), "{body}");

    let (status, _) = a
        .api_post_raw(
            "/api/v1/update_node",
            json!({
                "url": b.url,
                "authorization": b.bearer_token,
                "subscriptions": [{"database": DB, "table": "dog", "subscribe": true}],
            }),
        )
        .await?;
    assert_eq!(status, 200);

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_add_node_rejects_bad_requests() -> anyhow::Result<()> {
    let mesh = TestMesh::new(&["alpha", "beta"]).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    // Neither replicates nor subscriptions.
    let (status, _) = a.add_node(b, json!({})).await?;
    assert_eq!(status, 400);

    // Wrong token for the peer's API.
    let (status, _) = a
        .api_post_raw(
            "/api/v1/add_node",
            json!({"url": b.url, "replicates": true, "authorization": "nope"}),
        )
        .await?;
    assert_eq!(status, 502);
    assert!(matches!(a.registry.get("beta")?, Lookup::Absent));

    // Our own url is already taken by our own record.
    let (status, _) = a.add_node(a, json!({"replicates": true})).await?;
    assert_eq!(status, 409);

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_api_requires_bearer_token() -> anyhow::Result<()> {
    let mesh = TestMesh::new(&["alpha"]).await?;
    let a = mesh.node("alpha");

    let resp = reqwest::Client::new()
        .post(format!("http://{}/api/v1/cluster_status", a.api_addr))
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 401);

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remove_fully_replicating_node_downgrades() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["alpha", "beta"]).await?;
    mesh.wait_converged(TIMEOUT).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    let (status, body) = a.remove_node(b).await?;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["message"], "Successfully removed 'beta' from cluster");

    // alpha keeps the record but stops replicating; beta forgets alpha.
    let on_a = a
        .registry
        .get("beta")?
        .record()
        .ok_or_else(|| anyhow::anyhow!("downgraded record vanished"))?;
    assert_eq!(on_a.replicates, Some(Replicates::Disabled));
    assert!(matches!(b.registry.get("alpha")?, Lookup::Deleted));

    a.wait_no_socket("beta", TIMEOUT).await?;
    b.wait_no_socket("alpha", TIMEOUT).await?;

    b.put("dog", "after", json!({"id": "after"}))?;
    a.put("dog", "mine", json!({"id": "mine"}))?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(a.get("dog", "after").is_none());
    assert!(b.get("dog", "mine").is_none());

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remove_subscribed_node_deletes() -> anyhow::Result<()> {
    let mesh = TestMesh::new(&["alpha", "beta"]).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    let (status, _) = a
        .add_node(
            b,
            json!({"subscriptions": [{"database": DB, "subscribe": true, "publish": true}]}),
        )
        .await?;
    assert_eq!(status, 200);
    a.wait_connected("beta", TIMEOUT).await?;

    let (status, _) = a
        .api_post_raw(
            "/api/v1/remove_node",
            json!({"url": b.url, "authorization": b.bearer_token}),
        )
        .await?;
    assert_eq!(status, 200);
    assert!(matches!(a.registry.get("beta")?, Lookup::Deleted));
    a.wait_no_socket("beta", TIMEOUT).await?;

    // Unknown nodes are reported, not silently accepted.
    let (status, _) = a
        .api_post_raw("/api/v1/remove_node", json!({"name": "ghost"}))
        .await?;
    assert_eq!(status, 404);

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cluster_status_over_http() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["alpha", "beta", "gamma"]).await?;
    mesh.wait_converged(TIMEOUT).await?;
    let a = mesh.node("alpha");

    let status = a.api_cluster_status().await?;
    assert_eq!(status["node_name"], "alpha");
    assert_eq!(status["is_enabled"], true);

    let connections = status["connections"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("connections missing: {status}"))?;
    let mut names: Vec<&str> = connections
        .iter()
        .filter_map(|c| c["node_name"].as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["beta", "gamma"]);

    for connection in connections {
        let socket = &connection["database_sockets"][0];
        assert_eq!(socket["database"], DB);
        assert_eq!(socket["connected"], true);
        assert_eq!(socket["state"], "connected");
        assert!(socket["latency"].is_number(), "{socket}");
        assert!(socket.get("redirecting_to").is_none());
    }

    mesh.shutdown().await;
    Ok(())
}
