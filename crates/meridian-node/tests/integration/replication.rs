//! Data flow between registered nodes: full replication, table
//! subscriptions and confirmations.

use std::time::Duration;

use serde_json::json;

use crate::harness::{TestMesh, DB};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_full_replication_is_bidirectional() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["alpha", "beta"]).await?;
    mesh.wait_converged(TIMEOUT).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    let t = a.put("dog", "1", json!({"id": "1", "name": "rex"}))?;
    let rex = b.wait_record("dog", "1", TIMEOUT).await?;
    assert_eq!(rex["name"], "rex");
    b.wait_received("alpha", t, TIMEOUT).await?;

    b.put("cat", "7", json!({"id": "7", "name": "tom"}))?;
    let tom = a.wait_record("cat", "7", TIMEOUT).await?;
    assert_eq!(tom["name"], "tom");
    assert_eq!(a.store.count(DB, "dog"), 1);
    assert_eq!(b.store.count(DB, "cat"), 1);

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_updates_and_deletes_replicate() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["alpha", "beta"]).await?;
    mesh.wait_converged(TIMEOUT).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    a.put("dog", "1", json!({"id": "1", "name": "rex"}))?;
    b.wait_record("dog", "1", TIMEOUT).await?;

    let t = a.put("dog", "1", json!({"id": "1", "name": "rex", "age": 4}))?;
    b.wait_received("alpha", t, TIMEOUT).await?;
    assert_eq!(b.get("dog", "1").map(|r| r["age"].clone()), Some(json!(4)));

    a.delete("dog", "1")?;
    b.wait_absent("dog", "1", TIMEOUT).await?;

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_writes_before_add_node_catch_up() -> anyhow::Result<()> {
    let mesh = TestMesh::new(&["alpha", "beta"]).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    for i in 0..20 {
        a.put("dog", &i.to_string(), json!({"id": i.to_string()}))?;
    }

    let (status, _) = a.add_node(b, json!({"replicates": true})).await?;
    assert_eq!(status, 200);

    b.wait_record("dog", "19", TIMEOUT).await?;
    assert_eq!(b.store.count(DB, "dog"), 20);

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_table_subscription_filters_and_is_one_way() -> anyhow::Result<()> {
    let mesh = TestMesh::new(&["alpha", "beta"]).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    // alpha pulls beta's dogs; beta's mirrored entry only publishes.
    let (status, body) = a
        .add_node(
            b,
            json!({"subscriptions": [
                {"database": DB, "table": "dog", "subscribe": true, "publish": false}
            ]}),
        )
        .await?;
    assert_eq!(status, 200, "{body}");

    let mirrored = b
        .registry
        .get("alpha")?
        .record()
        .ok_or_else(|| anyhow::anyhow!("beta never recorded alpha"))?;
    assert!(mirrored.subscriptions[0].publish);
    assert!(!mirrored.subscriptions[0].subscribe);

    a.wait_connected("beta", TIMEOUT).await?;

    b.put("cat", "1", json!({"id": "1", "name": "tom"}))?;
    let t = b.put("dog", "1", json!({"id": "1", "name": "rex"}))?;
    a.wait_record("dog", "1", TIMEOUT).await?;
    a.wait_received("beta", t, TIMEOUT).await?;
    assert!(a.get("cat", "1").is_none());

    a.put("dog", "2", json!({"id": "2"}))?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(b.get("dog", "2").is_none());

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_confirmation_resolves_once_peer_applies() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["alpha", "beta"]).await?;
    mesh.wait_converged(TIMEOUT).await?;
    let (a, b) = (mesh.node("alpha"), mesh.node("beta"));

    let t = a.put("dog", "1", json!({"id": "1"}))?;
    let one = a.node.tracker.register(DB, t, 1)?;
    tokio::time::timeout(TIMEOUT, one.wait()).await??;
    assert!(b.get("dog", "1").is_some());
    assert!(a
        .node
        .tracker
        .confirmed_time(DB, "beta")
        .is_some_and(|c| c >= t));

    // Only one peer exists, so two confirmations never arrive.
    let t = a.put("dog", "2", json!({"id": "2"}))?;
    let two = a.node.tracker.register(DB, t, 2)?;
    assert!(tokio::time::timeout(Duration::from_millis(500), two.wait())
        .await
        .is_err());

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_fails_pending_confirmations() -> anyhow::Result<()> {
    let mesh = TestMesh::new(&["alpha"]).await?;
    let a = mesh.node("alpha");

    let t = a.put("dog", "1", json!({"id": "1"}))?;
    let pending = a.node.tracker.register(DB, t, 1)?;
    a.node.tracker.shutdown();
    assert!(pending.wait().await.is_err());

    mesh.shutdown().await;
    Ok(())
}
