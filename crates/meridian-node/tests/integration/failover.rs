//! Failover: when a direct link drops, the lost origin is pulled through
//! another peer until the link comes back.

use std::time::Duration;

use serde_json::json;

use crate::harness::{TestMesh, DB};

const TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn test_partition_redirects_through_next_peer() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["n1", "n2", "n3"]).await?;
    mesh.wait_converged(TIMEOUT).await?;
    let (n1, n2, n3) = (mesh.node("n1"), mesh.node("n2"), mesh.node("n3"));

    // n1 can no longer reach n2; everybody else is unaffected.
    n1.partition_from(n2);

    let lost = n1
        .wait_socket("n2", "redirected", TIMEOUT, |s| s.state == "redirected")
        .await?;
    assert!(!lost.connected);
    let target = lost
        .redirecting_to
        .ok_or_else(|| anyhow::anyhow!("redirected socket names no target"))?;
    assert!(target.starts_with(&n3.url), "redirect target {target}");

    let carrier = n1
        .wait_socket("n3", "carrying n2", TIMEOUT, |s| {
            s.connected && s.nodes.iter().any(|n| n == "n2")
        })
        .await?;
    assert_eq!(carrier.nodes[0], "n3");

    // n2's writes reach n1 by way of n3.
    let t = n2.put("dog", "r", json!({"id": "r", "from": "n2"}))?;
    let record = n1.wait_record("dog", "r", TIMEOUT).await?;
    assert_eq!(record["from"], "n2");
    n1.wait_received("n2", t, TIMEOUT).await?;

    // n2 still reaches n1 directly in the other direction.
    n1.put("cat", "c", json!({"id": "c"}))?;
    n2.wait_record("cat", "c", TIMEOUT).await?;

    n1.heal_from(n2);
    n1.wait_connected("n2", TIMEOUT).await?;
    let restored = n1
        .wait_socket("n3", "withdrawn", TIMEOUT, |s| {
            s.connected && !s.nodes.iter().any(|n| n == "n2")
        })
        .await?;
    assert_eq!(restored.nodes, vec!["n3".to_string()]);

    let status = n1.status().await?;
    let direct = status
        .connection("n2")
        .and_then(|c| c.socket(DB))
        .ok_or_else(|| anyhow::anyhow!("no socket for n2"))?;
    assert_eq!(direct.state, "connected");
    assert!(direct.redirecting_to.is_none());

    // Post-heal writes arrive over the direct link again.
    n2.put("dog", "s", json!({"id": "s"}))?;
    n1.wait_record("dog", "s", TIMEOUT).await?;

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_no_failover_target_leaves_link_disconnected() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["n1", "n2"]).await?;
    mesh.wait_converged(TIMEOUT).await?;
    let (n1, n2) = (mesh.node("n1"), mesh.node("n2"));

    n1.partition_from(n2);
    let socket = n1
        .wait_socket("n2", "disconnected", TIMEOUT, |s| !s.connected)
        .await?;
    assert_eq!(socket.state, "disconnected");
    assert!(socket.redirecting_to.is_none());

    // Writes made while cut off are caught up after the heal.
    n2.put("dog", "late", json!({"id": "late"}))?;
    n1.heal_from(n2);
    n1.wait_record("dog", "late", TIMEOUT).await?;
    n1.wait_connected("n2", TIMEOUT).await?;

    mesh.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_restarted_endpoint_is_reconnected() -> anyhow::Result<()> {
    let mesh = TestMesh::full_mesh(&["n1", "n2"]).await?;
    mesh.wait_converged(TIMEOUT).await?;
    let (n1, n2) = (mesh.node("n1"), mesh.node("n2"));

    assert!(n2.disconnect());
    n1.wait_socket("n2", "disconnected", TIMEOUT, |s| !s.connected)
        .await?;

    n2.put("dog", "1", json!({"id": "1"}))?;
    n2.reconnect();
    n1.wait_connected("n2", TIMEOUT).await?;
    n1.wait_record("dog", "1", TIMEOUT).await?;

    mesh.shutdown().await;
    Ok(())
}
