use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;

use fixtures::RaftRouter;
use raft::metrics::{LeaderMetrics, Wait};
use raft::Config;

#[macro_use]
mod fixtures;

/// Poll `wait` until `condition` holds of the node's `leader_metrics`, or
/// time out with `msg` for context.
async fn poll_leader_metrics(wait: Wait, condition: impl Fn(&LeaderMetrics) -> bool, msg: &str) -> Result<()> {
    let mut rx = wait.rx.clone();
    let deadline = tokio::time::Instant::now() + wait.timeout;
    let empty = LeaderMetrics::default();
    loop {
        if condition(rx.borrow().leader_metrics.as_ref().unwrap_or(&empty)) {
            return Ok(());
        }
        if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
            return Err(anyhow!("timed out waiting for: {msg}"));
        }
    }
}

/// Cluster leader_metrics test.
///
/// What does this test do?
///
/// - brings up a single-node cluster, then joins 3 more servers via
///   `add_server`, exercising joint consensus across the whole cluster.
/// - sends a batch of client requests and asserts the leader's
///   `leader_metrics.replication` converges to every follower's matched log
///   position.
/// - removes one follower via `remove_server` and asserts replication
///   tracking for it disappears and the remaining followers stay in sync.
///
/// RUST_LOG=raft,memstore,leader_metrics=trace cargo test -p raft --test leader_metrics
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leader_metrics() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let timeout = Duration::from_millis(2000);
    let all_members = btreeset![0, 1, 2, 3];
    let left_members = btreeset![0, 1, 2];

    let config = Arc::new(Config::build().validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;

    router.assert_pristine_cluster().await;

    tracing::info!("--- initializing single-node cluster");

    router.initialize_from_single_node(0).await?;
    let mut want = 1;

    router.wait_for_log(&btreeset![0], want, timeout, "init cluster").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    poll_leader_metrics(router.wait(&0, timeout).await?, |m| m.replication.is_empty(), "no replication with a 1 node cluster")
        .await?;

    router.new_raft_node(1).await;
    router.new_raft_node(2).await;
    router.new_raft_node(3).await;

    tracing::info!("--- adding 3 new servers to the cluster");

    router.add_server(0, 1).await?;
    want += 2; // one C_old,new entry and one C_new entry per add_server call
    router.add_server(0, 2).await?;
    want += 2;
    router.add_server(0, 3).await?;
    want += 2;

    router.wait_for_log(&all_members, want, timeout, "add servers 1,2,3").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await; // still term 1, node 0 still leader

    poll_leader_metrics(
        router.wait(&0, timeout).await?,
        |m| m.replication.values().all(|log_id| log_id.index == want),
        "replication caught up to 3 followers",
    )
    .await?;

    tracing::info!("--- sending client requests");

    router.client_request_many(0, "client", 10).await;
    want += 10;

    router.wait_for_log(&all_members, want, timeout, "10 client requests applied everywhere").await?;

    tracing::info!("--- removing node 3");

    router.remove_server(0, 3).await?;
    want += 2; // one C_old,new entry and one C_new entry

    router.wait_for_log(&left_members, want, timeout, "removed node 3").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    poll_leader_metrics(
        router.wait(&0, timeout).await?,
        |m| !m.replication.contains_key(&3) && m.replication.values().all(|log_id| log_id.index == want),
        "node 3 no longer tracked, remaining followers caught up",
    )
    .await?;

    Ok(())
}
