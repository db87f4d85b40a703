use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;
use raft::storage::Persistence;
use raft::Config;

mod fixtures;

/// Cluster total_order_apply test.
///
/// What does this test do?
///
/// - brings 2 nodes online: one leader and one follower joined via `add_server`.
/// - floods the leader with client requests while polling the follower's
///   `last_applied` in a tight loop.
/// - asserts `last_applied` never goes backwards, and that it eventually
///   catches up to the leader's log.
///
/// RUST_LOG=raft,memstore,total_order_apply=trace cargo test -p raft --test total_order_apply
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn total_order_apply() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build().validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut want = router.new_nodes_from_single(btreeset! {0, 1}).await?;

    let (tx, rx) = tokio::sync::watch::channel(false);
    let sto = router.get_storage_handle(&1).await?;

    let h = tokio::spawn(async move {
        let mut prev = 0;
        while !*rx.borrow() {
            let last = sto.get_initial_state().await.unwrap().last_applied;
            assert!(last >= prev, "out of order apply: {} then {}", prev, last);
            prev = last;
            tokio::task::yield_now().await;
        }
    });

    let n: usize = 500;
    router.client_request_many(0, "foo", n).await;
    want += n as u64;

    router.wait_for_log(&btreeset! {0, 1}, want, Duration::from_secs(5), "n1 catches up to the leader's log").await?;

    tx.send(true)?;
    h.await?;

    Ok(())
}
