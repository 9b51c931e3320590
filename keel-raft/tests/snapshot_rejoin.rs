mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use keel_raft::Config;
use keel_raft::SnapshotPolicy;
use maplit::btreeset;

/// Snapshot-then-rejoin.
///
/// - brings up a cluster of 3 voters with a snapshot threshold of 1000 entries and a small
///   trailing window.
/// - runs traffic until the leader has taken a snapshot at index >= 1000.
/// - cuts node 3 off, advances the leader far enough that a second snapshot discards the log
///   around node 3's position.
/// - reconnects node 3 and asserts it is brought back via InstallSnapshot: its snapshot id
///   equals the leader's, its state machine equals the leader's, and it holds the full log tip.
///
/// RUST_LOG=keel_raft,memstore,snapshot_rejoin=trace cargo test -p keel-raft --test snapshot_rejoin
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_rejoin() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(1000))
            .snapshot_trailing(50)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {1,2,3}, btreeset! {}).await?;
    let leader = router.wait_for_leader(Duration::from_secs(10), "initial election").await?;

    tracing::info!("--- running traffic until the first snapshot");

    router.client_request_concurrent(leader, "c", 1200).await;
    router
        .wait_for_metrics(&leader, |x| x.snapshot.index >= 1000, Some(Duration::from_secs(30)), "first snapshot")
        .await?;

    tracing::info!("--- cutting node 3 off and advancing the leader");

    router.isolate_node(3).await;

    router.client_request_concurrent(leader, "d", 1200).await;
    router
        .wait_for_metrics(&leader, |x| x.snapshot.index >= 2000, Some(Duration::from_secs(30)), "second snapshot")
        .await?;

    let leader_snapshot = router.wait(&leader, None).await?.rx.borrow().snapshot;
    assert!(leader_snapshot.index >= 2000);

    tracing::info!("--- reconnecting node 3, expecting InstallSnapshot");

    router.restore_node(3).await;

    // The rejoining voter may briefly disrupt leadership with the term it accrued while cut
    // off. Find the stable leader and anchor the commit index in its term with one more
    // write; without an entry of the new term nothing can commit.
    let mut leader = None;
    for _ in 0..20 {
        let candidate = router.wait_for_leader(Duration::from_secs(10), "post-rejoin leader").await?;
        if router.try_client_request(candidate, "anchor", 0).await.is_ok() {
            leader = Some(candidate);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let leader = leader.expect("failed to commit through a post-rejoin leader");

    let leader_last_log = router.wait(&leader, None).await?.rx.borrow().last_log_index;
    router
        .wait_for_metrics(
            &3,
            |x| x.last_applied >= leader_last_log,
            Some(Duration::from_secs(30)),
            "node 3 caught up",
        )
        .await?;

    // Node 3 was restored from the leader's snapshot, not from the log: its snapshot id is
    // exactly the snapshot held by the node which replicated to it. (Node 3 cannot have
    // compacted on its own: after the restore it is well below the threshold for a new
    // snapshot.)
    let serving_snapshot = router.wait(&leader, None).await?.rx.borrow().snapshot;
    let metrics3 = router.wait(&3, None).await?.rx.borrow().clone();
    assert!(metrics3.snapshot.index >= 2000, "node 3 was not brought back via InstallSnapshot");
    assert_eq!(metrics3.snapshot, serving_snapshot, "node 3 was not brought back via InstallSnapshot");

    fixtures::assert_state_machines_eq(&router, &btreeset! {1,2,3}).await?;

    Ok(())
}
