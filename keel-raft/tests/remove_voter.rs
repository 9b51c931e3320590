mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use keel_raft::Config;
use keel_raft::State;
use maplit::btreeset;

/// Remove a voter from a 3-node cluster.
///
/// - brings up a cluster of 3 voters.
/// - removes a non-leader voter.
/// - asserts the configuration shrinks to 2 servers, the removed node drops to the passive
///   state, and the cluster keeps committing with a quorum of 2.
///
/// RUST_LOG=keel_raft,memstore,remove_voter=trace cargo test -p keel-raft --test remove_voter
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_voter() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {1,2,3}, btreeset! {}).await?;
    let leader = router.wait_for_leader(Duration::from_secs(10), "initial election").await?;

    let target = (1..=3u64).find(|id| *id != leader).unwrap();
    let survivors: std::collections::BTreeSet<u64> = (1..=3u64).filter(|id| *id != target).collect();

    tracing::info!("--- removing voter {} from the cluster", target);

    let remove_index = router.remove_server(leader, target).await.expect("remove_server failed");
    router.wait_for_applied(&survivors, remove_index, Some(Duration::from_secs(5)), "removal committed").await?;

    for id in survivors.iter() {
        let metrics = router
            .wait_for_metrics(
                id,
                |x| !x.membership_config.contains(target),
                Some(Duration::from_secs(5)),
                "target removed",
            )
            .await?;
        assert_eq!(metrics.membership_config.servers.len(), 2);
        // The order of the surviving servers is preserved.
        let ids: Vec<_> = metrics.membership_config.servers.iter().map(|s| s.id).collect();
        let expected: Vec<_> = survivors.iter().cloned().collect();
        assert_eq!(ids, expected);
    }

    // The removed server observes its removal and becomes passive.
    router
        .wait_for_state(&btreeset! {target}, State::NonVoter, Some(Duration::from_secs(5)), "removed node passive")
        .await?;

    tracing::info!("--- the cluster keeps committing with a quorum of 2");

    router.client_request(leader, "client", 0).await;
    router
        .wait_for_applied(&survivors, remove_index + 1, Some(Duration::from_secs(5)), "post-removal commit")
        .await?;

    Ok(())
}
