mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use keel_raft::Config;
use keel_raft::Role;
use maplit::btreeset;

/// Remove a voter, then promote the standing spare in its place.
///
/// - brings up a cluster with voters {1,2,3} and spare {4}.
/// - removes a non-leader voter.
/// - promotes server 4 to voter.
/// - asserts the final configuration is three voters (the survivors plus 4), committed on all
///   of them.
///
/// RUST_LOG=keel_raft,memstore,remove_then_promote_spare=trace cargo test -p keel-raft --test remove_then_promote_spare
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_then_promote_spare() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {1,2,3}, btreeset! {4}).await?;
    let leader = router.wait_for_leader(Duration::from_secs(10), "initial election").await?;

    let removed = (1..=3u64).find(|id| *id != leader).unwrap();
    let final_members: std::collections::BTreeSet<u64> =
        (1..=4u64).filter(|id| *id != removed).collect();

    tracing::info!("--- removing voter {}", removed);

    let remove_index = router.remove_server(leader, removed).await.expect("remove_server failed");
    router
        .wait_for_applied(
            &final_members,
            remove_index,
            Some(Duration::from_secs(5)),
            "removal committed",
        )
        .await?;

    tracing::info!("--- promoting spare 4 to voter");

    let promote_index = router.assign_role(leader, 4, Role::Voter).await.expect("assign_role failed");
    router
        .wait_for_applied(
            &final_members,
            promote_index,
            Some(Duration::from_secs(5)),
            "promotion committed",
        )
        .await?;

    for id in final_members.iter() {
        let metrics = router
            .wait_for_metrics(id, |x| x.membership_config.is_voter(4), Some(Duration::from_secs(5)), "4 is voter")
            .await?;
        assert_eq!(metrics.membership_config.servers.len(), 3, "node {} has the wrong config size", id);
        for server in &metrics.membership_config.servers {
            assert_eq!(server.role, Role::Voter, "server {} should be a voter", server.id);
        }
        assert!(!metrics.membership_config.contains(removed));
    }

    Ok(())
}
