mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use keel_raft::error::ChangeConfigError;
use keel_raft::error::ResponseError;
use keel_raft::raft::EntryPayload;
use keel_raft::Config;
use keel_raft::Role;
use maplit::btreeset;

/// Add-then-promote on 3 nodes.
///
/// - brings up a cluster of 3 voters.
/// - adds server 4: it enters the configuration as a spare and catches up.
/// - promotes server 4 to voter.
/// - asserts the final configuration holds 4 servers with server 4 a voter, and that the log
///   carries the intermediate spare configuration followed by the voter configuration. Each
///   change only started after the previous one had committed (the single-slot change lock
///   rejects overlapping changes with `ConfigChangeInProgress`).
///
/// RUST_LOG=keel_raft,memstore,membership_add_then_promote=trace cargo test -p keel-raft --test membership_add_then_promote
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_add_then_promote() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {1,2,3}, btreeset! {}).await?;
    let leader = router.wait_for_leader(Duration::from_secs(10), "initial election").await?;

    tracing::info!("--- assigning a server its current role must fail without mutating state");

    let before = router.wait(&leader, None).await?.rx.borrow().membership_config.clone();
    let res = router.assign_role(leader, 2, Role::Voter).await;
    match res {
        Err(ResponseError::ChangeConfig(ChangeConfigError::BadRole { role })) => {
            assert_eq!(role, Role::Voter)
        }
        other => panic!("expected BadRole, got {:?}", other),
    }
    let after = router.wait(&leader, None).await?.rx.borrow().membership_config.clone();
    assert_eq!(before, after, "a rejected role assignment must not change the configuration");

    tracing::info!("--- adding server 4 as a spare");

    router.new_raft_node(4).await;
    let add_index = router.add_server(leader, 4).await.expect("add_server failed");

    router.wait_for_applied(&btreeset! {1,2,3}, add_index, Some(Duration::from_secs(5)), "add committed").await?;

    let metrics = router.wait_for_metrics(&leader, |x| x.membership_config.contains(4), None, "4 in config").await?;
    assert_eq!(metrics.membership_config.servers.len(), 4);
    assert_eq!(metrics.membership_config.get(4).map(|s| s.role), Some(Role::Spare));
    assert!(!metrics.membership_config.is_voter(4));

    tracing::info!("--- waiting for the spare to catch up, then promoting it to voter");

    router
        .wait_for_metrics(&4, |x| x.last_applied >= add_index, Some(Duration::from_secs(5)), "4 caught up")
        .await?;

    let promote_index = router.assign_role(leader, 4, Role::Voter).await.expect("assign_role failed");
    assert!(promote_index > add_index);

    router
        .wait_for_applied(&btreeset! {1,2,3,4}, promote_index, Some(Duration::from_secs(5)), "promotion committed")
        .await?;

    for id in 1..=4u64 {
        let metrics = router
            .wait_for_metrics(&id, |x| x.membership_config.is_voter(4), Some(Duration::from_secs(5)), "4 is voter")
            .await?;
        assert_eq!(metrics.membership_config.servers.len(), 4, "node {} has the wrong config size", id);
    }

    // The leader's log carries the two configuration entries in order: first the spare
    // configuration, then the voter configuration.
    let sto = router.get_storage_handle(&leader).await?;
    let log = sto.get_log().await;
    let configs: Vec<_> = log
        .values()
        .filter_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(cfg) => Some((entry.log_id.index, cfg.membership.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(configs.len(), 3, "bootstrap + spare + voter configurations expected");
    assert_eq!(configs[1].0, add_index);
    assert_eq!(configs[1].1.get(4).map(|s| s.role), Some(Role::Spare));
    assert_eq!(configs[2].0, promote_index);
    assert_eq!(configs[2].1.get(4).map(|s| s.role), Some(Role::Voter));

    Ok(())
}
