mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use keel_raft::error::TransferError;
use keel_raft::Config;
use keel_raft::State;
use maplit::btreeset;

/// Leadership transfer on a 3-voter cluster.
///
/// - brings up a cluster of 3 voters and commits a few entries.
/// - the leader transfers its leadership with an unspecified target (0).
/// - asserts leadership moves to another voter, the original leader ends up a follower, and no
///   entries are lost or duplicated.
///
/// RUST_LOG=keel_raft,memstore,leadership_transfer=trace cargo test -p keel-raft --test leadership_transfer
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfer() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {1,2,3}, btreeset! {}).await?;
    let leader = router.wait_for_leader(Duration::from_secs(10), "initial election").await?;

    tracing::info!("--- committing a few entries before the transfer");

    for serial in 0..5 {
        router.client_request(leader, "client", serial).await;
    }
    let want = 6; // bootstrap config + 5 commands
    router.wait_for_log(&btreeset! {1,2,3}, want, Some(Duration::from_secs(5)), "pre-transfer entries").await?;

    tracing::info!("--- transferring leadership away from {}", leader);

    let target = router.transfer_leadership(leader, 0).await.expect("transfer failed");
    assert_ne!(target, leader, "transfer target must be another voter");

    router
        .wait_for_state(&btreeset! {leader}, State::Follower, Some(Duration::from_secs(5)), "old leader steps down")
        .await?;
    let new_leader = router.wait_for_leader(Duration::from_secs(10), "post-transfer election").await?;
    assert_eq!(new_leader, target);

    tracing::info!("--- the new leader commits; nothing was lost or duplicated");

    router.client_request(new_leader, "client", 5).await;
    router
        .wait_for_applied(&btreeset! {1,2,3}, want + 1, Some(Duration::from_secs(5)), "post-transfer commit")
        .await?;
    fixtures::assert_state_machines_eq(&router, &btreeset! {1,2,3}).await?;

    // The last status written wins exactly once.
    let sto = router.get_storage_handle(&new_leader).await?;
    let sm = keel_raft::RaftStorageDebug::get_state_machine(&*sto).await;
    assert_eq!(sm.client_status.get("client"), Some(&"request-5".to_string()));

    Ok(())
}

/// `transfer_leadership(0)` with no other voter fails with NotFound.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transfer_without_other_voter_returns_not_found() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {1}, btreeset! {}).await?;
    let leader = router.wait_for_leader(Duration::from_secs(10), "single node election").await?;
    assert_eq!(leader, 1);

    let res = router.transfer_leadership(1, 0).await;
    assert!(matches!(res, Err(TransferError::NotFound)), "got {:?}", res);

    Ok(())
}
