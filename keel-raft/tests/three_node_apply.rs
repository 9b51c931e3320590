mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use keel_raft::Config;
use maplit::btreeset;

/// Three-node apply test.
///
/// - brings up a cluster of 3 voters.
/// - the leader accepts one client command.
/// - asserts that the command is committed and applied on every node exactly once, and that
///   the client callback fired with success after the local apply.
///
/// RUST_LOG=keel_raft,memstore,three_node_apply=trace cargo test -p keel-raft --test three_node_apply
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_apply() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {1,2,3}, btreeset! {}).await?;
    let leader = router.wait_for_leader(Duration::from_secs(10), "initial election").await?;

    tracing::info!("--- leader {} elected, submitting one command", leader);

    // The bootstrap configuration entry occupies index 1; the first command lands at index 2.
    // `client_request` panics unless the write callback fires with success.
    router.client_request(leader, "client", 0).await;

    router.wait_for_log(&btreeset! {1,2,3}, 2, Some(Duration::from_secs(5)), "apply one entry").await?;
    router.assert_stable_cluster(None, Some(2)).await;

    // Each node's state machine saw the command exactly once.
    for id in 1..=3 {
        let sto = router.get_storage_handle(&id).await?;
        let sm = keel_raft::RaftStorageDebug::get_state_machine(&*sto).await;
        assert_eq!(
            sm.client_status.get("client"),
            Some(&"request-0".to_string()),
            "node {} is missing the applied command",
            id
        );
        assert_eq!(
            sm.client_serial_responses.get("client").map(|(serial, _)| *serial),
            Some(0),
            "node {} applied the command more than once or not at all",
            id
        );
    }

    Ok(())
}
