mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use fixtures::RaftRouter;
use keel_raft::raft::AppendEntriesRequest;
use keel_raft::raft::Entry;
use keel_raft::raft::EntryNormal;
use keel_raft::raft::EntryPayload;
use keel_raft::raft::InstallSnapshotRequest;
use keel_raft::Config;
use keel_raft::LogId;
use keel_raft::Membership;
use keel_raft::Role;
use keel_raft::Server;
use keel_raft::SnapshotMeta;
use memstore::ClientRequest;
use memstore::MemStoreStateMachine;

fn command(term: u64, index: u64, serial: u64) -> Entry<ClientRequest> {
    Entry {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Normal(EntryNormal {
            data: ClientRequest {
                client: "c0".into(),
                serial,
                status: format!("request-{}", serial),
            },
        }),
    }
}

/// Receiver-side AppendEntries semantics, driven directly through the RPC interface of a
/// single passive node.
///
/// - a payload of entries is accepted and re-delivering the identical payload is a no-op.
/// - a stale term is rejected.
/// - a conflicting suffix is truncated and replaced.
///
/// RUST_LOG=keel_raft,memstore,append_conflicts=trace cargo test -p keel-raft --test append_conflicts
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn append_entries_is_idempotent_and_resolves_conflicts() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    // A pristine node: passive, accepts replication from a claimed leader.
    router.new_raft_node(99).await;
    let node = router.get_raft_handle(&99).await?;
    let sto = router.get_storage_handle(&99).await?;

    let payload = AppendEntriesRequest {
        term: 1,
        leader_id: 1,
        prev_log_id: LogId::default(),
        entries: vec![command(1, 1, 0), command(1, 2, 1)],
        leader_commit: 0,
    };

    let res = node.append_entries(payload).await?;
    assert!(res.success);
    assert_eq!(sto.get_log().await.len(), 2);

    // Applying the same AppendEntries twice is a no-op beyond the first.
    let replay = AppendEntriesRequest {
        term: 1,
        leader_id: 1,
        prev_log_id: LogId::default(),
        entries: vec![command(1, 1, 0), command(1, 2, 1)],
        leader_commit: 0,
    };
    let res = node.append_entries(replay).await?;
    assert!(res.success);
    {
        let log = sto.get_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(&2).unwrap().log_id, LogId::new(1, 2));
    }

    // A stale term is rejected outright.
    let stale = AppendEntriesRequest {
        term: 0,
        leader_id: 7,
        prev_log_id: LogId::default(),
        entries: vec![],
        leader_commit: 0,
    };
    let res = node.append_entries(stale).await?;
    assert!(!res.success);

    // A newer leader overwrites the conflicting suffix: index 2 is replaced by the term-2
    // entry, index 1 is untouched.
    let conflicting = AppendEntriesRequest {
        term: 2,
        leader_id: 2,
        prev_log_id: LogId::new(1, 1),
        entries: vec![command(2, 2, 9)],
        leader_commit: 0,
    };
    let res = node.append_entries(conflicting).await?;
    assert!(res.success);
    {
        let log = sto.get_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(&1).unwrap().log_id, LogId::new(1, 1));
        assert_eq!(log.get(&2).unwrap().log_id, LogId::new(2, 2));
    }

    // A probe past the end of the log is rejected with the local last index as the hint.
    let probing = AppendEntriesRequest {
        term: 2,
        leader_id: 2,
        prev_log_id: LogId::new(2, 7),
        entries: vec![],
        leader_commit: 0,
    };
    let res = node.append_entries(probing).await?;
    assert!(!res.success);
    assert_eq!(res.conflict_opt.expect("conflict hint expected").log_id.index, 2);

    Ok(())
}

/// Installing a snapshot which is not ahead of the local one is a no-op success.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn stale_install_snapshot_is_a_no_op() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(99).await;
    let node = router.get_raft_handle(&99).await?;

    let membership = Membership::new(vec![
        Server::new(1, "node-1", Role::Voter),
        Server::new(99, "node-99", Role::Standby),
    ]);

    let mut sm = MemStoreStateMachine::default();
    sm.last_applied_log = LogId::new(1, 5);
    sm.client_status.insert("c0".into(), "request-4".into());
    let data = serde_json::to_vec(&sm)?;

    let install = InstallSnapshotRequest {
        term: 1,
        leader_id: 1,
        meta: SnapshotMeta {
            last_log_id: LogId::new(1, 5),
            membership: membership.clone(),
            membership_index: 1,
        },
        data: data.clone(),
    };
    node.install_snapshot(install).await?;

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.snapshot, LogId::new(1, 5));
    assert_eq!(metrics.last_applied, 5);

    // An older (or equal) snapshot changes nothing and still succeeds.
    let stale = InstallSnapshotRequest {
        term: 1,
        leader_id: 1,
        meta: SnapshotMeta {
            last_log_id: LogId::new(1, 3),
            membership,
            membership_index: 1,
        },
        data,
    };
    node.install_snapshot(stale).await?;

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.snapshot, LogId::new(1, 5), "stale install must not regress the snapshot");
    assert_eq!(metrics.last_applied, 5);

    Ok(())
}
