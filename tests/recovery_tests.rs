//! Crash-recovery scenarios
//!
//! The protocol log and the mock RM's prepared list are seeded the way a
//! crash would leave them, then a daemon is started over them and observed
//! from the outside.

mod common;

use common::*;
use dtxn::plog::TransactionRole;
use dtxn::wire::{Channel, Frame, ResponseCode};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::sleep;
use uuid::Uuid;

/// The coordinator died before its prepare point: recovery must abort the
/// transaction and deliver the rollback to the recorded participant's site,
/// which knows nothing of the transaction and simply acknowledges.
#[tokio::test]
async fn test_presumed_abort_recovers_dead_coordinator() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let sites = test_sites(&[21800, 21801]);

    let plog_a = test_plog(&dir_a);
    let tid = Uuid::new_v4();
    plog_a
        .log_initialize(tid, TransactionRole::Coordinator)
        .unwrap();
    plog_a.add_participant(tid, 1).unwrap();

    // The peer site is up and empty.
    let _daemon = start_daemon(1, sites.clone(), test_plog(&dir_b), MockConnector::new()).await;
    let _daemon = start_daemon(0, sites.clone(), plog_a.clone(), MockConnector::new()).await;

    sleep(Duration::from_secs(2)).await;
    assert_eq!(plog_a.states_of(tid).unwrap(), "IAD");
}

/// Scenario: the coordinator crashed after logging `P` (both RMs hold the
/// prepared branches) and before deciding. On restart it finds the
/// transaction in the RM's prepared list, re-enters POLLING, learns the
/// participant's durable YES vote from its peer daemon, and commits
/// everywhere.
#[tokio::test]
async fn test_in_doubt_coordinator_recovers_and_commits() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let sites = test_sites(&[21810, 21811]);
    let tid = Uuid::new_v4();

    let plog_a = test_plog(&dir_a);
    plog_a
        .log_initialize(tid, TransactionRole::Coordinator)
        .unwrap();
    plog_a.add_participant(tid, 1).unwrap();
    plog_a.log_prepare(tid).unwrap();
    let connector_a = MockConnector::with_prepared(&[tid]);
    let state_a = connector_a.state();

    let plog_b = test_plog(&dir_b);
    plog_b
        .log_initialize(tid, TransactionRole::Participant)
        .unwrap();
    plog_b.add_coordinator(tid, 0).unwrap();
    plog_b.log_prepare(tid).unwrap();
    let connector_b = MockConnector::with_prepared(&[tid]);
    let state_b = connector_b.state();

    let _daemon = start_daemon(1, sites.clone(), plog_b.clone(), connector_b).await;
    let _daemon = start_daemon(0, sites.clone(), plog_a.clone(), connector_a).await;

    sleep(Duration::from_secs(6)).await;

    assert_eq!(plog_a.states_of(tid).unwrap(), "IPCD");
    assert_eq!(plog_b.states_of(tid).unwrap(), "IPCD");
    assert!(state_a.lock().unwrap().committed.contains(&tid));
    assert!(state_b.lock().unwrap().committed.contains(&tid));
}

/// A participant recovered into PREPARED applies whatever the coordinator
/// decided; here the test plays the coordinator's side and rolls it back.
#[tokio::test]
async fn test_recovered_participant_applies_rollback() {
    let dir_b = TempDir::new().unwrap();
    // The test itself listens on the coordinator's port.
    let coordinator_listener = TcpListener::bind(("127.0.0.1", 21820)).await.unwrap();
    let sites = test_sites(&[21820, 21821]);
    let tid = Uuid::new_v4();

    let plog_b = test_plog(&dir_b);
    plog_b
        .log_initialize(tid, TransactionRole::Participant)
        .unwrap();
    plog_b.add_coordinator(tid, 0).unwrap();
    plog_b.log_prepare(tid).unwrap();
    let connector_b = MockConnector::with_prepared(&[tid]);
    let state_b = connector_b.state();

    let _daemon = start_daemon(1, sites.clone(), plog_b.clone(), connector_b).await;

    // Recovery dialed us: deliver the decision on the accepted connection.
    let (stream, _) = coordinator_listener.accept().await.unwrap();
    let mut channel = Channel::new(stream);
    channel
        .send(&Frame::RollbackFromCoordinator { tid })
        .await
        .unwrap();
    assert_eq!(
        channel.recv().await,
        Some(Frame::Response(ResponseCode::AcknowledgeEnd))
    );

    sleep(Duration::from_millis(300)).await;
    assert_eq!(plog_b.states_of(tid).unwrap(), "IPAD");
    assert!(state_b.lock().unwrap().rolled_back.contains(&tid));
}

/// A prepared transaction the RM knows but the protocol log does not was
/// never voted on; recovery rolls it back directly.
#[tokio::test]
async fn test_orphaned_prepared_transaction_is_rolled_back() {
    let dir = TempDir::new().unwrap();
    let sites = test_sites(&[21830]);
    let tid = Uuid::new_v4();
    let connector = MockConnector::with_prepared(&[tid]);
    let state = connector.state();

    let _daemon = start_daemon(0, sites, test_plog(&dir), connector).await;

    sleep(Duration::from_millis(300)).await;
    let state = state.lock().unwrap();
    assert!(state.rolled_back.contains(&tid));
    assert!(state.prepared.is_empty());
}

/// Recovery over a log holding only finished histories appends nothing.
#[tokio::test]
async fn test_recovery_of_finished_history_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let sites = test_sites(&[21840]);
    let tid = Uuid::new_v4();

    let plog = test_plog(&dir);
    plog.log_initialize(tid, TransactionRole::Coordinator).unwrap();
    plog.log_prepare(tid).unwrap();
    plog.log_commit(tid).unwrap();
    plog.log_completion(tid).unwrap();

    let _daemon = start_daemon(0, sites, plog.clone(), MockConnector::new()).await;

    sleep(Duration::from_millis(500)).await;
    assert_eq!(plog.states_of(tid).unwrap(), "IPCD");
}

/// The daemon answers status requests from the durable record.
#[tokio::test]
async fn test_status_service_answers_from_the_log() {
    let dir = TempDir::new().unwrap();
    let sites = test_sites(&[21850]);
    let plog = test_plog(&dir);

    let committed = Uuid::new_v4();
    plog.log_initialize(committed, TransactionRole::Coordinator).unwrap();
    plog.log_prepare(committed).unwrap();
    plog.log_commit(committed).unwrap();
    plog.log_completion(committed).unwrap();

    let aborted = Uuid::new_v4();
    plog.log_initialize(aborted, TransactionRole::Participant).unwrap();
    plog.log_abort(aborted).unwrap();
    plog.log_completion(aborted).unwrap();

    let voted = Uuid::new_v4();
    plog.log_initialize(voted, TransactionRole::Participant).unwrap();
    plog.log_prepare(voted).unwrap();

    let undecided = Uuid::new_v4();
    plog.log_initialize(undecided, TransactionRole::Coordinator).unwrap();
    plog.log_prepare(undecided).unwrap();

    let _daemon = start_daemon(0, sites, plog.clone(), MockConnector::with_prepared(&[])).await;

    let expectations = [
        (committed, Some(ResponseCode::TransactionCommitted)),
        (aborted, Some(ResponseCode::TransactionAborted)),
        (Uuid::new_v4(), Some(ResponseCode::TransactionAborted)),
        (voted, Some(ResponseCode::PreparedFromParticipant)),
        // A coordinator's own undecided window gets no answer.
        (undecided, None),
    ];
    for (tid, expected) in expectations {
        let mut peer = connect(21850).await;
        peer.set_read_timeout(Duration::from_secs(2));
        peer.send(&Frame::TransactionStatus { tid }).await.unwrap();
        let reply = peer.recv().await;
        assert_eq!(reply, expected.map(Frame::Response), "status of {tid}");
    }
}
