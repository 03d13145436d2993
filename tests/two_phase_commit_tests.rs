//! End-to-end two-phase commit scenarios
//!
//! Each test runs one or two real daemons on localhost ports against the mock
//! resource manager and drives them over the wire the way a client (or a peer
//! coordinator) would.

mod common;

use common::*;
use dtxn::wire::{Frame, ResponseCode};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;
use uuid::Uuid;

async fn start_transaction(channel: &mut dtxn::wire::Channel) -> Uuid {
    channel
        .send(&Frame::StartTransaction { tid: None })
        .await
        .unwrap();
    match channel.recv().await {
        Some(Frame::StartTransaction { tid: Some(tid) }) => tid,
        other => panic!("expected a transaction id, got {other:?}"),
    }
}

async fn insert(
    channel: &mut dtxn::wire::Channel,
    tid: Uuid,
    statement: &str,
    key: &str,
) -> Option<Frame> {
    channel
        .send(&Frame::InsertFromClient {
            tid,
            statement: statement.into(),
            key: key.into(),
        })
        .await
        .unwrap();
    channel.recv().await
}

#[tokio::test]
async fn test_single_site_commit() {
    let dir = TempDir::new().unwrap();
    let sites = test_sites(&[21730]);
    let plog = test_plog(&dir);
    let connector = MockConnector::new();
    let state = connector.state();
    let _daemon = start_daemon(0, sites.clone(), plog.clone(), connector).await;

    let mut client = connect(21730).await;
    let tid = start_transaction(&mut client).await;

    let key = key_routed_to(&sites, 0);
    let reply = insert(&mut client, tid, "insert into t values (1);", &key).await;
    assert_eq!(reply, Some(Frame::Response(ResponseCode::Ok)));

    client.send(&Frame::CommitTransaction { tid }).await.unwrap();
    assert_eq!(
        client.recv().await,
        Some(Frame::Response(ResponseCode::TransactionCommitted))
    );

    let state = state.lock().unwrap();
    assert_eq!(state.executed, vec!["insert into t values (1);".to_string()]);
    assert!(state.committed.contains(&tid));
    assert!(state.prepared.is_empty());
    drop(state);

    assert_eq!(plog.states_of(tid).unwrap(), "IPCD");
}

#[tokio::test]
async fn test_two_site_commit() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let sites = test_sites(&[21740, 21741]);

    let plog_a = test_plog(&dir_a);
    let plog_b = test_plog(&dir_b);
    let connector_a = MockConnector::new();
    let connector_b = MockConnector::new();
    let state_a = connector_a.state();
    let state_b = connector_b.state();

    let _daemon = start_daemon(0, sites.clone(), plog_a.clone(), connector_a).await;
    let _daemon = start_daemon(1, sites.clone(), plog_b.clone(), connector_b).await;

    let mut client = connect(21740).await;
    let tid = start_transaction(&mut client).await;

    let local_key = key_routed_to(&sites, 0);
    let remote_key = key_routed_to(&sites, 1);
    let reply = insert(&mut client, tid, "insert into t values (1);", &local_key).await;
    assert_eq!(reply, Some(Frame::Response(ResponseCode::Ok)));
    let reply = insert(&mut client, tid, "insert into t values (2);", &remote_key).await;
    assert_eq!(reply, Some(Frame::Response(ResponseCode::Ok)));

    client.send(&Frame::CommitTransaction { tid }).await.unwrap();
    assert_eq!(
        client.recv().await,
        Some(Frame::Response(ResponseCode::TransactionCommitted))
    );

    // The participant logs its completion just after acknowledging.
    sleep(Duration::from_millis(300)).await;

    assert!(state_a.lock().unwrap().committed.contains(&tid));
    assert!(state_b.lock().unwrap().committed.contains(&tid));
    assert_eq!(
        state_b.lock().unwrap().executed,
        vec!["insert into t values (2);".to_string()]
    );
    assert_eq!(plog_a.states_of(tid).unwrap(), "IPCD");
    assert_eq!(plog_b.states_of(tid).unwrap(), "IPCD");
    assert_eq!(plog_a.get_participants(tid).unwrap(), vec![1]);
    assert_eq!(plog_b.get_coordinator(tid).unwrap(), Some(0));
}

#[tokio::test]
async fn test_participant_abort_at_prepare() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let sites = test_sites(&[21750, 21751]);

    let plog_a = test_plog(&dir_a);
    let plog_b = test_plog(&dir_b);
    let connector_a = MockConnector::new();
    let connector_b = MockConnector::failing_prepare();
    let state_a = connector_a.state();
    let state_b = connector_b.state();

    let _daemon = start_daemon(0, sites.clone(), plog_a.clone(), connector_a).await;
    let _daemon = start_daemon(1, sites.clone(), plog_b.clone(), connector_b).await;

    let mut client = connect(21750).await;
    let tid = start_transaction(&mut client).await;

    let local_key = key_routed_to(&sites, 0);
    let remote_key = key_routed_to(&sites, 1);
    assert_eq!(
        insert(&mut client, tid, "insert into t values (1);", &local_key).await,
        Some(Frame::Response(ResponseCode::Ok))
    );
    assert_eq!(
        insert(&mut client, tid, "insert into t values (2);", &remote_key).await,
        Some(Frame::Response(ResponseCode::Ok))
    );

    client.send(&Frame::CommitTransaction { tid }).await.unwrap();
    assert_eq!(
        client.recv().await,
        Some(Frame::Response(ResponseCode::TransactionAborted))
    );

    sleep(Duration::from_millis(300)).await;

    // The coordinator prepared locally and rolled its branch back; the
    // participant never prepared and rolled back its session transaction.
    assert!(state_a.lock().unwrap().rolled_back.contains(&tid));
    assert!(state_a.lock().unwrap().committed.is_empty());
    assert_eq!(state_b.lock().unwrap().session_rollbacks, 1);
    assert!(state_b.lock().unwrap().committed.is_empty());
    assert_eq!(plog_a.states_of(tid).unwrap(), "IPAD");
    assert_eq!(plog_b.states_of(tid).unwrap(), "IAD");
}

#[tokio::test]
async fn test_client_abort_request() {
    let dir = TempDir::new().unwrap();
    let sites = test_sites(&[21760]);
    let plog = test_plog(&dir);
    let connector = MockConnector::new();
    let state = connector.state();
    let _daemon = start_daemon(0, sites.clone(), plog.clone(), connector).await;

    let mut client = connect(21760).await;
    let tid = start_transaction(&mut client).await;

    let key = key_routed_to(&sites, 0);
    assert_eq!(
        insert(&mut client, tid, "insert into t values (1);", &key).await,
        Some(Frame::Response(ResponseCode::Ok))
    );

    client.send(&Frame::AbortTransaction { tid }).await.unwrap();
    assert_eq!(
        client.recv().await,
        Some(Frame::Response(ResponseCode::TransactionAborted))
    );

    assert_eq!(state.lock().unwrap().session_rollbacks, 1);
    assert!(state.lock().unwrap().committed.is_empty());
    assert_eq!(plog.states_of(tid).unwrap(), "IAD");
}

#[tokio::test]
async fn test_integrity_failure_surfaces_fail_then_aborts() {
    let dir = TempDir::new().unwrap();
    let sites = test_sites(&[21770]);
    let plog = test_plog(&dir);
    let connector = MockConnector::failing_execute();
    let _daemon = start_daemon(0, sites.clone(), plog.clone(), connector).await;

    let mut client = connect(21770).await;
    let tid = start_transaction(&mut client).await;

    let key = key_routed_to(&sites, 0);
    assert_eq!(
        insert(&mut client, tid, "insert into t values (1);", &key).await,
        Some(Frame::Response(ResponseCode::Fail))
    );
    assert_eq!(
        client.recv().await,
        Some(Frame::Response(ResponseCode::TransactionAborted))
    );
    assert_eq!(plog.states_of(tid).unwrap(), "IAD");
}

#[tokio::test]
async fn test_unknown_decision_is_acknowledged() {
    let dir = TempDir::new().unwrap();
    let sites = test_sites(&[21780]);
    let _daemon = start_daemon(0, sites, test_plog(&dir), MockConnector::new()).await;

    let mut peer = connect(21780).await;
    peer.send(&Frame::CommitFromCoordinator {
        tid: Uuid::new_v4(),
    })
    .await
    .unwrap();
    assert_eq!(
        peer.recv().await,
        Some(Frame::Response(ResponseCode::AcknowledgeEnd))
    );

    let mut peer = connect(21780).await;
    peer.send(&Frame::RollbackFromCoordinator {
        tid: Uuid::new_v4(),
    })
    .await
    .unwrap();
    assert_eq!(
        peer.recv().await,
        Some(Frame::Response(ResponseCode::AcknowledgeEnd))
    );
}

#[tokio::test]
async fn test_shutdown_stops_the_daemon() {
    let dir = TempDir::new().unwrap();
    let sites = test_sites(&[21790]);
    let handle = start_daemon(0, sites, test_plog(&dir), MockConnector::new()).await;

    let mut client = connect(21790).await;
    client.send(&Frame::Shutdown).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon should exit after SHUTDOWN")
        .unwrap();
}
