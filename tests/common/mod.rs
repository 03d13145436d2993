//! Shared helpers for the integration tests: a mock resource manager, site
//! lists over localhost ports, and raw client channels.

#![allow(dead_code)]

use async_trait::async_trait;
use dtxn::error::RmError;
use dtxn::plog::ProtocolLog;
use dtxn::rm::{ResourceManager, RmConnector};
use dtxn::site::{NodeId, Site, SiteDirectory};
use dtxn::wire::Channel;
use dtxn::Daemon;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Read timeout / redelivery period used across the tests. Short enough to
/// keep WAITING loops quick, long enough that test steps never trip it.
pub const FAILURE_TIME: Duration = Duration::from_secs(2);

/// Everything the mock RM has been asked to do, shared by every session the
/// connector hands out.
#[derive(Debug, Default)]
pub struct RmState {
    pub executed: Vec<String>,
    pub prepared: HashSet<Uuid>,
    pub committed: HashSet<Uuid>,
    pub rolled_back: HashSet<Uuid>,
    pub session_rollbacks: usize,
}

/// Injectable stand-in for the PostgreSQL connector.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<RmState>>,
    fail_execute: bool,
    fail_prepare: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement violates a constraint.
    pub fn failing_execute() -> Self {
        Self {
            fail_execute: true,
            ..Self::default()
        }
    }

    /// The RM refuses every prepare.
    pub fn failing_prepare() -> Self {
        Self {
            fail_prepare: true,
            ..Self::default()
        }
    }

    /// Seed the RM's prepared-transaction list, as recovery would find it
    /// after a crash.
    pub fn with_prepared(tids: &[Uuid]) -> Self {
        let connector = Self::default();
        connector
            .state
            .lock()
            .unwrap()
            .prepared
            .extend(tids.iter().copied());
        connector
    }

    pub fn state(&self) -> Arc<Mutex<RmState>> {
        self.state.clone()
    }
}

#[async_trait]
impl RmConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn ResourceManager>, RmError> {
        Ok(Box::new(MockRm {
            state: self.state.clone(),
            fail_execute: self.fail_execute,
            fail_prepare: self.fail_prepare,
        }))
    }
}

pub struct MockRm {
    state: Arc<Mutex<RmState>>,
    fail_execute: bool,
    fail_prepare: bool,
}

#[async_trait]
impl ResourceManager for MockRm {
    async fn begin(&mut self) -> Result<(), RmError> {
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> Result<(), RmError> {
        if self.fail_execute {
            return Err(RmError::Integrity("duplicate key".into()));
        }
        self.state.lock().unwrap().executed.push(statement.into());
        Ok(())
    }

    async fn prepare(&mut self, tid: Uuid) -> Result<(), RmError> {
        if self.fail_prepare {
            return Err(RmError::Backend("deferred constraint failed".into()));
        }
        self.state.lock().unwrap().prepared.insert(tid);
        Ok(())
    }

    async fn commit_prepared(&mut self, tid: Uuid) -> Result<(), RmError> {
        let mut state = self.state.lock().unwrap();
        if !state.prepared.remove(&tid) {
            return Err(RmError::Backend(format!("{tid} is not prepared")));
        }
        state.committed.insert(tid);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RmError> {
        self.state.lock().unwrap().session_rollbacks += 1;
        Ok(())
    }

    async fn rollback_prepared(&mut self, tid: Uuid) -> Result<(), RmError> {
        let mut state = self.state.lock().unwrap();
        if !state.prepared.remove(&tid) {
            return Err(RmError::Backend(format!("{tid} is not prepared")));
        }
        state.rolled_back.insert(tid);
        Ok(())
    }

    async fn prepared_transactions(&mut self) -> Result<Vec<Uuid>, RmError> {
        Ok(self.state.lock().unwrap().prepared.iter().copied().collect())
    }
}

/// A site list over localhost.
pub fn test_sites(ports: &[u16]) -> SiteDirectory {
    SiteDirectory::new(
        ports
            .iter()
            .enumerate()
            .map(|(i, port)| Site {
                alias: format!("site_{i}"),
                hostname: "127.0.0.1".into(),
                port: *port,
            })
            .collect(),
    )
}

/// A protocol log in a fresh temporary directory. The directory guard must
/// outlive the daemon.
pub fn test_plog(dir: &TempDir) -> ProtocolLog {
    ProtocolLog::open(dir.path().join("protocol.db")).unwrap()
}

/// Run a daemon in the background and give it a moment to bind.
pub async fn start_daemon(
    node_id: NodeId,
    sites: SiteDirectory,
    plog: ProtocolLog,
    connector: MockConnector,
) -> JoinHandle<()> {
    let port = sites.site(node_id).unwrap().port;
    let mut daemon = Daemon::new(
        node_id,
        port,
        FAILURE_TIME,
        plog,
        Arc::new(sites),
        Arc::new(connector),
    );
    let handle = tokio::spawn(async move {
        if let Err(e) = daemon.run().await {
            eprintln!("daemon exited with error: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle
}

pub async fn connect(port: u16) -> Channel {
    Channel::connect("127.0.0.1", port).await.unwrap()
}

/// A key the site directory routes to the wanted node.
pub fn key_routed_to(sites: &SiteDirectory, target: NodeId) -> String {
    (0..)
        .map(|i| format!("sensor_{i}"))
        .find(|key| sites.route(key) == target)
        .unwrap()
}
