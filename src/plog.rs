//! Durable protocol log for two-phase commit recovery
//!
//! A single SQLite file per site records, for every transaction this node has
//! ever seen, its role, its peer set, and an append-only history of state
//! records (`I`, `P`, `C`, `A`, `D`). Every write is forced to stable storage
//! before the caller's state machine is allowed to advance; recovery after a
//! crash is driven entirely from these tables plus the resource manager's own
//! prepared-transaction list.

use crate::error::LogError;
use crate::site::NodeId;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// A node is exactly one of these per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRole {
    Participant = 0,
    Coordinator = 1,
}

/// Shared handle to the protocol log. Writers are serialized through the
/// connection mutex; every mutation commits before returning.
#[derive(Clone)]
pub struct ProtocolLog {
    conn: Arc<Mutex<Connection>>,
}

impl ProtocolLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LogError> {
        let conn = Connection::open(path)?;

        // Synchronous commit: a state record must survive power loss before
        // its transition becomes externally observable.
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch("PRAGMA synchronous = FULL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS TRANSACTION_LOG (
                 tr_id   TEXT PRIMARY KEY,
                 tr_role INT
             );
             CREATE TABLE IF NOT EXISTS TRANSACTION_SITE_LOG (
                 tr_id   TEXT,
                 tr_role INT,
                 node_id INT
             );
             -- Append-only.
             CREATE TABLE IF NOT EXISTS STATE_LOG (
                 tr_id TEXT,
                 state TEXT
             );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record this node's role in a new transaction, together with its `I`
    /// state record, atomically.
    pub fn log_initialize(&self, tid: Uuid, role: TransactionRole) -> Result<(), LogError> {
        debug!(%tid, ?role, "logging transaction initialization");
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO STATE_LOG (tr_id, state) VALUES (?1, 'I')",
            params![tid.to_string()],
        )?;
        tx.execute(
            "INSERT INTO TRANSACTION_LOG (tr_id, tr_role) VALUES (?1, ?2)",
            params![tid.to_string(), role as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn add_participant(&self, tid: Uuid, node: NodeId) -> Result<(), LogError> {
        debug!(%tid, node, "recording participant site");
        self.add_site(tid, TransactionRole::Participant, node)
    }

    pub fn add_coordinator(&self, tid: Uuid, node: NodeId) -> Result<(), LogError> {
        debug!(%tid, node, "recording coordinator site");
        self.add_site(tid, TransactionRole::Coordinator, node)
    }

    fn add_site(&self, tid: Uuid, peer_role: TransactionRole, node: NodeId) -> Result<(), LogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO TRANSACTION_SITE_LOG (tr_id, tr_role, node_id) VALUES (?1, ?2, ?3)",
            params![tid.to_string(), peer_role as i64, node],
        )?;
        Ok(())
    }

    pub fn log_prepare(&self, tid: Uuid) -> Result<(), LogError> {
        self.append_state(tid, "P")
    }

    pub fn log_commit(&self, tid: Uuid) -> Result<(), LogError> {
        self.append_state(tid, "C")
    }

    pub fn log_abort(&self, tid: Uuid) -> Result<(), LogError> {
        self.append_state(tid, "A")
    }

    pub fn log_completion(&self, tid: Uuid) -> Result<(), LogError> {
        self.append_state(tid, "D")
    }

    fn append_state(&self, tid: Uuid, state: &str) -> Result<(), LogError> {
        debug!(%tid, state, "appending state record");
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO STATE_LOG (tr_id, state) VALUES (?1, ?2)",
            params![tid.to_string(), state],
        )?;
        Ok(())
    }

    pub fn get_role(&self, tid: Uuid) -> Result<Option<TransactionRole>, LogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT tr_role FROM TRANSACTION_LOG WHERE tr_id = ?1")?;
        let mut rows = stmt.query(params![tid.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let role: i64 = row.get(0)?;
                Ok(Some(if role == 0 {
                    TransactionRole::Participant
                } else {
                    TransactionRole::Coordinator
                }))
            }
            None => Ok(None),
        }
    }

    pub fn get_participants(&self, tid: Uuid) -> Result<Vec<NodeId>, LogError> {
        self.get_sites(tid, TransactionRole::Participant)
    }

    pub fn get_coordinator(&self, tid: Uuid) -> Result<Option<NodeId>, LogError> {
        Ok(self
            .get_sites(tid, TransactionRole::Coordinator)?
            .into_iter()
            .next())
    }

    fn get_sites(&self, tid: Uuid, peer_role: TransactionRole) -> Result<Vec<NodeId>, LogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT node_id FROM TRANSACTION_SITE_LOG WHERE tr_id = ?1 AND tr_role = ?2",
        )?;
        let rows = stmt.query_map(params![tid.to_string(), peer_role as i64], |row| {
            row.get::<_, NodeId>(0)
        })?;
        let mut nodes = Vec::new();
        for node in rows {
            nodes.push(node?);
        }
        Ok(nodes)
    }

    /// Transactions whose history holds no `C`, no `P`, and no `A`: the
    /// process died before the prepare point, so presumed abort applies.
    pub fn get_abortable_transactions(&self) -> Result<Vec<Uuid>, LogError> {
        self.history_query(
            "SELECT tr_id FROM STATE_LOG
             GROUP BY tr_id
             HAVING GROUP_CONCAT(state) NOT LIKE '%C%' AND
                    GROUP_CONCAT(state) NOT LIKE '%P%' AND
                    GROUP_CONCAT(state) NOT LIKE '%A%'",
        )
    }

    /// Transactions inside the uncertain window: prepared, with no decision
    /// recorded yet.
    pub fn get_prepared_transactions(&self) -> Result<Vec<Uuid>, LogError> {
        self.history_query(
            "SELECT tr_id FROM STATE_LOG
             GROUP BY tr_id
             HAVING GROUP_CONCAT(state) LIKE '%P%' AND
                    GROUP_CONCAT(state) NOT LIKE '%C%' AND
                    GROUP_CONCAT(state) NOT LIKE '%A%'",
        )
    }

    fn history_query(&self, sql: &str) -> Result<Vec<Uuid>, LogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tids = Vec::new();
        for tid in rows {
            tids.push(tid?.parse()?);
        }
        Ok(tids)
    }

    /// The full state history for one transaction, in append order, as a
    /// compact string such as `"IPC"`. Empty when the transaction is unknown.
    pub fn states_of(&self, tid: Uuid) -> Result<String, LogError> {
        let conn = self.conn.lock().unwrap();
        let history: Option<String> = conn.query_row(
            "SELECT GROUP_CONCAT(state, '')
             FROM (SELECT state FROM STATE_LOG WHERE tr_id = ?1 ORDER BY rowid)",
            params![tid.to_string()],
            |row| row.get(0),
        )?;
        Ok(history.unwrap_or_default())
    }
}
