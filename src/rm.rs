//! Resource manager interface
//!
//! The RM is an external PostgreSQL database taking part in two-phase commit
//! through its prepared-transaction machinery (`PREPARE TRANSACTION` /
//! `COMMIT PREPARED` / `ROLLBACK PREPARED`). The trait seam exists so the
//! daemon and both state machines can run against a stand-in during tests.

use crate::config::PostgresConfig;
use crate::error::RmError;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// One session against the resource manager, exclusively owned by a single
/// transaction worker.
#[async_trait]
pub trait ResourceManager: Send {
    /// Open the session transaction the statements will run in.
    async fn begin(&mut self) -> Result<(), RmError>;

    async fn execute(&mut self, statement: &str) -> Result<(), RmError>;

    /// Convert the session transaction into a prepared transaction under the
    /// given global id.
    async fn prepare(&mut self, tid: Uuid) -> Result<(), RmError>;

    /// Commit a prepared transaction. Works from any session, including one
    /// opened after a crash.
    async fn commit_prepared(&mut self, tid: Uuid) -> Result<(), RmError>;

    /// Roll back the (unprepared) session transaction.
    async fn rollback(&mut self) -> Result<(), RmError>;

    /// Roll back a prepared transaction.
    async fn rollback_prepared(&mut self, tid: Uuid) -> Result<(), RmError>;

    /// The RM's own record of in-doubt transactions, consulted at recovery.
    async fn prepared_transactions(&mut self) -> Result<Vec<Uuid>, RmError>;
}

/// Factory for RM sessions; the daemon takes one of these so tests can
/// substitute a mock without a live database.
#[async_trait]
pub trait RmConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ResourceManager>, RmError>;
}

/// The production RM session over tokio-postgres.
pub struct PostgresRm {
    client: tokio_postgres::Client,
    connection_task: JoinHandle<()>,
}

impl PostgresRm {
    pub async fn connect(config: &PostgresConfig) -> Result<Self, RmError> {
        let params = format!(
            "host={} port={} user={} password={} dbname={}",
            config.host, config.port, config.user, config.password, config.database
        );
        let (client, connection) = tokio_postgres::connect(&params, tokio_postgres::NoTls).await?;

        // The connection future must be driven for the client to make
        // progress; it ends when the session does.
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("postgres connection task ended: {e}");
            }
        });

        Ok(Self {
            client,
            connection_task,
        })
    }
}

impl Drop for PostgresRm {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl ResourceManager for PostgresRm {
    async fn begin(&mut self) -> Result<(), RmError> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> Result<(), RmError> {
        debug!(statement, "executing on resource manager");
        self.client.batch_execute(statement).await?;
        Ok(())
    }

    async fn prepare(&mut self, tid: Uuid) -> Result<(), RmError> {
        self.client
            .batch_execute(&format!("PREPARE TRANSACTION '{tid}'"))
            .await?;
        Ok(())
    }

    async fn commit_prepared(&mut self, tid: Uuid) -> Result<(), RmError> {
        self.client
            .batch_execute(&format!("COMMIT PREPARED '{tid}'"))
            .await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RmError> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn rollback_prepared(&mut self, tid: Uuid) -> Result<(), RmError> {
        self.client
            .batch_execute(&format!("ROLLBACK PREPARED '{tid}'"))
            .await?;
        Ok(())
    }

    async fn prepared_transactions(&mut self) -> Result<Vec<Uuid>, RmError> {
        let rows = self
            .client
            .query(
                "SELECT gid FROM pg_prepared_xacts WHERE database = current_database()",
                &[],
            )
            .await?;

        let mut tids = Vec::new();
        for row in rows {
            let gid: String = row.get(0);
            match gid.parse() {
                Ok(tid) => tids.push(tid),
                // Prepared transactions created outside this system.
                Err(_) => warn!(gid, "ignoring foreign prepared transaction"),
            }
        }
        Ok(tids)
    }
}

/// Connector used by the manager binary.
pub struct PostgresConnector {
    config: PostgresConfig,
}

impl PostgresConnector {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RmConnector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn ResourceManager>, RmError> {
        Ok(Box::new(PostgresRm::connect(&self.config).await?))
    }
}
