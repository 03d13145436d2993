//! Roll back orphaned prepared transactions on the resource manager
//!
//! After an aborted test run (or a crash with a destroyed protocol log) the
//! RM can be left holding prepared transactions that block vacuum and locks.
//! This tool rolls back every prepared transaction in the configured
//! database.
//!
//! Example usage:
//!   cargo run --bin cleanup -- --config_path /etc/dtxn

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cleanup")]
#[command(about = "Roll back every prepared transaction on the RM", long_about = None)]
struct Args {
    /// Location of the configuration files.
    #[arg(long = "config_path", default_value = "config")]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dtxn::logging::init_from_env()?;
    let args = Args::parse();
    let config = dtxn::config::load_postgres(&args.config_path)?;

    let params = format!(
        "host={} port={} user={} password={} dbname={}",
        config.host, config.port, config.user, config.password, config.database
    );
    let (client, connection) = tokio_postgres::connect(&params, tokio_postgres::NoTls)
        .await
        .context("cannot reach the resource manager")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("postgres connection task ended: {e}");
        }
    });

    let rows = client
        .query(
            "SELECT gid FROM pg_prepared_xacts WHERE database = current_database()",
            &[],
        )
        .await?;

    let mut rolled_back = 0u64;
    for row in &rows {
        let gid: String = row.get(0);
        match client
            .batch_execute(&format!("ROLLBACK PREPARED '{}'", gid.replace('\'', "''")))
            .await
        {
            Ok(()) => {
                info!(gid, "rolled back prepared transaction");
                rolled_back += 1;
            }
            Err(e) => warn!(gid, "rollback failed: {e}"),
        }
    }

    info!(found = rows.len(), rolled_back, "cleanup complete");
    Ok(())
}
