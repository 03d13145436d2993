//! Local transaction-manager daemon for one site
//!
//! Example usage:
//!   cargo run --bin manager -- site_a
//!   cargo run --bin manager -- site_a --config_path /etc/dtxn

use anyhow::Context;
use clap::Parser;
use dtxn::plog::ProtocolLog;
use dtxn::rm::PostgresConnector;
use dtxn::Daemon;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "manager")]
#[command(about = "Run the transaction-manager daemon for one site", long_about = None)]
struct Args {
    /// This node's alias; must match an entry of site.json.
    site_alias: String,

    /// Location of the configuration files.
    #[arg(long = "config_path", default_value = "config")]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dtxn::logging::init_from_env()?;
    let args = Args::parse();

    let config = dtxn::config::load(&args.config_path)?;
    let node_id = config
        .sites
        .node_id_of(&args.site_alias)
        .with_context(|| format!("site alias '{}' is not in site.json", args.site_alias))?;

    let plog = ProtocolLog::open(&config.manager.protocol_log)
        .context("cannot open the protocol log")?;
    let connector = Arc::new(PostgresConnector::new(config.postgres.clone()));

    info!(
        alias = args.site_alias,
        node_id,
        port = config.manager.port,
        "starting transaction manager"
    );

    let mut daemon = Daemon::new(
        node_id,
        config.manager.port,
        config.manager.failure_timeout(),
        plog,
        Arc::new(config.sites),
        connector,
    );
    daemon.run().await?;

    Ok(())
}
