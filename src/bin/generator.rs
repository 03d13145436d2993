//! Benchmark workload generator
//!
//! Reads a benchmark file of INSERT statements, groups them by sensor id
//! within a sliding window of benchmark time, and submits each group to a
//! transaction manager as one transaction. The statement's sensor id doubles
//! as the routing key, so every statement for one sensor lands on the same
//! site regardless of which manager coordinates it.
//!
//! Example usage:
//!   cargo run --bin generator -- --config_path /etc/dtxn

use anyhow::{bail, Context, Result};
use chrono::{Duration as BenchDuration, NaiveDateTime};
use clap::Parser;
use dtxn::config::GeneratorConfig;
use dtxn::wire::{Channel, Frame, ResponseCode};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "generator")]
#[command(about = "Generate and submit benchmark transactions", long_about = None)]
struct Args {
    /// Location of the configuration files.
    #[arg(long = "config_path", default_value = "config")]
    config_path: PathBuf,
}

/// One insert and the key it routes on.
#[derive(Debug, Clone)]
struct Insert {
    statement: String,
    key: String,
}

/// The two trailing comma-separated fields of a benchmark record are the
/// measurement timestamp and the sensor id.
fn parse_record(line: &str) -> Option<(NaiveDateTime, String)> {
    let mut fields = line.rsplit(',');
    let sensor = fields
        .next()?
        .replace([')', ';', '\'', ' '], "");
    let raw_timestamp = fields.next()?.replace([' ', '\''], "");
    if raw_timestamp.len() < 11 {
        return None;
    }
    let (date, time) = raw_timestamp.split_at(10);
    let timestamp =
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").ok()?;
    Some((timestamp, sensor))
}

/// Groups records by sensor id within a sliding window of benchmark time.
///
/// The first record opens the window; a record past the window's end closes
/// the current batch and is kept as the first record of the next window (a
/// multi-delta gap advances the window until that record fits). Every
/// parseable record is submitted exactly once.
struct WindowGrouper {
    delta: BenchDuration,
    window_end: Option<NaiveDateTime>,
    groups: BTreeMap<String, Vec<Insert>>,
}

impl WindowGrouper {
    fn new(delta: BenchDuration) -> Self {
        Self {
            delta,
            window_end: None,
            groups: BTreeMap::new(),
        }
    }

    /// Feed one record. Returns the finished window's groups when this
    /// record rolls the window over.
    fn push(
        &mut self,
        timestamp: NaiveDateTime,
        statement: &str,
        sensor: String,
    ) -> Option<BTreeMap<String, Vec<Insert>>> {
        let window_end = self.window_end.get_or_insert(timestamp + self.delta);

        let finished = if timestamp > *window_end {
            while timestamp > *window_end {
                *window_end = *window_end + self.delta;
            }
            Some(std::mem::take(&mut self.groups))
        } else {
            None
        };

        self.groups.entry(sensor.clone()).or_default().push(Insert {
            statement: statement.to_string(),
            key: sensor,
        });
        finished
    }

    /// Whatever the last window accumulated once the input is exhausted.
    fn finish(self) -> BTreeMap<String, Vec<Insert>> {
        self.groups
    }
}

struct TransactionGenerator {
    config: GeneratorConfig,
    committed: u64,
    aborted: u64,
}

impl TransactionGenerator {
    fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            committed: 0,
            aborted: 0,
        }
    }

    /// Each transaction uses one connection; the manager closes its side
    /// after delivering the outcome.
    async fn connect(&self) -> Result<Channel> {
        debug!(
            hostname = self.config.manager_hostname,
            port = self.config.manager_port,
            "connecting to the transaction manager"
        );
        Channel::connect(&self.config.manager_hostname, self.config.manager_port)
            .await
            .context("cannot reach the transaction manager")
    }

    /// Submit one group as a transaction. A failed insert or a lost channel
    /// abandons the transaction; dropping the connection is the abort.
    async fn perform_transaction(&mut self, inserts: &[Insert]) -> Result<()> {
        let mut channel = self.connect().await?;

        channel.send(&Frame::StartTransaction { tid: None }).await?;
        let tid = match channel.recv().await {
            Some(Frame::StartTransaction { tid: Some(tid) }) => tid,
            other => bail!("manager did not issue a transaction id, got {other:?}"),
        };
        info!(%tid, inserts = inserts.len(), "transaction started");

        for insert in inserts {
            channel
                .send(&Frame::InsertFromClient {
                    tid,
                    statement: insert.statement.clone(),
                    key: insert.key.clone(),
                })
                .await?;
            match channel.recv().await {
                Some(Frame::Response(ResponseCode::Ok)) => {}
                reply => {
                    warn!(%tid, ?reply, "insert rejected; abandoning transaction");
                    self.aborted += 1;
                    return Ok(());
                }
            }
        }

        channel.send(&Frame::CommitTransaction { tid }).await?;
        match channel.recv().await {
            Some(Frame::Response(ResponseCode::TransactionCommitted)) => {
                info!(%tid, "transaction committed");
                self.committed += 1;
            }
            Some(Frame::Response(ResponseCode::TransactionAborted)) => {
                info!(%tid, "transaction aborted");
                self.aborted += 1;
            }
            other => {
                warn!(%tid, ?other, "connection lost at commit; transaction aborted");
                self.aborted += 1;
            }
        }
        Ok(())
    }

    async fn flush(&mut self, groups: BTreeMap<String, Vec<Insert>>) -> Result<()> {
        for (sensor, inserts) in groups {
            debug!(sensor, count = inserts.len(), "submitting group");
            self.perform_transaction(&inserts).await?;
        }
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let file = File::open(&self.config.benchmark_file).with_context(|| {
            format!(
                "cannot open benchmark file {}",
                self.config.benchmark_file.display()
            )
        })?;
        let mut grouper = WindowGrouper::new(BenchDuration::seconds(self.config.time_delta));

        for line in BufReader::new(file).lines() {
            let line = line?;
            let record = line.trim_end();
            if record.is_empty() {
                info!("blank line found; stopping");
                break;
            }

            let Some((timestamp, sensor)) = parse_record(record) else {
                warn!(record, "unparseable record; skipping");
                continue;
            };
            if let Some(batch) = grouper.push(timestamp, record, sensor) {
                self.flush(batch).await?;
            }
        }

        self.flush(grouper.finish()).await?;
        info!(
            committed = self.committed,
            aborted = self.aborted,
            "workload complete"
        );

        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        let mut channel = self.connect().await?;
        channel.send(&Frame::Shutdown).await?;
        info!("asked the manager to shut down");
        // Let the manager read the message before the socket drops.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dtxn::logging::init_from_env()?;
    let args = Args::parse();

    let config = dtxn::config::load_generator(&args.config_path)?;
    TransactionGenerator::new(config).run().await
}
