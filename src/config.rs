//! Configuration loading for the manager, generator, and cleanup binaries
//!
//! Three JSON documents live in the configuration directory: `manager.json`
//! (this node's daemon), `postgres.json` (the resource manager), and
//! `site.json` (the ordered cluster map). Scalar settings can be overridden
//! from the environment with a `DTXN_` prefix, e.g. `DTXN_MANAGER_PORT`.

use crate::site::{Site, SiteDirectory};
use anyhow::{Context, Result};
use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_failure_time() -> u64 {
    10
}

fn default_postgres_port() -> u16 {
    5432
}

/// `manager.json`: node port, failure timeout, protocol-log path.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    pub port: u16,

    /// Socket read timeout and redelivery period, in seconds.
    #[serde(default = "default_failure_time")]
    pub failure_time: u64,

    /// Path of the single-file protocol log for this site.
    pub protocol_log: PathBuf,
}

impl ManagerConfig {
    pub fn failure_timeout(&self) -> Duration {
        Duration::from_secs(self.failure_time)
    }
}

/// `postgres.json`: credentials for this site's resource manager.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub database: String,
}

/// `generator.json`: where the workload generator submits its transactions.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    pub manager_hostname: String,
    pub manager_port: u16,
    pub benchmark_file: PathBuf,

    /// Width of the grouping window, in seconds of benchmark time.
    pub time_delta: i64,
}

/// Everything the manager daemon needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub manager: ManagerConfig,
    pub postgres: PostgresConfig,
    pub sites: SiteDirectory,
}

pub fn load(dir: &Path) -> Result<Config> {
    Ok(Config {
        manager: load_manager(dir)?,
        postgres: load_postgres(dir)?,
        sites: load_sites(dir)?,
    })
}

pub fn load_manager(dir: &Path) -> Result<ManagerConfig> {
    Figment::new()
        .merge(Json::file(dir.join("manager.json")))
        .merge(Env::prefixed("DTXN_MANAGER_"))
        .extract()
        .with_context(|| format!("invalid manager configuration in {}", dir.display()))
}

pub fn load_postgres(dir: &Path) -> Result<PostgresConfig> {
    Figment::new()
        .merge(Json::file(dir.join("postgres.json")))
        .merge(Env::prefixed("DTXN_POSTGRES_"))
        .extract()
        .with_context(|| format!("invalid postgres configuration in {}", dir.display()))
}

pub fn load_generator(dir: &Path) -> Result<GeneratorConfig> {
    Figment::new()
        .merge(Json::file(dir.join("generator.json")))
        .merge(Env::prefixed("DTXN_GENERATOR_"))
        .extract()
        .with_context(|| format!("invalid generator configuration in {}", dir.display()))
}

/// `site.json` is a top-level array, which figment cannot treat as a profile;
/// it is read directly.
pub fn load_sites(dir: &Path) -> Result<SiteDirectory> {
    let path = dir.join("site.json");
    let file = File::open(&path).with_context(|| format!("cannot open {}", path.display()))?;
    let sites: Vec<Site> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("invalid site list in {}", path.display()))?;
    anyhow::ensure!(!sites.is_empty(), "site.json lists no sites");
    Ok(SiteDirectory::new(sites))
}
