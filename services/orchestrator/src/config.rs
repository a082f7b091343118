use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Where snapshots are written.
    pub data_dir: PathBuf,
    pub credentials_file: Option<PathBuf>,
    /// Source for `pull config` / target for `push config`.
    pub config_file: Option<PathBuf>,
    /// Static topology: `(lang, host:port)`.
    pub nodes: Vec<(String, String)>,
    pub rpc_timeout: Duration,
    pub provision_timeout: Duration,
    pub credential_sync_interval: Duration,
    pub broadcast_interval: Duration,
    /// How often disconnected or dirty languages are re-activated.
    pub monitor_interval: Duration,
    pub hook_workers: usize,
    pub log_ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            data_dir: PathBuf::from("./data"),
            credentials_file: None,
            config_file: None,
            nodes: Vec::new(),
            rpc_timeout: Duration::from_secs(10),
            provision_timeout: Duration::from_secs(60),
            credential_sync_interval: Duration::from_secs(60),
            broadcast_interval: Duration::from_millis(1000),
            monitor_interval: Duration::from_secs(5),
            hook_workers: 4,
            log_ring_capacity: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let listen_addr = match std::env::var("BABEL_LISTEN_ADDR") {
            Ok(addr) => addr.parse().context("BABEL_LISTEN_ADDR")?,
            Err(_) => defaults.listen_addr,
        };

        let log_level = std::env::var("BABEL_LOG_LEVEL").unwrap_or(defaults.log_level);

        let data_dir = std::env::var("BABEL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let credentials_file = std::env::var("BABEL_CREDENTIALS_FILE").ok().map(PathBuf::from);
        let config_file = std::env::var("BABEL_CONFIG_FILE").ok().map(PathBuf::from);

        let nodes = match std::env::var("BABEL_NODES") {
            Ok(raw) => parse_nodes(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            listen_addr,
            log_level,
            data_dir,
            credentials_file,
            config_file,
            nodes,
            rpc_timeout: env_secs("BABEL_RPC_TIMEOUT_SECS", defaults.rpc_timeout)?,
            provision_timeout: env_secs("BABEL_PROVISION_TIMEOUT_SECS", defaults.provision_timeout)?,
            credential_sync_interval: env_secs(
                "BABEL_CREDENTIAL_SYNC_SECS",
                defaults.credential_sync_interval,
            )?,
            broadcast_interval: env_parse("BABEL_BROADCAST_INTERVAL_MS", 1000u64)
                .map(Duration::from_millis)?,
            monitor_interval: env_secs("BABEL_MONITOR_INTERVAL_SECS", defaults.monitor_interval)?,
            hook_workers: env_parse("BABEL_HOOK_WORKERS", defaults.hook_workers)?,
            log_ring_capacity: env_parse("BABEL_LOG_RING_CAPACITY", defaults.log_ring_capacity)?,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

/// Parse `Lang=host:port,Lang=host:port`.
pub fn parse_nodes(raw: &str) -> Result<Vec<(String, String)>> {
    let mut nodes = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((lang, endpoint)) = entry.split_once('=') else {
            bail!("node entry '{entry}' is not Lang=host:port");
        };
        let (lang, endpoint) = (lang.trim(), endpoint.trim());
        if lang.is_empty() || endpoint.is_empty() {
            bail!("node entry '{entry}' is not Lang=host:port");
        }
        nodes.push((lang.to_string(), endpoint.to_string()));
    }
    Ok(nodes)
}
