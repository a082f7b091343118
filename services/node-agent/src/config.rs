//! Configuration for the node agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Language this node renders.
    pub lang: String,

    /// Address of the `/control` endpoint.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory `run media` names are resolved against.
    pub media_dir: PathBuf,

    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lang: "und".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4455)),
            log_level: "info".to_string(),
            media_dir: PathBuf::from("./media"),
            reconcile_interval: Duration::from_secs(3),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let lang = std::env::var("BABEL_NODE_LANG").unwrap_or(defaults.lang);

        let listen_addr = match std::env::var("BABEL_NODE_LISTEN_ADDR") {
            Ok(addr) => addr.parse().context("BABEL_NODE_LISTEN_ADDR")?,
            Err(_) => defaults.listen_addr,
        };

        let log_level = std::env::var("BABEL_LOG_LEVEL").unwrap_or(defaults.log_level);

        let media_dir = std::env::var("BABEL_MEDIA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.media_dir);

        let reconcile_interval = match std::env::var("BABEL_RECONCILE_INTERVAL_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.trim()
                    .parse()
                    .context("invalid BABEL_RECONCILE_INTERVAL_SECS")?,
            ),
            Err(_) => defaults.reconcile_interval,
        };

        Ok(Self {
            lang,
            listen_addr,
            log_level,
            media_dir,
            reconcile_interval,
        })
    }
}
