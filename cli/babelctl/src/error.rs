//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot reach {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("session refused: {0}")]
    Refused(String),

    #[error("connection closed by the orchestrator")]
    Closed,

    #[error("no reply within {0} seconds")]
    Timeout(u64),

    #[error("invalid --details: {0}")]
    InvalidDetails(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::Connect { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: check --url or BABEL_URL and that the orchestrator is running.".yellow()
                );
            }
            CliError::Refused(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: pass --login and --password (or BABEL_PASSWORD).".yellow()
                );
            }
            CliError::InvalidDetails(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: details must be a JSON object, e.g. --details '{\"name\": \"intro.mp4\"}'"
                        .yellow()
                );
            }
            _ => {}
        }
    }
}
