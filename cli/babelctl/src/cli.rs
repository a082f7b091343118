//! Command-line arguments.

use std::time::Duration;

use anyhow::Result;
use babel_protocol::{CommandEnvelope, Hello};
use clap::Parser;
use serde_json::Value;

use crate::client::SessionClient;
use crate::error::CliError;
use crate::output::{self, OutputFormat};

/// Send one command to a babel orchestrator session and print the reply.
///
/// Examples:
///   babelctl get info --lang '*'
///   babelctl play media --lang Fra --details '{"name": "intro.mp4"}'
///   babelctl --login ops timing start
#[derive(Debug, Parser)]
#[command(name = "babelctl", version, about, verbatim_doc_comment)]
pub struct Cli {
    /// Orchestrator session endpoint.
    #[arg(long, env = "BABEL_URL", default_value = "ws://127.0.0.1:8080/session")]
    pub url: String,

    /// Login; omit for an anonymous session.
    #[arg(long, env = "BABEL_LOGIN")]
    pub login: Option<String>,

    #[arg(long, env = "BABEL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Target language code, or `*` for every language.
    #[arg(long)]
    pub lang: Option<String>,

    /// Command details as a JSON object.
    #[arg(long)]
    pub details: Option<String>,

    /// Seconds to wait for the reply.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Keep the session open and print broadcasts after the reply.
    #[arg(long, short)]
    pub follow: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Command words, e.g. `get info` or `set settings`.
    #[arg(required = true, num_args = 1..)]
    pub command: Vec<String>,
}

impl Cli {
    pub fn hello(&self) -> Hello {
        match &self.login {
            Some(login) if !login.is_empty() => {
                Hello::credentials(login.clone(), self.password.clone().unwrap_or_default())
            }
            _ => Hello::anonymous(),
        }
    }

    pub fn envelope(&self) -> Result<CommandEnvelope, CliError> {
        let mut envelope = CommandEnvelope::new(self.command.join(" "));
        if let Some(lang) = &self.lang {
            envelope = envelope.with_lang(lang.clone());
        }
        if let Some(raw) = &self.details {
            let details: Value =
                serde_json::from_str(raw).map_err(|e| CliError::InvalidDetails(e.to_string()))?;
            if !details.is_object() {
                return Err(CliError::InvalidDetails("not a JSON object".into()));
            }
            envelope = envelope.with_details(details);
        }
        Ok(envelope)
    }

    /// Returns the command's status.
    pub async fn run(self) -> Result<bool> {
        let envelope = self.envelope()?;
        let limit = Duration::from_secs(self.timeout);

        let mut client = tokio::time::timeout(limit, SessionClient::connect(&self.url, &self.hello()))
            .await
            .map_err(|_| CliError::Timeout(self.timeout))??;

        let result = tokio::time::timeout(limit, client.execute(&envelope))
            .await
            .map_err(|_| CliError::Timeout(self.timeout))??;
        output::print_result(&result, self.output);

        if self.follow {
            loop {
                tokio::select! {
                    next = client.next_broadcast() => match next? {
                        Some(broadcast) => output::print_broadcast(&broadcast, self.output),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        client.close().await;
        Ok(result.status)
    }
}
