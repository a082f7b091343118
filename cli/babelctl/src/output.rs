//! Output formatting for command results.

use babel_protocol::{Broadcast, CommandResult};
use colored::Colorize;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Status line followed by the returned object.
    #[default]
    Text,
    /// The raw result frame.
    Json,
}

pub fn print_result(result: &CommandResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", pretty(result)),
        OutputFormat::Text => {
            if result.status {
                println!("{} {}", "OK".green().bold(), result.message);
            } else {
                println!("{} {}", "FAILED".red().bold(), result.message);
            }
            if let Some(object) = &result.serializable_object {
                println!("{}", pretty(object));
            }
        }
    }
}

pub fn print_broadcast(broadcast: &Broadcast, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", compact(broadcast)),
        OutputFormat::Text => {
            println!("{} {}", broadcast.broadcast.cyan(), compact(&broadcast.data).dimmed());
        }
    }
}

fn pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

fn compact<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}
