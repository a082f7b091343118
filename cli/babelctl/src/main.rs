//! babelctl - operator CLI for the babel orchestrator.

use clap::Parser;

mod cli;
mod client;
mod error;
mod output;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error::print_error(&e);
            std::process::exit(1);
        }
    }
}
