//! Office Presence Agent - Main Entry Point
//!
//! Watches the wireless network and reports office presence to the
//! attendance service.

use clap::Parser;

use office_presence::commands::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.execute().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
