//! CLI Commands Module
//!
//! Subcommands of the `office-presence` binary.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::AgentConfig;
use crate::logging;
use crate::service::{LogObserver, NoopObserver, PresenceService};

const PASSWORD_ENV: &str = "OFFICE_PRESENCE_PASSWORD";

/// Office Wi-Fi presence agent
#[derive(Debug, Parser)]
#[command(name = "office-presence", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Watch the network and report presence until Ctrl-C (default)
    Run,
    /// Sign in and store the session
    Login {
        #[arg(short, long)]
        email: String,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Print the current presence and sync status as JSON
    Status,
}

impl Cli {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let config = AgentConfig::load(self.config.as_deref()).context("Failed to load configuration")?;

        match self.command.as_ref().unwrap_or(&Command::Run) {
            Command::Run => run(config).await,
            Command::Login { email } => login(config, email).await,
            Command::Logout => logout(config).await,
            Command::Status => status(config),
        }
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    logging::init(&config.log_dir());
    info!("Office presence agent v{} starting", env!("CARGO_PKG_VERSION"));

    let service = PresenceService::open(config, Arc::new(LogObserver::default()))
        .context("Failed to open presence service")?;

    if !service.tokens().is_authenticated() {
        info!("No stored session, events are queued until `office-presence login`");
    }

    service.start();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    service.shutdown().await;
    Ok(())
}

async fn login(config: AgentConfig, email: &str) -> anyhow::Result<()> {
    logging::init_console();

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => password,
        _ => read_password_line()?,
    };
    if password.is_empty() {
        bail!("Password must not be empty");
    }

    let service = PresenceService::open(config, Arc::new(NoopObserver))?;
    let session = service.login(email, &password).await?;

    println!("Logged in as {} (token valid until {})", session.email, session.expires_at);
    Ok(())
}

fn read_password_line() -> anyhow::Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn logout(config: AgentConfig) -> anyhow::Result<()> {
    logging::init_console();

    let service = PresenceService::open(config, Arc::new(NoopObserver))?;
    if !service.tokens().is_authenticated() {
        println!("Not logged in");
        return Ok(());
    }

    service.logout().await?;
    println!("Logged out");
    Ok(())
}

fn status(config: AgentConfig) -> anyhow::Result<()> {
    logging::init_console();

    let service = PresenceService::open(config, Arc::new(NoopObserver))?;
    let status = serde_json::to_string_pretty(&service.status())?;
    println!("{status}");
    Ok(())
}
