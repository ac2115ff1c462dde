//! Wishlist CLI - database migrations and maintenance tools.
//!
//! # Usage
//!
//! ```bash
//! # Apply document store migrations
//! wl-cli migrate
//!
//! # Check every claim ledger for integrity violations
//! wl-cli audit claims
//!
//! # Validate server configuration without starting it
//! wl-cli config check
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "wl-cli")]
#[command(author, version, about = "Wishlist engine CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Audit stored data
    Audit {
        #[command(subcommand)]
        target: AuditTarget,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum AuditTarget {
    /// Verify at most one active purchase per item
    Claims,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load configuration from the environment and report problems
    Check,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Audit { target } => match target {
            AuditTarget::Claims => {
                let violations = commands::audit::claims().await?;
                if violations > 0 {
                    return Err(format!("{violations} claim ledger violation(s)").into());
                }
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Check => commands::config::check()?,
        },
    }
    Ok(())
}
