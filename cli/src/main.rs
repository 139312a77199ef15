//! Tether Agent CLI
//!
//! Starts the ACP server on stdio (the default) or the one-shot HTTP
//! surface, and exposes an `auth` subtree that delegates to the upstream
//! assistant bridge.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tether_agent_lib::{AgentConfig, AgentServer, AssistantBridge, EchoBridge};
use tracing_subscriber::EnvFilter;

/// Tether Agent - Agent Client Protocol server
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (overrides the TETHER_LOG environment variable)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve ACP over stdio (the default when no subcommand is given)
    Serve,
    /// Serve the single-shot HTTP surface
    ServeHttp {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:8137")]
        addr: std::net::SocketAddr,
    },
    /// Authentication against the upstream assistant
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Log in to the upstream assistant
    Login,
    /// Log out of the upstream assistant
    Logout,
    /// Show authentication status
    Status,
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            AgentConfig::from_json(&raw)?
        }
        None => AgentConfig::default(),
    };
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_auth(bridge: Arc<dyn AssistantBridge>, action: AuthAction) -> Result<()> {
    match action {
        AuthAction::Login => {
            let status = bridge.check_auth().await?;
            if status.authenticated {
                println!("Already authenticated");
            } else {
                println!("Authentication is handled by the upstream assistant; run its login flow");
            }
        }
        AuthAction::Logout => {
            println!("Logout is handled by the upstream assistant");
        }
        AuthAction::Status => {
            let status = bridge.check_auth().await?;
            match (status.authenticated, status.method) {
                (true, Some(method)) => println!("Authenticated via {}", method),
                (true, None) => println!("Authenticated"),
                (false, _) => println!("Not authenticated"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // --log-level wins, then TETHER_LOG, then the config default.
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env("TETHER_LOG")
            .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone())),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("Tether Agent v{}", env!("CARGO_PKG_VERSION"));

    let bridge: Arc<dyn AssistantBridge> = Arc::new(EchoBridge);

    match cli.command {
        None | Some(Command::Serve) => {
            let server = AgentServer::new(config, bridge);
            server.start_with_shutdown().await?;
        }
        Some(Command::ServeHttp { addr }) => {
            let server = AgentServer::new(config, bridge);
            server.serve_http(addr).await?;
        }
        Some(Command::Auth { action }) => {
            run_auth(bridge, action).await?;
        }
    }

    Ok(())
}
