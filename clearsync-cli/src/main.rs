mod commands;
mod config;

use clap::{Parser, Subcommand};
use clearsync_core::{ClearsyncError, Network};
use config::CliConfig;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clearsync")]
#[command(about = "clearsync - payment channels with a clearing coordinator")]
#[command(version)]
struct Cli {
    /// Data directory for the keystore, config and channel database
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Network preset (base, local)
    #[arg(short, long, global = true)]
    network: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change the client configuration
    #[command(subcommand)]
    Config(commands::ConfigCommands),

    /// Wallet key management
    #[command(subcommand)]
    Wallet(commands::WalletCommands),

    /// Open, fund, close and inspect the payment channel
    #[command(subcommand)]
    Channel(commands::ChannelCommands),

    /// Custody contract balance and withdrawals
    #[command(subcommand)]
    Custody(commands::CustodyCommands),

    /// App sessions inside the channel
    #[command(subcommand)]
    Session(commands::SessionCommands),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "clearsync_core={},clearsync={}",
            log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(CliConfig::default_data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let network = cli.network.as_deref().map(Network::from_str).transpose()?;
    let config = CliConfig::load(&data_dir, network).await?;
    let context = commands::Context::new(config);

    let result = match cli.command {
        Commands::Config(cmd) => commands::handle_config_command(cmd, context).await,
        Commands::Wallet(cmd) => commands::handle_wallet_command(cmd, &context).await,
        Commands::Channel(cmd) => commands::handle_channel_command(cmd, &context).await,
        Commands::Custody(cmd) => commands::handle_custody_command(cmd, &context).await,
        Commands::Session(cmd) => commands::handle_session_command(cmd, &context).await,
    };

    if let Err(e) = result {
        match e {
            ClearsyncError::AuthenticationFailed(reason) => {
                eprintln!("Error: Authentication failed: {}", reason);
                eprintln!("Check the coordinator URL with 'clearsync config show'");
            }
            ClearsyncError::InvalidState(reason) if reason.contains("resume") => {
                eprintln!("Error: {}", reason);
                eprintln!("Run 'clearsync channel resume' to reconcile with the chain");
            }
            ClearsyncError::Busy(reason) => {
                eprintln!("Error: {}", reason);
            }
            _ => {
                eprintln!("Error: {}", e);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
