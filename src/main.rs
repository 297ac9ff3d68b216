//! Vitalgate CLI
//!
//! Health wearables ingestion gateway.

use clap::{Parser, Subcommand};
use vitalgate::{Config, ProviderKind, VERSION};

#[derive(Parser)]
#[command(name = "vitalgate")]
#[command(version = VERSION)]
#[command(about = "Health wearables ingestion gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ingestion gateway
    Serve {
        /// Port to bind to (0 for random)
        #[arg(long)]
        port: Option<u16>,

        /// Secret the credential vault key is derived from
        #[arg(long, env = "VITALGATE_VAULT_SECRET")]
        vault_secret: Option<String>,
    },

    /// Show configuration
    Config,

    /// List supported providers and their capabilities
    Providers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vitalgate=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, vault_secret } => {
            cmd_serve(port, vault_secret).await?;
        }
        Commands::Config => {
            cmd_config()?;
        }
        Commands::Providers => {
            cmd_providers();
        }
    }

    Ok(())
}

async fn cmd_serve(port: Option<u16>, vault_secret: Option<String>) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(secret) = vault_secret {
        config.vault_secret = secret;
    }
    if config.vault_secret == "change-me" {
        tracing::warn!("vault secret is the default; set VITALGATE_VAULT_SECRET in production");
    }

    let (addr, _shutdown_tx) = vitalgate::server::run(config).await?;
    println!("vitalgate listening on http://{addr}");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    let config = Config::load()?;
    println!("Config path: {}", Config::config_path().display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_providers() {
    println!("{:<16} {:<6}", "PROVIDER", "MODE");
    for provider in ProviderKind::ALL {
        let mode = match provider.capability() {
            vitalgate::Capability::Push => "push",
            vitalgate::Capability::Pull => "pull",
        };
        println!("{:<16} {:<6}", provider.as_str(), mode);
    }
}
