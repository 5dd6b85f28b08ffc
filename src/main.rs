#![forbid(unsafe_code)]

use anyhow::Result;
use cardlink::config::Config;
use cardlink::gateway;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Card-paired authentication server with a realtime chat relay.
#[derive(Parser, Debug)]
#[command(name = "cardlink", version, about)]
struct Cli {
    /// Config file (default: ~/.cardlink/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP and WebSocket gateway (default)
    Serve,
    /// Provision card pairs and print their tokens
    Cardgen {
        /// Number of pairs to generate
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

fn init_tracing(config: &Config) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(&config.log.level)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config);

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            println!("Config OK: {}", config.config_path.display());
            Ok(())
        }
        Command::Cardgen { count } => {
            let lifecycle = cardlink::build_lifecycle(&config)?;
            let base_url = config
                .server
                .base_url
                .as_deref()
                .map(|u| u.trim_end_matches('/').to_string());
            for _ in 0..count {
                let pair = lifecycle.provision_pair()?;
                println!("pair    {}", pair.tokens.pair_id);
                for token in [&pair.tokens.first, &pair.tokens.second] {
                    match &base_url {
                        Some(url) => println!("  {token}  {url}/card/{token}"),
                        None => println!("  {token}"),
                    }
                }
            }
            Ok(())
        }
        Command::Serve => {
            let lifecycle = cardlink::build_lifecycle(&config)?;
            tracing::info!("Starting cardlink on {}", config.bind_addr());
            gateway::run_gateway(config, lifecycle).await
        }
    }
}
