use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use vault_secret_proxy::agent::config::Config;
use vault_secret_proxy::agent::retrieval::SecretRetriever;
use vault_secret_proxy::comms::local_api;
use vault_secret_proxy::utils;

#[derive(Parser)]
#[command(name = "secret-proxy", version, about = "Vault secret retrieval proxy")]
struct AppCli {
    /// Subcommands (default: serve)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Listening port; overrides PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Fetch one secret and print it as `key:value ` pairs
    Fetch {
        /// Secret path under the KV mount; defaults to VAULT_SECRET_PATH
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let config = Config::from_env()?;
    info!(version = vault_secret_proxy::VERSION, "secret-proxy starting");

    match args.command {
        Some(Commands::Fetch { path }) => {
            let retriever = SecretRetriever::from_config(&config)?;
            let path = path.unwrap_or_else(|| retriever.default_secret_path().to_string());
            let payload = retriever.retrieve(&path).await?;
            println!("{}", payload.render_pairs().trim_end());
        }
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(config.port);
            info!("Starting secret proxy on port {port}");
            local_api::serve(&config, port).await?;
        }
        None => {
            info!("Starting secret proxy on port {}", config.port);
            local_api::serve(&config, config.port).await?;
        }
    }

    Ok(())
}
