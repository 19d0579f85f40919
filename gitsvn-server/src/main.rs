//! gitsvn - serve git repositories to SVN clients over svn://.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gitsvn_server::{Config, RepositoryRegistry, Session};

#[derive(Parser, Debug)]
#[command(name = "gitsvn")]
#[command(version)]
#[command(about = "Serve git repositories to SVN clients over svn://", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Configuration file (TOML)
        #[arg(short, long, default_value = "gitsvn.toml")]
        config: String,

        /// Override the configured listen address
        #[arg(short, long)]
        addr: Option<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Write a sample configuration file
    #[command(name = "init-config")]
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "gitsvn.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, addr, debug } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let config_path = Path::new(&config);
            let mut config = Config::from_file(config_path)
                .map_err(|err| anyhow!("failed to load {}: {err}", config_path.display()))?;
            if let Some(addr) = addr {
                config.listen = addr;
            }
            run_server(config).await
        }
        Commands::InitConfig { output } => {
            let sample = Config::sample();
            let text = toml::to_string_pretty(&sample)?;
            std::fs::write(&output, text)?;
            println!("Wrote sample configuration to {output}");
            println!("Edit the repository paths, then run: gitsvn start -c {output}");
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let registry = RepositoryRegistry::open(&config).await?;
    let listener = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, repos = config.repositories.len(), "gitsvn listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let (read, write) = stream.into_split();
            let mut session = Session::new(registry, read, write);
            if let Err(err) = session.run().await {
                error!(%peer, error = %err, "session ended with error");
            }
        });
    }
}
