//! playd - audio mixing daemon and its companion client
//!
//! Subcommands:
//! - `playd serve` - Run the daemon (the default)
//! - `playd send <line...>` - Send one command and print the reply
//! - `playd listen` - Print everything the daemon publishes
//! - `playd config` - Print the effective configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use playconf::PlaydConfig;
use playd::{commands, Daemon};
use playproto::Endpoints;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "playd")]
#[command(about = "Audio mixing daemon controlled over ZMQ")]
#[command(version)]
struct Cli {
    /// Base port; sockets live at base+10000 (commands) and base+10001 (events)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Config file used in place of ./playd.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Serve,

    /// Send one command line and print the reply (exit 1 on FAIL)
    Send {
        /// Daemon host
        #[arg(long)]
        host: Option<String>,

        /// Group TAGS replies by tag name
        #[arg(long)]
        pretty: bool,

        /// Timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// The command, e.g. `PLAY file:///music/one.ogg`
        #[arg(required = true, num_args = 1..)]
        line: Vec<String>,
    },

    /// Print every line the daemon publishes
    Listen {
        /// Daemon host
        #[arg(long)]
        host: Option<String>,

        /// Publish address; asked from the daemon with PUBSUB when absent
        #[arg(long)]
        address: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = PlaydConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.bind.base_port = port;
    }

    let level = if cli.verbose {
        "debug"
    } else {
        config.telemetry.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("playd {} starting", env!("CARGO_PKG_VERSION"));
            let daemon = Daemon::from_config(&config)?;
            info!("commands on {}, events on {}", daemon.endpoints().reply, daemon.endpoints().publish);
            daemon.run().await?;
        }
        Commands::Send {
            host,
            pretty,
            timeout,
            line,
        } => {
            let host = host.unwrap_or_else(|| config.bind.connect_host.clone());
            let endpoints = Endpoints::connect(&host, config.bind.base_port)?;
            let timeout = Duration::from_millis(timeout.unwrap_or(config.daemon.client_timeout_ms));

            let ok = commands::send(&endpoints.reply, &line.join(" "), timeout, pretty).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Listen { host, address } => {
            let host = host.unwrap_or_else(|| config.bind.connect_host.clone());
            let endpoints = Endpoints::connect(&host, config.bind.base_port)?;
            let timeout = Duration::from_millis(config.daemon.client_timeout_ms);

            commands::listen(&endpoints, address.as_deref(), timeout).await?;
        }
        Commands::Config => {
            commands::print_config(&config, &sources);
        }
    }

    Ok(())
}
