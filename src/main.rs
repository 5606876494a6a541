use clap::{Parser, Subcommand};
use std::error::Error;

use pqlink::commands::client::ClientConfig;
use pqlink::cryptography::NonceMode;
use pqlink::{DEFAULT_SERVER_ADDR, DEFAULT_SERVER_PORT};

#[derive(Parser)]
#[command(name = "pqlink")]
#[command(about = "Peer discovery and post-quantum encrypted direct chat", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server
    Server {
        /// Port to bind to
        #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
    },
    /// Run an interactive chat client
    Client {
        /// Rendezvous server address
        #[arg(short, long, default_value = DEFAULT_SERVER_ADDR)]
        server: String,
        /// Username to register (will prompt if not provided)
        #[arg(short, long)]
        username: Option<String>,
        /// Port to accept direct connections on (will prompt if not provided)
        #[arg(short, long)]
        listen_port: Option<u16>,
        /// Dial peers by address without registering
        #[arg(short, long, conflicts_with_all = ["username", "listen_port"])]
        anonymous: bool,
        /// Reuse the session IV for every message (legacy peers only)
        #[arg(long)]
        static_nonce: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Server { port } => {
            pqlink::commands::server::run(port).await?;
        }
        Commands::Client {
            server,
            username,
            listen_port,
            anonymous,
            static_nonce,
        } => {
            let config = ClientConfig {
                server,
                username,
                listen_port,
                anonymous,
                nonce_mode: if static_nonce {
                    NonceMode::Static
                } else {
                    NonceMode::Counter
                },
            };
            pqlink::commands::client::run(config).await?;
        }
    }

    Ok(())
}
