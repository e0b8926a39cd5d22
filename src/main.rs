use clap::{Parser, Subcommand};
use std::error::Error;

#[derive(Parser)]
#[command(name = "caesar-transfer")]
#[command(about = "End-to-end encrypted file transfer through a relay", long_about = None)]
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
    /// Send one or more files
    Send {
        /// Paths of the files to send
        #[arg(required = true)]
        paths: Vec<String>,
        /// Use this transfer name instead of generating one
        #[arg(short, long)]
        name: Option<String>,
        /// Relay to connect through, as host:port
        #[arg(short, long)]
        relay: Option<String>,
    },
    /// Receive a transfer by name
    Receive {
        /// The transfer name announced by the sender
        name: String,
        /// Directory to write received files into
        #[arg(short, long)]
        destination: Option<String>,
        /// Relay to connect through, as host:port
        #[arg(short, long)]
        relay: Option<String>,
        /// Overwrite existing files at the destination
        #[arg(long)]
        overwrite: bool,
    },
    /// Run a relay server
    Relay {
        /// Address to bind (default: 0.0.0.0)
        #[arg(short, long)]
        listen_addr: Option<String>,
        /// Port to bind (default: 8080)
        #[arg(short, long)]
        port: Option<u16>,
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
        Commands::Send { paths, name, relay } => {
            caesar_transfer::commands::send::run(paths, name, relay).await?;
        }
        Commands::Receive {
            name,
            destination,
            relay,
            overwrite,
        } => {
            caesar_transfer::commands::receive::run(name, destination, relay, overwrite).await?;
        }
        Commands::Relay { listen_addr, port } => {
            caesar_transfer::commands::relay::run(listen_addr, port).await?;
        }
    }

    Ok(())
}
