//! Kino EME CLI - Init Data and License Server Tool
//!
//! Features:
//! - Protection box listing and extraction
//! - FairPlay content id derivation
//! - Key system configuration validation
//! - Certificate and license requests against real servers

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

/// Kino EME CLI - Encrypted media toolkit
#[derive(Parser)]
#[command(name = "kino-eme")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Inspect init data and exercise DRM license servers", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the pssh boxes in init data
    Pssh {
        /// Base64 init data, or @path to a binary file
        init_data: String,

        /// Print only the box for this DRM system (widevine, playready, fairplay, clearkey)
        #[arg(short, long)]
        extract: Option<String>,
    },

    /// Derive the FairPlay content id from init data
    ContentId {
        /// Base64 UTF-16 init data, or @path to a binary file
        #[arg(required_unless_present = "uri")]
        init_data: Option<String>,

        /// Plain skd:// URI instead of init data
        #[arg(short, long)]
        uri: Option<String>,
    },

    /// Validate an options file and show negotiation candidates
    Config {
        /// JSON options file
        file: PathBuf,
    },

    /// Fetch a server certificate
    Certificate {
        /// Certificate URL
        url: String,

        /// Extra header as name:value
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Write the certificate to a file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Request timeout in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Send a key message to a license server
    License {
        /// Key system the message belongs to
        key_system: String,

        /// License server URL
        url: String,

        /// Base64 key message, or @path to a binary file
        #[arg(short, long)]
        message: String,

        /// Extra header as name:value
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Write the license to a file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Request timeout in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();
    kino_eme::init();

    match cli.command {
        Commands::Pssh { init_data, extract } => {
            commands::pssh(&init_data, extract.as_deref(), &cli.format)?;
        }
        Commands::ContentId { init_data, uri } => {
            commands::content_id(init_data.as_deref(), uri.as_deref(), &cli.format)?;
        }
        Commands::Config { file } => {
            commands::config(&file, &cli.format)?;
        }
        Commands::Certificate { url, headers, output, timeout } => {
            commands::certificate(&url, &headers, output, timeout, &cli.format).await?;
        }
        Commands::License { key_system, url, message, headers, output, timeout } => {
            commands::license(&key_system, &url, &message, &headers, output, timeout, &cli.format).await?;
        }
    }

    Ok(())
}
