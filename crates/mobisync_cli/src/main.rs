//! mobisync CLI
//!
//! Runs the sync server and inspects its artifacts.
//!
//! # Commands
//!
//! - `serve` - Run the HTTP sync server
//! - `token` - Verify and decode a sync token
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use commands::serve::ServeOptions;
use tracing_subscriber::EnvFilter;

/// mobisync sync server and tools.
#[derive(Parser)]
#[command(name = "mobisync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP sync server
    Serve(ServeOptions),

    /// Verify and decode a sync token
    Token {
        /// The token to inspect
        token: String,

        /// Secret the server signs tokens with
        #[arg(long, env = "MOBISYNC_TOKEN_SECRET", hide_env_values = true)]
        secret: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve(options) => commands::serve::run(options)?,
        Commands::Token {
            token,
            secret,
            format,
        } => commands::token::run(&token, &secret, &format)?,
        Commands::Version => {
            println!("mobisync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("sync protocol v{}", mobisync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
