//! bundlekit CLI - fetch and verify resource bundles
//!
//! Downloads bundles through a resumable, throttled, checksum-verified
//! engine and validates previously published files against their sidecars.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use bundlekit_core::SettingsStore;
use bundlekit_types::ChecksumKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// bundlekit - resource bundle fetcher
#[derive(Parser)]
#[command(name = "bundlekit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding settings.json
    #[arg(long, env = "BUNDLEKIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download bundles into the cache directory
    Fetch(FetchArgs),

    /// Check published bundles against their sidecar records
    Verify {
        /// Bundle files to check
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Re-hash each file instead of trusting the recorded size
        #[arg(long)]
        deep: bool,

        /// Algorithm for --deep (defaults to the configured one)
        #[arg(long)]
        algorithm: Option<ChecksumKind>,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// Bundle names, resolved against the base URLs
    names: Vec<String>,

    /// JSON manifest: an array of bundle descriptors
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Download from this exact URL (single bundle only)
    #[arg(long)]
    url: Option<String>,

    /// Extra base URL, tried before the configured ones
    #[arg(short, long = "base-url")]
    base_urls: Vec<String>,

    /// Expected checksum (single bundle only)
    #[arg(long)]
    checksum: Option<String>,

    /// Expected size in bytes (single bundle only)
    #[arg(long)]
    size: Option<u64>,

    /// Output directory (defaults to the configured cache directory)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Rate cap in bytes/sec, 0 for unlimited
    #[arg(long)]
    rate: Option<u64>,

    /// Attempt budget, 0 to retry forever
    #[arg(long)]
    retries: Option<u32>,

    /// Checksum algorithm
    #[arg(long)]
    algorithm: Option<ChecksumKind>,

    /// Download even when a valid cached copy exists
    #[arg(short, long)]
    force: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value (JSON or plain string)
        value: String,
    },

    /// Show all config
    Show,

    /// Write the default settings file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::config_dir()
            .map(|d| d.join("bundlekit"))
            .unwrap_or_else(|| PathBuf::from(".bundlekit"))
    });
    let store = SettingsStore::new(data_dir).await?;

    // Execute command
    match cli.command {
        Commands::Fetch(args) => commands::fetch(&store, args, cli.output).await?,

        Commands::Verify {
            paths,
            deep,
            algorithm,
        } => commands::verify(&store, paths, deep, algorithm, cli.output).await?,

        Commands::Config { action } => commands::config_action(&store, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "bundlekit", &mut std::io::stdout());
        }
    }

    Ok(())
}
