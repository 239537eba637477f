//! gridxfer command-line client entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridxfer", version, about = "Resumable, retrying file transfers with bandwidth limits")]
struct Cli {
    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Upload ceiling in bytes per second (0 = unlimited)
    #[arg(long, global = true)]
    max_up: Option<u64>,

    /// Download ceiling in bytes per second (0 = unlimited)
    #[arg(long, global = true)]
    max_down: Option<u64>,

    /// Give up after this many seconds without success
    #[arg(long, global = true)]
    give_up_after: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a file, trying each URL in turn
    Get {
        /// Destination file
        #[arg(short, long)]
        output: PathBuf,
        /// Expected SHA-256 of the complete file (hex)
        #[arg(long)]
        sha256: Option<String>,
        /// Discard any partial file instead of resuming it
        #[arg(long)]
        no_resume: bool,
        /// Candidate URLs, most preferred first
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Upload a file to its canonical endpoint
    Put {
        /// File to send
        file: PathBuf,
        /// Upload URL
        url: String,
        /// First byte to send, when the server already holds the rest
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(max_up) = cli.max_up {
        config.transfer.max_bytes_sec_up = max_up;
    }
    if let Some(max_down) = cli.max_down {
        config.transfer.max_bytes_sec_down = max_down;
    }
    if let Some(secs) = cli.give_up_after {
        config.transfer.give_up_after_secs = secs;
    }

    let job = match cli.command {
        Command::Get {
            output,
            sha256,
            no_resume,
            urls,
        } => app::Job::Get {
            output,
            sha256,
            resume: !no_resume,
            urls,
        },
        Command::Put { file, url, offset } => app::Job::Put { file, url, offset },
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_up = config.transfer.max_bytes_sec_up,
        max_down = config.transfer.max_bytes_sec_down,
        "starting gridxfer"
    );

    // Transfers are driven from a single thread.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(app::run(config, job))?;

    Ok(())
}
