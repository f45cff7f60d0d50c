use clap::{Parser, Subcommand};

mod commands;

use commands::{CheckConfigArgs, PaperReplayArgs};

#[derive(Parser)]
#[command(name = "updown")]
#[command(about = "Position lifecycle manager for 15-minute up/down markets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and print the configuration
    CheckConfig(CheckConfigArgs),
    /// Replay recorded market frames through the lifecycle manager on a paper book
    PaperReplay(PaperReplayArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match &cli.command {
        Commands::PaperReplay(PaperReplayArgs {
            log_file: Some(path),
            ..
        }) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(env_filter()).init();
        }
    }

    match cli.command {
        Commands::CheckConfig(args) => commands::run_check_config(&args),
        Commands::PaperReplay(args) => commands::run_paper_replay(args).await,
    }
}
