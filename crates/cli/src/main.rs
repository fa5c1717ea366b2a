use clap::{Parser, Subcommand};

mod commands;

use commands::{ConfigArgs, RegistryArgs, RunArgs};

#[derive(Parser)]
#[command(name = "pm-arb")]
#[command(about = "Cross-venue arbitrage between Polymarket and Kalshi", long_about = None)]
struct Cli {
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded quotes through the pipeline and emit opportunity records
    Run(RunArgs),
    /// Print the resolved settings as JSON
    Config(ConfigArgs),
    /// Inspect or extend the canonical event registry
    Registry(RegistryArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            // stdout carries records, so logs go to stderr.
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    match cli.command {
        Commands::Run(args) => commands::run_replay(args).await?,
        Commands::Config(args) => commands::run_config(&args)?,
        Commands::Registry(args) => commands::run_registry(args)?,
    }

    Ok(())
}
