use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{DocCommand, StatusCommand};
use docsync::config::ClientConfig;

#[derive(Parser)]
#[command(name = "docsync")]
#[command(version)]
#[command(about = "Collaborative document editing from the command line", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, edit and follow documents
    Doc(DocCommand),

    /// Show configuration and server status
    Status(StatusCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsync=warn,docsync_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = ClientConfig::load(cli.config.clone())?;

    match cli.command {
        Some(Commands::Doc(cmd)) => {
            cmd.run(&config).await?;
        }
        Some(Commands::Status(cmd)) => {
            cmd.run(&config, cli.config).await;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
