use clap::{Parser, Subcommand};
use logship::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logship")]
#[command(about = "Tail log files and ship normalized records to nsq", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the configured sources and ship them (default)
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a commented starter config
    Init {
        #[arg(long)]
        stdout: bool,
    },
    /// Load and validate the config, then exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logship=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            let Some(config_path) = config_path else {
                eprintln!("Error: config not found");
                eprintln!("Searched locations:");
                eprintln!("  ~/.config/logship/config.yml");
                eprintln!("  /etc/logship/config.yml");
                eprintln!("\nUse --config <path> to specify a config file, or run 'logship config init' to generate one.");
                std::process::exit(1);
            };
            logship::cli::run::run(&config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => logship::cli::config::init(stdout)?,
            ConfigAction::Validate => logship::cli::config::validate(config_path)?,
        },
    }

    Ok(())
}
