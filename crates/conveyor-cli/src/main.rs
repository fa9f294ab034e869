//! Conveyor CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;
mod output;

use commands::{Commands, ConfigCommands};
use config::{CliConfig, LogFormat};

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    /// Log line format (overrides the config file)
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so reports on stdout stay machine-readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (config, config_error) = match CliConfig::config_path() {
        Ok(path) => CliConfig::load_or_default(&path),
        Err(e) => (CliConfig::default(), Some(e)),
    };
    init_tracing(cli.log_format.unwrap_or(config.log_format));
    if let Some(e) = config_error {
        warn!(error = %e, "Ignoring unreadable config file, using defaults");
    }

    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Init { path } => handlers::init(&path)?,
        Commands::Validate { path } => {
            handlers::validate(&handlers::find_pipeline_file(path, &cwd)?)?
        }
        Commands::Plan { file, event } => {
            handlers::plan(&handlers::find_pipeline_file(file, &cwd)?, event)?
        }
        Commands::Run {
            file,
            event,
            branch,
            action,
            target_branch,
            event_file,
            max_parallel,
            timeout_minutes,
            skip_actions,
            workspace,
        } => {
            let opts = handlers::RunOptions {
                file: handlers::find_pipeline_file(file, &cwd)?,
                event,
                branch,
                action,
                target_branch,
                event_file,
                max_parallel,
                timeout_minutes,
                skip_actions,
                workspace,
            };
            return handlers::run_pipeline(&config, opts).await;
        }
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
