//! `tableflow`: loads a JSON table, runs the configured plugins over it and
//! prints the visible rows as tab separated text.
//!
//! Settings come from a TOML file (created with defaults when missing); logs
//! go to stderr so stdout carries only the table.

mod cli;
mod runner;

use anyhow::anyhow;
use cli::CliArgs;
use tableflow_core::{LoggingSettings, RuntimeSettings};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
fn setup_logging(config: &LoggingSettings, json_format: bool) -> anyhow::Result<()> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_file(false)
                    .with_line_number(false)
                    .with_target(false),
            )
            .try_init()?;
    }

    info!("Logging initialized with level: {}", log_level);
    Ok(())
}

async fn load_settings(args: &CliArgs) -> anyhow::Result<RuntimeSettings> {
    let mut settings = RuntimeSettings::load_from_file(&args.config_path)
        .await
        .map_err(|e| anyhow!("failed to load {}: {}", args.config_path.display(), e))?;

    if let Some(level) = &args.log_level {
        settings.logging.level = level.clone();
    }
    settings
        .validate()
        .map_err(|e| anyhow!("invalid settings in {}: {}", args.config_path.display(), e))?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::try_parse().unwrap_or_else(|e| e.exit());

    let settings = load_settings(&args).await?;
    setup_logging(&settings.logging, args.json_logs)?;
    info!(
        "TableFlow v{} using {}",
        tableflow_core::TABLEFLOW_VERSION,
        args.config_path.display()
    );

    let data = runner::load_table(&args.table_path).await?;
    let output = runner::run(&args, settings, data).await?;

    print!("{}", output.to_tsv());
    if args.report {
        eprintln!("{}", output.report);
    }
    Ok(())
}
