mod report;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use qp_core::config::error::ConfigError;
use qp_core::config::loader::load_config;
use qp_core::config::models::AppConfig;
use qp_core::forwarder::Forwarder;
use qp_core::handler::StageHandlers;
use qp_core::logging::init_tracing;
use qp_core::processor::SimulatedWork;
use qp_core::runtime::{HostOptions, PipelineHost};
use qp_core::transport::{InMemoryBroker, OutboundMessage};
use qp_protocol::{validate, StageId};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Broker used when neither `--connection` nor the configured setting is set.
const LOCAL_CONNECTION: &str = "memory://local";

#[derive(Parser)]
#[command(name = "qpipe")]
#[command(about = "Run and inspect the three-stage queue pipeline locally")]
#[command(version)]
struct Cli {
    /// Directory containing `.queue-pipeline/config.toml`
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a message against a stage's expected shape
    Validate {
        /// Stage to validate for (`step2`, `2` or `pipeline-step2`)
        #[arg(long)]
        stage: StageId,

        /// JSON file, or `-` for stdin
        input: String,
    },
    /// Submit a message to the first stage and drain the pipeline
    Run {
        /// JSON file, or `-` for stdin
        input: String,

        /// Simulated work per stage, overriding `work-delay-ms`
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Broker connection string, overriding the configured setting
        #[arg(long)]
        connection: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = load_config(&cli.root)
        .await
        .wrap_err_with(|| format!("loading configuration from {}", cli.root.display()))?;
    init_tracing(&config.global.logging).map_err(|e| eyre!(e))?;

    match cli.command {
        Commands::Validate { stage, input } => validate_command(stage, &input).await,
        Commands::Run {
            input,
            delay_ms,
            connection,
        } => run_command(&config, &input, delay_ms, connection).await,
    }
}

async fn read_input(input: &str) -> Result<Value> {
    let text = if input == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .wrap_err("reading message from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(Path::new(input))
            .await
            .wrap_err_with(|| format!("reading message from {input}"))?
    };

    serde_json::from_str(&text).wrap_err("message is not valid JSON")
}

async fn validate_command(stage: StageId, input: &str) -> Result<ExitCode> {
    let raw = read_input(input).await?;

    match validate(&raw, stage) {
        Ok(message) => {
            report::print_valid(&message);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            report::print_invalid(&e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn resolve_connection(config: &AppConfig, flag: Option<String>) -> Result<String> {
    if let Some(connection) = flag {
        return Ok(connection);
    }
    match config.connection_string() {
        Ok(connection) => Ok(connection),
        Err(ConfigError::MissingConnection { setting }) => {
            tracing::debug!(setting = %setting, "Connection setting unset, using local broker");
            Ok(LOCAL_CONNECTION.to_string())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_command(
    config: &AppConfig,
    input: &str,
    delay_ms: Option<u64>,
    connection: Option<String>,
) -> Result<ExitCode> {
    let raw = read_input(input).await?;

    let connection = resolve_connection(config, connection)?;
    let broker = InMemoryBroker::from_connection_string(&connection)?;

    let delay = delay_ms.map_or_else(|| config.work_delay(), Duration::from_millis);
    let handlers = StageHandlers::standard(
        Arc::new(SimulatedWork::new(delay)),
        Forwarder::new(Arc::new(broker.clone())),
    );
    let host = PipelineHost::new(broker.clone(), handlers, HostOptions::from(&config.global));

    let entry = StageId::Step1;
    broker.enqueue(entry.queue_name(), OutboundMessage::new(raw))?;

    let drained = host.drain().await?;
    report::print_drain(&drained);

    if drained.dead_lettered.is_empty() && drained.terminated_invalid == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_connection_wins() {
        let config = AppConfig::default();
        let connection = resolve_connection(&config, Some("memory://flag".into())).unwrap();
        assert_eq!(connection, "memory://flag");
    }

    #[test]
    fn test_cli_parses_stage_forms() {
        for form in ["step2", "2", "pipeline-step2"] {
            let cli = Cli::try_parse_from(["qpipe", "validate", "--stage", form, "-"]).unwrap();
            match cli.command {
                Commands::Validate { stage, .. } => assert_eq!(stage, StageId::Step2),
                Commands::Run { .. } => panic!("parsed the wrong command"),
            }
        }
    }

    #[test]
    fn test_cli_rejects_unknown_stage() {
        assert!(Cli::try_parse_from(["qpipe", "validate", "--stage", "step9", "-"]).is_err());
    }
}
