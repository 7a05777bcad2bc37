//! # Leaseq CLI
//!
//! Command-line interface for leaseq queues.
//!
//! This module provides CLI commands for:
//! - Pushing, pulling and deleting messages
//! - Inspecting and replaying the durable log
//! - Configuration validation
//!
//! Results are written to stdout as JSON; logs go to stderr.

use clap::{Parser, Subcommand};
use leaseq_runtime::{
    ConfigurationError, FileConfig, FileQueue, Message, ProviderConfig, QueueClientFactory,
    QueueConfig, QueueError, QueueName, SystemClock,
};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Leaseq CLI - visibility-timeout queues over a shared log
#[derive(Debug, Parser)]
#[command(name = "leaseq")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Visibility-timeout message queues backed by a shared log")]
pub struct Cli {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, env = "LEASEQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Use the durable log in this directory, overriding the configured provider
    #[arg(long, global = true)]
    pub base_path: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Push a message onto a queue
    Push {
        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Message content
        #[arg(short = 'm', long)]
        content: String,

        /// Explicit handle instead of a generated one
        #[arg(long)]
        handle: Option<String>,
    },

    /// Lease the next visible message
    Pull {
        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Lease length in seconds (minimum 30)
        #[arg(short = 't', long)]
        visibility_timeout: Option<u32>,
    },

    /// Delete a pulled message
    Delete {
        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Handle returned by pull
        #[arg(long)]
        handle: String,

        /// Lease expiry returned by pull (ms)
        #[arg(long)]
        visibility_timestamp: i64,
    },

    /// Show pending and in-flight messages, or list queues
    Inspect {
        /// Queue name; lists all queues when omitted
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Replay the log and report what was applied
    Replay,

    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "json")]
        format: ConfigFormat,
    },
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(QueueError::Configuration(_)) => 1,
            Self::Queue(QueueError::InvalidRequest(_)) => 3,
            Self::Queue(QueueError::Io { .. }) => 4,
            Self::Queue(_) => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Io(_) => 4,
            Self::Serialization { .. } => 5,
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for CliError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let config = resolve_config(&cli)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute(cli.command, config, &mut out).await
}

/// Install the global subscriber. `RUST_LOG` wins over `--log-level`.
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

/// Load configuration and apply command-line overrides
pub fn resolve_config(cli: &Cli) -> Result<QueueConfig, CliError> {
    let config = QueueConfig::load(cli.config.as_deref())?;
    let config = apply_overrides(config, cli.base_path.as_deref())?;

    if !config.provider_type().is_shared() {
        warn!("In-memory provider selected; nothing persists after this command");
    }
    Ok(config)
}

/// `--base-path` selects the durable log in that directory, keeping any
/// configured file name
pub fn apply_overrides(
    mut config: QueueConfig,
    base_path: Option<&Path>,
) -> Result<QueueConfig, CliError> {
    let Some(base_path) = base_path else {
        return Ok(config);
    };

    match &mut config.provider {
        ProviderConfig::File(file) => file.base_path = base_path.to_path_buf(),
        _ => {
            config.provider = ProviderConfig::File(FileConfig {
                base_path: base_path.to_path_buf(),
                ..FileConfig::default()
            })
        }
    }
    config.validate()?;
    Ok(config)
}

/// Run one command against `config`, writing results to `out`
pub async fn execute(
    command: Commands,
    config: QueueConfig,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    match command {
        Commands::Push {
            queue,
            content,
            handle,
        } => {
            let client = QueueClientFactory::create_client(config).await?;
            let message = client.push(&queue, &content, handle.as_deref()).await?;
            info!(queue = %queue, handle = %message.handle, "Pushed message");
            write_json(out, &message)
        }
        Commands::Pull {
            queue,
            visibility_timeout,
        } => {
            let client = QueueClientFactory::create_client(config).await?;
            let message = client.pull(&queue, visibility_timeout).await?;
            write_json(out, &message)
        }
        Commands::Delete {
            queue,
            handle,
            visibility_timestamp,
        } => {
            let uri = QueueName::new(queue).map_err(QueueError::from)?;
            let message = Message::new(uri, handle, String::new(), visibility_timestamp);

            let client = QueueClientFactory::create_client(config).await?;
            let outcome = client.delete(&message).await?;
            write_json(
                out,
                &json!({
                    "queue": message.uri,
                    "handle": message.handle,
                    "outcome": outcome,
                }),
            )
        }
        Commands::Inspect { queue } => {
            let log = open_log(&config)?;
            match queue {
                Some(queue) => {
                    let uri = QueueName::new(queue).map_err(QueueError::from)?;
                    let snapshot = log.snapshot(&uri)?.ok_or_else(|| {
                        QueueError::QueueNotFound {
                            queue_name: uri.to_string(),
                        }
                    })?;
                    write_json(out, &snapshot)
                }
                None => write_json(out, &log.queue_names()?),
            }
        }
        Commands::Replay => {
            let log = open_log(&config)?;
            let report = log.replay()?;
            write_json(
                out,
                &json!({
                    "applied": report.applied,
                    "torn_tail": report.torn_tail,
                    "records": log.cursor().records,
                }),
            )
        }
        Commands::Config { show, format } => {
            if !show {
                writeln!(out, "Configuration OK ({:?} provider)", config.provider_type())?;
                return Ok(());
            }
            let redacted = redact(config);
            match format {
                ConfigFormat::Json => write_json(out, &redacted),
                ConfigFormat::Yaml => {
                    out.write_all(serde_yaml::to_string(&redacted)?.as_bytes())?;
                    Ok(())
                }
            }
        }
    }
}

fn open_log(config: &QueueConfig) -> Result<FileQueue, CliError> {
    match &config.provider {
        ProviderConfig::File(file) => Ok(FileQueue::from_config(file, Arc::new(SystemClock))?),
        _ => Err(CliError::InvalidArgument {
            arg: "provider".to_string(),
            message: "inspect and replay need the file provider".to_string(),
        }),
    }
}

fn redact(mut config: QueueConfig) -> QueueConfig {
    if let ProviderConfig::AwsSqs(sqs) = &mut config.provider {
        if sqs.secret_access_key.is_some() {
            sqs.secret_access_key = Some("<redacted>".to_string());
        }
    }
    config
}

fn write_json<T: serde::Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<(), CliError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
