//! # Work Queue CLI
//!
//! Command-line interface for the durable work queue.
//!
//! This module provides CLI commands for:
//! - Publishing tasks (`send`, `new-task`)
//! - Consuming tasks (`receive`, `worker`)
//! - Running an in-process demonstration on the in-memory broker (`demo`)
//! - Generating and inspecting configuration (`config init`, `config show`)

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use work_queue_runtime::config::write_config_file;
use work_queue_runtime::{
    body_from_args, synthetic_body, Channel, ConfigError, Connection, ConnectionConfig,
    ConnectionFactory, ConsumerSession, ConsumerTag, InMemoryBroker, LoggingHandler,
    MarkerCostHandler, Producer, ProviderConfig, QueueDescriptor, QueueError, QueueName,
    SettingsLoader, Shutdown, Worker, WorkQueueSettings, WorkerStats,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Body published by `send` when none is given
pub const DEFAULT_BODY: &str = "Hello World!";

// ============================================================================
// CLI Structure
// ============================================================================

/// Work Queue CLI - durable task distribution over RabbitMQ
#[derive(Debug, Parser)]
#[command(name = "work-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Durable task distribution over RabbitMQ")]
#[command(
    long_about = "Publish persistent tasks to a durable queue and process them with fair-dispatch workers"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WORK_QUEUE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level or filter directive
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
    /// Publish a single persistent task
    Send {
        /// Task body words, joined with spaces
        body: Vec<String>,

        /// Queue to publish to, overriding the configuration
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Publish a series of tasks
    NewTask {
        /// Task body words; generated bodies are used when absent
        body: Vec<String>,

        /// Number of tasks to publish
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Marker characters appended to generated bodies
        #[arg(short, long, default_value = "1")]
        markers: u32,

        /// Queue to publish to, overriding the configuration
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Log every task without acknowledging it explicitly
    Receive {
        /// Queue to consume, overriding the configuration
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Process tasks one at a time with explicit acknowledgement
    Worker {
        /// Queue to consume, overriding the configuration
        #[arg(short, long)]
        queue: Option<String>,

        /// Maximum unacknowledged tasks held at once
        #[arg(short, long)]
        prefetch: Option<u16>,

        /// Simulated work per marker in milliseconds
        #[arg(short, long)]
        unit_ms: Option<u64>,
    },

    /// Run a producer and several workers against an in-process broker
    Demo {
        /// Number of workers
        #[arg(short, long, default_value = "2")]
        workers: usize,

        /// Number of tasks to publish
        #[arg(short, long, default_value = "6")]
        tasks: u32,

        /// Marker characters per task
        #[arg(short, long, default_value = "1")]
        markers: u32,

        /// Simulated work per marker in milliseconds
        #[arg(short, long, default_value = "100")]
        unit_ms: u64,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

/// Configuration subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Generate a connection file from DEV_* environment variables
    Init {
        /// File to write
        #[arg(short, long, default_value = "rabbit.yml")]
        output: PathBuf,

        /// Environment file loaded before reading variables (default: .env if present)
        #[arg(short, long)]
        env_file: Option<PathBuf>,

        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the resolved configuration
    Show {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Configuration output formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Queue(#[from] QueueError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(ConfigError::Write { .. }) => 7,
            Self::Configuration(_) => 3,
            Self::Queue(e) => match e {
                QueueError::ConnectionFailed { .. }
                | QueueError::ConnectionLost { .. }
                | QueueError::ChannelClosed { .. } => 2,
                QueueError::Configuration(ConfigError::Write { .. }) => 7,
                QueueError::Configuration(_) => 3,
                QueueError::DeclareMismatch { .. } | QueueError::QueueLocked { .. } => 4,
                QueueError::Timeout { .. } => 5,
                QueueError::Validation(_) => 6,
                _ => 1,
            },
            Self::CommandFailed { .. } => 1,
            Self::InvalidArgument { .. } => 6,
            Self::Io(_) => 7,
        }
    }

    /// Suggested wait before running the command again, for transient broker failures
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Queue(e) if e.is_transient() => e.retry_after(),
            _ => None,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Parse the process arguments and run the selected command
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli.log_level, cli.json_logs)?;
    run(cli).await
}

/// Run an already parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Send { body, queue } => {
            let settings = load_settings(config_path)?;
            execute_send_command(&settings, &body, queue.as_deref()).await
        }
        Commands::NewTask {
            body,
            count,
            markers,
            queue,
        } => {
            let bodies = task_bodies(&body, count, markers)?;
            let settings = load_settings(config_path)?;
            execute_new_task_command(&settings, bodies, queue.as_deref()).await
        }
        Commands::Receive { queue } => {
            let settings = load_settings(config_path)?;
            execute_receive_command(&settings, queue.as_deref()).await
        }
        Commands::Worker {
            queue,
            prefetch,
            unit_ms,
        } => {
            let mut settings = load_settings(config_path)?;
            if let Some(prefetch) = prefetch {
                settings.worker.prefetch_count = prefetch;
            }
            if let Some(unit_ms) = unit_ms {
                settings.worker.unit_millis = unit_ms;
            }
            execute_worker_command(&settings, queue.as_deref()).await
        }
        Commands::Demo {
            workers,
            tasks,
            markers,
            unit_ms,
        } => {
            let options = DemoOptions {
                workers,
                tasks,
                markers,
                unit: Duration::from_millis(unit_ms),
            };
            execute_demo_command(options).await
        }
        Commands::Config { action } => match action {
            ConfigCommands::Init {
                output,
                env_file,
                force,
            } => execute_config_init_command(&output, env_file.as_deref(), force),
            ConfigCommands::Show { format } => {
                let settings = load_settings(config_path)?;
                execute_config_show_command(&settings, format)
            }
        },
    }
}

/// Initialize logging; `RUST_LOG` takes precedence over `level`
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| CliError::InvalidArgument {
            arg: "--log-level".to_string(),
            message: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    result.map_err(|e| CliError::CommandFailed {
        message: format!("failed to initialize logging: {}", e),
    })
}

/// Load layered settings; an explicit path must exist
pub fn load_settings(path: Option<&Path>) -> Result<WorkQueueSettings, CliError> {
    let loader = match path {
        Some(path) => SettingsLoader::new().with_file(path),
        None => SettingsLoader::new(),
    };
    Ok(loader.load()?)
}

/// Queue declaration from settings, with an optional name override
pub fn queue_descriptor(
    settings: &WorkQueueSettings,
    queue: Option<&str>,
) -> Result<QueueDescriptor, CliError> {
    let mut descriptor = settings.queue.descriptor()?;
    if let Some(name) = queue {
        descriptor.name =
            QueueName::new(name.to_string()).map_err(|e| CliError::InvalidArgument {
                arg: "--queue".to_string(),
                message: e.to_string(),
            })?;
    }
    Ok(descriptor)
}

/// Bodies published by `new-task`
pub fn task_bodies(args: &[String], count: u32, markers: u32) -> Result<Vec<String>, CliError> {
    if count == 0 {
        return Err(CliError::InvalidArgument {
            arg: "--count".to_string(),
            message: "must be a positive number".to_string(),
        });
    }
    if markers == 0 {
        return Err(CliError::InvalidArgument {
            arg: "--markers".to_string(),
            message: "must be a positive number".to_string(),
        });
    }

    let bodies = match body_from_args(args) {
        Some(body) => vec![body; count as usize],
        None => (1..=count as usize)
            .map(|i| synthetic_body(i, markers as usize))
            .collect(),
    };
    Ok(bodies)
}

// ============================================================================
// Broker Session
// ============================================================================

/// One connection and one channel, as every command uses
struct BrokerSession {
    connection: Box<dyn Connection>,
    channel: Arc<dyn Channel>,
}

impl BrokerSession {
    async fn open(provider: &ProviderConfig) -> Result<Self, CliError> {
        let connection = ConnectionFactory::connect(provider).await?;
        let channel = Arc::from(connection.open_channel().await?);
        Ok(Self {
            connection,
            channel,
        })
    }

    async fn open_amqp(settings: &WorkQueueSettings) -> Result<Self, CliError> {
        Self::open(&ProviderConfig::Amqp(settings.rabbitmq.clone())).await
    }

    /// Close channel then connection; failures are only logged
    async fn close(self) {
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close channel");
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Execute send command
async fn execute_send_command(
    settings: &WorkQueueSettings,
    body: &[String],
    queue: Option<&str>,
) -> Result<(), CliError> {
    let descriptor = queue_descriptor(settings, queue)?;
    let body = body_from_args(body).unwrap_or_else(|| DEFAULT_BODY.to_string());

    let session = BrokerSession::open_amqp(settings).await?;
    let producer = Producer::new(session.channel.clone(), settings.producer.publish_timeout());
    let result = producer.publish(&descriptor, body, descriptor.durable).await;
    session.close().await;

    result?;
    Ok(())
}

/// Execute new-task command
async fn execute_new_task_command(
    settings: &WorkQueueSettings,
    bodies: Vec<String>,
    queue: Option<&str>,
) -> Result<(), CliError> {
    let descriptor = queue_descriptor(settings, queue)?;

    let session = BrokerSession::open_amqp(settings).await?;
    let producer = Producer::new(session.channel.clone(), settings.producer.publish_timeout());
    let result = producer
        .publish_batch(&descriptor, bodies, descriptor.durable)
        .await;
    session.close().await;

    let ids = result?;
    info!(count = ids.len(), queue = %descriptor.name, "Published tasks");
    Ok(())
}

/// Execute receive command
async fn execute_receive_command(
    settings: &WorkQueueSettings,
    queue: Option<&str>,
) -> Result<(), CliError> {
    let descriptor = queue_descriptor(settings, queue)?;

    let session = BrokerSession::open_amqp(settings).await?;
    let worker = Worker::new(session.channel.clone(), descriptor, Arc::new(LoggingHandler))
        .with_session(ConsumerSession::auto_ack())
        .with_name("receiver");

    let result = run_until_signal(worker).await;
    session.close().await;

    result.map(|_| ())
}

/// Execute worker command
async fn execute_worker_command(
    settings: &WorkQueueSettings,
    queue: Option<&str>,
) -> Result<(), CliError> {
    let descriptor = queue_descriptor(settings, queue)?;
    let handler = MarkerCostHandler::new(settings.worker.marker_byte()?, settings.worker.unit());
    let session_options =
        ConsumerSession::fair_dispatch().with_prefetch(settings.worker.prefetch_count);

    let session = BrokerSession::open_amqp(settings).await?;
    let worker = Worker::new(session.channel.clone(), descriptor, Arc::new(handler))
        .with_session(session_options);

    let result = run_until_signal(worker).await;
    // Closing the channel hands any task still in flight back to the broker
    session.close().await;

    result.map(|_| ())
}

/// Run `worker` until it fails or the process receives SIGINT/SIGTERM
async fn run_until_signal(worker: Worker) -> Result<WorkerStats, CliError> {
    let shutdown = Shutdown::new();
    let mut handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    tokio::select! {
        result = &mut handle => return join_worker(result),
        signal = wait_for_os_signal() => signal?,
    }

    shutdown.trigger();
    join_worker(handle.await)
}

fn join_worker(
    result: Result<Result<WorkerStats, QueueError>, tokio::task::JoinError>,
) -> Result<WorkerStats, CliError> {
    match result {
        Ok(stats) => Ok(stats?),
        Err(e) => Err(CliError::CommandFailed {
            message: format!("worker task failed: {}", e),
        }),
    }
}

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM
pub async fn wait_for_os_signal() -> Result<(), CliError> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

/// Parameters of the in-process demonstration
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub workers: usize,
    pub tasks: u32,
    pub markers: u32,
    pub unit: Duration,
}

/// Publish tasks and process them with several workers on an in-memory broker.
///
/// Returns each worker's name and statistics once the queue is drained, or the
/// first worker failure.
pub async fn run_demo(
    options: &DemoOptions,
    stop: impl std::future::Future<Output = Result<(), CliError>>,
) -> Result<Vec<(String, WorkerStats)>, CliError> {
    run_demo_on(&InMemoryBroker::default(), options, stop).await
}

async fn run_demo_on(
    broker: &InMemoryBroker,
    options: &DemoOptions,
    stop: impl std::future::Future<Output = Result<(), CliError>>,
) -> Result<Vec<(String, WorkerStats)>, CliError> {
    if options.workers == 0 {
        return Err(CliError::InvalidArgument {
            arg: "--workers".to_string(),
            message: "must be a positive number".to_string(),
        });
    }
    let bodies = task_bodies(&[], options.tasks, options.markers)?;

    let provider = ProviderConfig::InMemory(broker.clone());
    let descriptor = WorkQueueSettings::default().queue.descriptor()?;
    let shutdown = Shutdown::new();

    let mut workers = Vec::with_capacity(options.workers);
    for index in 1..=options.workers {
        let session = BrokerSession::open(&provider).await?;
        let name = format!("worker-{}", index);
        let worker = Worker::new(
            session.channel.clone(),
            descriptor.clone(),
            Arc::new(MarkerCostHandler::new(b'.', options.unit)),
        )
        .with_session(
            ConsumerSession::fair_dispatch().with_consumer_tag(ConsumerTag::new(name.clone())),
        )
        .with_name(name.clone());

        let shutdown = shutdown.clone();
        let handle = tokio::spawn(async move { worker.run(shutdown).await });
        workers.push((name, session, handle));
    }

    let producer_session = BrokerSession::open(&provider).await?;
    let producer = Producer::new(
        producer_session.channel.clone(),
        work_queue_runtime::producer::DEFAULT_PUBLISH_TIMEOUT,
    );
    let published = producer.publish_batch(&descriptor, bodies, true).await;
    producer_session.close().await;
    if let Err(e) = published {
        shutdown.trigger();
        return Err(e.into());
    }

    let drained = async {
        loop {
            if workers.iter().any(|(_, _, handle)| handle.is_finished()) {
                warn!("A demo worker stopped before the queue drained");
                break;
            }
            match broker.queue_stats(&descriptor.name) {
                Some(stats) if stats.ready == 0 && stats.unacked == 0 => break,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    };

    tokio::select! {
        _ = drained => debug!("Demo workers finished"),
        signal = stop => signal?,
    }
    shutdown.trigger();

    let mut results = Vec::with_capacity(workers.len());
    for (name, session, handle) in workers {
        let stats = join_worker(handle.await);
        session.close().await;
        results.push((name, stats?));
    }
    Ok(results)
}

/// Execute demo command
async fn execute_demo_command(options: DemoOptions) -> Result<(), CliError> {
    info!(
        workers = options.workers,
        tasks = options.tasks,
        markers = options.markers,
        unit_ms = options.unit.as_millis() as u64,
        "Starting in-memory demo"
    );

    let results = run_demo(&options, wait_for_os_signal()).await?;
    for (name, stats) in results {
        println!(
            "{}: received={} acked={} requeued={} rejected={}",
            name, stats.received, stats.acked, stats.requeued, stats.rejected
        );
    }
    Ok(())
}

/// Execute config init command
fn execute_config_init_command(
    output: &Path,
    env_file: Option<&Path>,
    force: bool,
) -> Result<(), CliError> {
    load_env_file(env_file)?;
    let connection = ConnectionConfig::from_process_env()?;
    write_config_file(output, &connection, force)?;

    println!("created {}", output.display());
    Ok(())
}

/// Load an environment file; the default `.env` is optional
fn load_env_file(path: Option<&Path>) -> Result<(), CliError> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| CliError::InvalidArgument {
                arg: "--env-file".to_string(),
                message: format!("{}: {}", path.display(), e),
            })?;
            debug!(path = %path.display(), "Loaded environment file");
            Ok(())
        }
        None => match dotenvy::dotenv() {
            Ok(path) => {
                debug!(path = %path.display(), "Loaded environment file");
                Ok(())
            }
            Err(e) if e.not_found() => Ok(()),
            Err(e) => {
                error!(error = %e, "Failed to read .env file");
                Err(CliError::InvalidArgument {
                    arg: "--env-file".to_string(),
                    message: e.to_string(),
                })
            }
        },
    }
}

/// Execute config show command
fn execute_config_show_command(
    settings: &WorkQueueSettings,
    format: ConfigFormat,
) -> Result<(), CliError> {
    println!("{}", render_settings(settings, format)?);
    Ok(())
}

/// Render settings for display with the password masked
pub fn render_settings(
    settings: &WorkQueueSettings,
    format: ConfigFormat,
) -> Result<String, CliError> {
    let redacted = settings.redacted();
    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&redacted).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::to_string_pretty(&redacted).map_err(|e| e.to_string()),
    };

    rendered.map_err(|message| CliError::CommandFailed { message })
}
