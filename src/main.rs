use anyhow::Context;
use clap::{Parser, Subcommand};
use item_auditor::broker::{KafkaDeadLetterPublisher, KafkaSource};
use item_auditor::config::{AppConfig, LoggingConfig};
use item_auditor::coordination::{install_signal_handlers, GracefulShutdown, ShutdownSignal};
use item_auditor::error::{AuditError, Result};
use item_auditor::pipeline::{PrimaryConsumer, RetryPolicy, RetryWorker};
use item_auditor::services::{HealthServer, HealthState, LoopMetrics};
use item_auditor::store::PostgresAuditStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "item-auditor")]
#[command(about = "Audits item events from Kafka into PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding default.toml and per-environment overrides
    #[arg(long, env = "AUDITOR_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Consume the main topic, dead-lettering failures
    Primary,
    /// Retry dead-lettered events with exponential backoff
    Retry,
    /// Run both loops in one process
    Run,
}

impl Mode {
    fn runs_primary(self) -> bool {
        matches!(self, Mode::Primary | Mode::Run)
    }

    fn runs_retry(self) -> bool {
        matches!(self, Mode::Retry | Mode::Run)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    init_logging(&config.logging);
    config.validate().map_err(AuditError::InvalidConfig)?;

    info!(
        "Starting item-auditor ({:?}) brokers={} main_topic={} dead_letter_topic={}",
        cli.command, config.kafka.brokers, config.kafka.main_topic, config.kafka.dead_letter_topic
    );

    let store = Arc::new(
        PostgresAuditStore::connect(&config.database)
            .await
            .context("connecting to PostgreSQL")?,
    );
    if config.database.run_migrations {
        store
            .migrate()
            .await
            .context("applying database migrations")?;
    }
    let dead_letters = Arc::new(
        KafkaDeadLetterPublisher::new(&config.kafka)
            .context("creating dead-letter producer")?,
    );

    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(shutdown.clone());

    let mut metrics: Vec<Arc<LoopMetrics>> = Vec::new();
    let mut loops: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    if cli.command.runs_primary() {
        let source = KafkaSource::connect(
            &config.kafka,
            &config.kafka.primary_group,
            &config.kafka.main_topic,
        )
        .await
        .with_context(|| format!("subscribing to {}", config.kafka.main_topic))?;
        let consumer = PrimaryConsumer::new(
            Arc::new(source),
            store.clone(),
            dead_letters.clone(),
            store.clone(),
        );
        metrics.push(consumer.metrics());

        let token = shutdown.token();
        loops.push(("primary", tokio::spawn(async move { consumer.run(token).await })));
    }

    if cli.command.runs_retry() {
        let source = KafkaSource::connect(
            &config.kafka,
            &config.kafka.retry_group,
            &config.kafka.dead_letter_topic,
        )
        .await
        .with_context(|| format!("subscribing to {}", config.kafka.dead_letter_topic))?;
        let worker = RetryWorker::new(
            Arc::new(source),
            store.clone(),
            dead_letters.clone(),
            store.clone(),
            RetryPolicy::from(&config.retry),
        );
        metrics.push(worker.metrics());

        let token = shutdown.token();
        loops.push(("retry", tokio::spawn(async move { worker.run(token).await })));
    }

    let health = config.health_port.map(|port| {
        let server = HealthServer::new(Arc::new(HealthState::new(metrics.clone())), port);
        let token = shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                error!("Health server error: {}", e);
            }
        })
    });

    let mut failed = Vec::new();
    for (name, handle) in loops {
        if let Err(e) = handle.await {
            error!("{} loop terminated abnormally: {}", name, e);
            failed.push(name);
        }
    }

    // Loops return on cancellation. A panicking loop only surfaces here in
    // builds that unwind; the release profile aborts instead.
    if !shutdown.is_shutdown_requested() {
        shutdown.request_shutdown(ShutdownSignal::Requested);
    }
    if let Some(health) = health {
        let _ = health.await;
    }

    if !failed.is_empty() {
        return Err(AuditError::Internal(format!(
            "loops terminated abnormally: {}",
            failed.join(", ")
        )));
    }

    info!("item-auditor stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},item_auditor=debug,sqlx=warn,rdkafka=warn",
            config.level
        ))
    });

    // File logging only when a directory is configured.
    //
    // `tracing_appender::rolling::daily` panics if it can't create the
    // initial log file, so writability is checked first.
    let log_dir = std::env::var("AUDITOR_LOG_DIR").ok();
    let file_layer = log_dir.as_deref().and_then(|log_dir| {
        let writable = std::fs::create_dir_all(log_dir).and_then(|_| {
            let test_path = std::path::Path::new(log_dir).join(".auditor_write_test");
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&test_path)?;
            std::fs::remove_file(&test_path)
        });

        match writable {
            Ok(()) => {
                let file_appender = tracing_appender::rolling::daily(log_dir, "item-auditor.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the life of the process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    });

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/item-auditor.log", dir);
    }
}
