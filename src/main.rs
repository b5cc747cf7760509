use anyhow::{Context, Result};
use clap::Parser;
use notification_worker::config::{AppConfig, CliConfig, FileConfig};
use notification_worker::consumer::Dispatcher;
use notification_worker::metrics;
use notification_worker::notifications::{
    NotificationProcessor, NotificationStore, RetryPolicy, SqliteNotificationStore,
};
use notification_worker::queue::{QueueOptions, SqliteMessageQueue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often the queue depth gauge is refreshed.
const QUEUE_DEPTH_INTERVAL: Duration = Duration::from_secs(15);

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding notifications.db and queue.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. Values in it override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Queue to consume notifications from.
    #[clap(long)]
    pub queue_name: Option<String>,

    /// Queue receiving messages that exhausted their retries.
    #[clap(long)]
    pub dead_letter_queue: Option<String>,

    /// Redeliveries allowed before a message is dead-lettered.
    #[clap(long)]
    pub max_retries: Option<u32>,

    /// Number of messages handled concurrently.
    #[clap(long)]
    pub prefetch: Option<usize>,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            db_dir: args.db_dir.clone(),
            metrics_port: args.metrics_port,
            queue_name: args.queue_name.clone(),
            dead_letter_queue: args.dead_letter_queue.clone(),
            max_retries: args.max_retries,
            prefetch: args.prefetch,
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&CliConfig::from(&cli_args), file_config)?;

    info!(
        "Opening notifications database at {:?}...",
        config.notifications_db_path()
    );
    let store = Arc::new(SqliteNotificationStore::new(config.notifications_db_path())?);
    let retry_ledger = Arc::new(store.retry_ledger());

    info!("Opening queue database at {:?}...", config.queue_db_path());
    let queue = Arc::new(SqliteMessageQueue::new(
        config.queue_db_path(),
        QueueOptions::from(&config.worker),
    )?);

    store
        .health_check()
        .context("Notifications database failed its health check")?;
    queue
        .health_check()
        .context("Queue database failed its health check")?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("Shutting down, finishing in-flight deliveries...");
            shutdown.cancel();
        }
    });

    let metrics_task = if config.metrics_port != 0 {
        let shutdown = shutdown.clone();
        let port = config.metrics_port;
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(port, shutdown).await {
                error!("Metrics server failed: {:#}", e);
            }
        }))
    } else {
        None
    };

    tokio::spawn({
        let queue = queue.clone();
        let queue_name = config.worker.queue_name.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut interval = tokio::time::interval(QUEUE_DEPTH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                match queue.depth(&queue_name) {
                    Ok(depth) => metrics::set_queue_depth(&queue_name, depth.ready),
                    Err(e) => warn!("Failed to read depth of {}: {}", queue_name, e),
                }
            }
        }
    });

    let processor = NotificationProcessor::new(store.clone(), RetryPolicy::new(&config.worker));
    let dispatcher = Arc::new(Dispatcher::new(
        queue,
        processor,
        retry_ledger,
        &config.worker,
    ));

    info!("Consuming from {}!", config.worker.queue_name);
    dispatcher.run(shutdown.clone()).await;

    // The dispatcher only returns once shutdown was requested
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    info!("Notification worker stopped");
    Ok(())
}
