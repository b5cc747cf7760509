//! Operator tool for the notification pipeline: publish test notifications
//! and inspect records and the dead-letter queue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notification_worker::config::{AppConfig, CliConfig, FileConfig};
use notification_worker::notifications::{
    DeadLetterMessage, NotificationPublisher, NotificationRequest, NotificationStatus,
    NotificationStore, SqliteNotificationStore,
};
use notification_worker::queue::{QueueOptions, SqliteMessageQueue};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "notify-cli", about = "Inspect and feed the notification worker")]
struct CliArgs {
    /// Directory holding notifications.db and queue.db.
    #[clap(long)]
    pub db_dir: Option<PathBuf>,

    /// Path to the worker's TOML config file.
    #[clap(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a notification to the source queue.
    Publish {
        target_user_id: String,
        notification_type: String,
        /// JSON object, e.g. '{"subject":"Hi"}'
        payload: String,
    },
    /// Print the stored record for a message id.
    Show { message_id: String },
    /// Print the most recent records with the given status.
    List {
        /// pending, processed or failed
        #[clap(long, default_value = "failed")]
        status: String,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the oldest envelopes on the dead-letter queue.
    DeadLetters {
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print record counts and queue depths.
    Stats,
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = args.config.as_deref().map(FileConfig::load).transpose()?;
    let cli_config = CliConfig {
        db_dir: args.db_dir.clone(),
        ..Default::default()
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;
    let queue_options = QueueOptions::from(&config.worker);

    match args.command {
        Command::Publish {
            target_user_id,
            notification_type,
            payload,
        } => {
            let payload = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let queue = Arc::new(SqliteMessageQueue::new(config.queue_db_path(), queue_options)?);
            let publisher = NotificationPublisher::new(queue, config.worker.queue_name.clone());
            let receipt = publisher
                .publish(NotificationRequest {
                    target_user_id,
                    notification_type,
                    payload,
                })
                .await?;
            print_json(&receipt)?;
        }
        Command::Show { message_id } => {
            let store = SqliteNotificationStore::new(config.notifications_db_path())?;
            match store.get_by_message_id(&message_id)? {
                Some(record) => print_json(&record)?,
                None => anyhow::bail!("No notification recorded for message {}", message_id),
            }
        }
        Command::List { status, limit } => {
            let status = NotificationStatus::from_db_str(&status)
                .with_context(|| format!("Unknown status '{}'", status))?;
            let store = SqliteNotificationStore::new(config.notifications_db_path())?;
            print_json(&store.list_by_status(status, limit)?)?;
        }
        Command::DeadLetters { limit } => {
            let queue = SqliteMessageQueue::new(config.queue_db_path(), queue_options)?;
            for body in queue.peek(&config.worker.dead_letter_queue, limit)? {
                match serde_json::from_slice::<DeadLetterMessage>(&body) {
                    Ok(envelope) => print_json(&envelope)?,
                    Err(_) => println!("{}", String::from_utf8_lossy(&body)),
                }
            }
        }
        Command::Stats => {
            let store = SqliteNotificationStore::new(config.notifications_db_path())?;
            let queue = SqliteMessageQueue::new(config.queue_db_path(), queue_options)?;
            let counts = store.count_by_status()?;
            let source = queue.depth(&config.worker.queue_name)?;
            let dead_letters = queue.depth(&config.worker.dead_letter_queue)?;
            print_json(&json!({
                "records": counts,
                "queues": {
                    config.worker.queue_name.clone(): {
                        "ready": source.ready,
                        "unacked": source.unacked,
                    },
                    config.worker.dead_letter_queue.clone(): {
                        "ready": dead_letters.ready,
                        "unacked": dead_letters.unacked,
                    },
                },
            }))?;
        }
    }

    Ok(())
}
