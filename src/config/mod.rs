mod file_config;

pub use file_config::{FileConfig, WorkerConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub queue_name: Option<String>,
    pub dead_letter_queue: Option<String>,
    pub max_retries: Option<u32>,
    pub prefetch: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    /// 0 disables the metrics endpoint
    pub metrics_port: u16,
    pub worker: WorkerSettings,
}

/// Consumer settings, with defaults matching the queue topology the
/// publisher side expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub queue_name: String,
    pub dead_letter_queue: String,
    pub max_retries: u32,
    /// Messages handled concurrently by one instance
    pub prefetch: usize,
    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    /// Cap on ready messages in the source queue; 0 means unbounded
    pub max_queue_length: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_name: "notifications_queue".to_string(),
            dead_letter_queue: "notifications_dlq".to_string(),
            max_retries: 3,
            prefetch: 1,
            poll_interval_ms: 200,
            visibility_timeout_secs: 300,
            max_queue_length: 10000,
        }
    }
}

impl WorkerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            bail!("queue_name must not be empty");
        }
        if self.dead_letter_queue.trim().is_empty() {
            bail!("dead_letter_queue must not be empty");
        }
        if self.queue_name == self.dead_letter_queue {
            bail!(
                "dead_letter_queue must differ from queue_name ({})",
                self.queue_name
            );
        }
        if self.prefetch == 0 {
            bail!("prefetch must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be at least 1");
        }
        Ok(())
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let defaults = WorkerSettings::default();
        let worker_file = file.worker.unwrap_or_default();
        let worker = WorkerSettings {
            queue_name: worker_file
                .queue_name
                .or_else(|| cli.queue_name.clone())
                .unwrap_or(defaults.queue_name),
            dead_letter_queue: worker_file
                .dead_letter_queue
                .or_else(|| cli.dead_letter_queue.clone())
                .unwrap_or(defaults.dead_letter_queue),
            max_retries: worker_file
                .max_retries
                .or(cli.max_retries)
                .unwrap_or(defaults.max_retries),
            prefetch: worker_file
                .prefetch
                .or(cli.prefetch)
                .unwrap_or(defaults.prefetch),
            poll_interval_ms: worker_file
                .poll_interval_ms
                .unwrap_or(defaults.poll_interval_ms),
            visibility_timeout_secs: worker_file
                .visibility_timeout_secs
                .unwrap_or(defaults.visibility_timeout_secs),
            max_queue_length: worker_file
                .max_queue_length
                .unwrap_or(defaults.max_queue_length),
        };
        worker.validate()?;

        Ok(Self {
            db_dir,
            metrics_port,
            worker,
        })
    }

    pub fn notifications_db_path(&self) -> PathBuf {
        self.db_dir.join("notifications.db")
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.db_dir.join("queue.db")
    }
}
