//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Maximum accepted chunk request body in bytes.
    #[serde(default = "default_max_chunk_body_size")]
    pub max_chunk_body_size: u64,
    /// Interval between SSE keep-alive comments.
    #[serde(default = "default_event_keepalive_secs")]
    pub event_keepalive_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_max_chunk_body_size() -> u64 {
    crate::MAX_CHUNK_BODY_SIZE
}

fn default_event_keepalive_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
            max_chunk_body_size: default_max_chunk_body_size(),
            event_keepalive_secs: default_event_keepalive_secs(),
        }
    }
}

impl ServerConfig {
    pub fn event_keepalive(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.event_keepalive_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bind.trim().is_empty() {
            return Err("server.bind cannot be empty".to_string());
        }
        if self.max_chunk_body_size == 0 {
            return Err("server.max_chunk_body_size cannot be 0".to_string());
        }
        if usize::try_from(self.max_chunk_body_size).is_err() {
            return Err(format!(
                "server.max_chunk_body_size {} does not fit in memory on this platform",
                self.max_chunk_body_size
            ));
        }
        if self.event_keepalive_secs == 0 {
            return Err("server.event_keepalive_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// Process-local storage. Contents are lost on restart.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path cannot be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Upload pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Upper bound on `total_chunks` for a single session.
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,
    /// Upper bound on `declared_size` in bytes.
    #[serde(default = "default_max_declared_size")]
    pub max_declared_size: u64,
    /// Sessions with no activity for this long are expired.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Interval between idle-session sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Completed, failed and expired sessions are removed this long after
    /// their last state change. A completed session's artifact goes with it.
    #[serde(default = "default_upload_retention_secs")]
    pub retention_secs: u64,
    /// A chunk not persisted within this time fails the request.
    #[serde(default = "default_chunk_write_timeout_ms")]
    pub chunk_write_timeout_ms: u64,
    /// Advisory concurrency hint returned to clients.
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: u32,
    /// MIME types accepted at init and checked again at assembly.
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

fn default_max_total_chunks() -> u32 {
    100_000
}

fn default_max_declared_size() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_upload_retention_secs() -> u64 {
    24 * 3600
}

fn default_chunk_write_timeout_ms() -> u64 {
    30_000
}

fn default_max_parallel_chunks() -> u32 {
    8
}

fn default_allowed_mime_types() -> Vec<String> {
    [
        "application/pdf",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/msword",
        "text/plain",
        "text/markdown",
        "application/json",
        "text/html",
        "application/rtf",
        "application/octet-stream",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_total_chunks: default_max_total_chunks(),
            max_declared_size: default_max_declared_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_secs: default_upload_retention_secs(),
            chunk_write_timeout_ms: default_chunk_write_timeout_ms(),
            max_parallel_chunks: default_max_parallel_chunks(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

impl UploadConfig {
    pub fn idle_timeout(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.idle_timeout_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        let secs = i64::try_from(self.retention_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn chunk_write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.chunk_write_timeout_ms)
    }

    /// Check a declared MIME type against the allow-list (case-insensitive,
    /// parameters ignored).
    pub fn is_mime_allowed(&self, mime: &str) -> bool {
        let essence = crate::mime::essence(mime);
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&essence))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_total_chunks == 0 {
            return Err("uploads.max_total_chunks cannot be 0".to_string());
        }
        if self.max_declared_size == 0 {
            return Err("uploads.max_declared_size cannot be 0".to_string());
        }
        if self.idle_timeout_secs == 0 {
            return Err("uploads.idle_timeout_secs cannot be 0".to_string());
        }
        // A zero period would panic in tokio::time::interval
        if self.sweep_interval_secs == 0 {
            return Err("uploads.sweep_interval_secs cannot be 0".to_string());
        }
        if self.chunk_write_timeout_ms == 0 {
            return Err("uploads.chunk_write_timeout_ms cannot be 0".to_string());
        }
        if self.max_parallel_chunks == 0 {
            return Err("uploads.max_parallel_chunks cannot be 0".to_string());
        }
        if self.allowed_mime_types.is_empty() {
            return Err("uploads.allowed_mime_types cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Retry policy for transient generation failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per generation step, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("tasks.retry.max_attempts must be at least 1".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "tasks.retry.backoff_multiplier {} must be a finite value >= 1.0",
                self.backoff_multiplier
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(format!(
                "tasks.retry.max_backoff_ms {} is below initial_backoff_ms {}",
                self.max_backoff_ms, self.initial_backoff_ms
            ));
        }
        Ok(())
    }
}

/// Task orchestration configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-call timeout for the generation operation. Timeouts are transient.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    /// Terminal tasks are reaped this long after finishing.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Upper bound on refinement passes per task.
    #[serde(default = "default_max_refine_passes")]
    pub max_refine_passes: u32,
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_max_refine_passes() -> u32 {
    5
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            generation_timeout_secs: default_generation_timeout_secs(),
            retention_secs: default_retention_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            max_refine_passes: default_max_refine_passes(),
        }
    }
}

impl TaskConfig {
    pub fn generation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        let secs = i64::try_from(self.retention_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reap_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.retry.validate()?;
        if self.generation_timeout_secs == 0 {
            return Err("tasks.generation_timeout_secs cannot be 0".to_string());
        }
        if self.reap_interval_secs == 0 {
            return Err("tasks.reap_interval_secs cannot be 0".to_string());
        }
        if self.max_refine_passes == 0 {
            return Err("tasks.max_refine_passes must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Remote generation operation configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationConfig {
    /// JSON-over-HTTP generation endpoint.
    Http {
        /// Full URL of the generation endpoint.
        endpoint: String,
        /// Bearer token. Prefer QUIRE_GENERATION__API_KEY over the config file.
        api_key: Option<String>,
        /// Model name forwarded to the endpoint.
        model: Option<String>,
    },
    /// Deterministic local output for development.
    #[default]
    DryRun,
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Http { endpoint, .. } if endpoint.trim().is_empty() => {
                Err("generation.endpoint cannot be empty".to_string())
            }
            Self::Http { endpoint, .. }
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) =>
            {
                Err(format!(
                    "generation.endpoint '{endpoint}' must be an http(s) URL"
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl AppConfig {
    /// Create a test configuration with in-memory storage and fast timings.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::Memory,
            uploads: UploadConfig {
                chunk_write_timeout_ms: 5_000,
                ..UploadConfig::default()
            },
            tasks: TaskConfig {
                retry: RetryConfig {
                    max_attempts: 3,
                    initial_backoff_ms: 5,
                    backoff_multiplier: 2.0,
                    max_backoff_ms: 50,
                },
                generation_timeout_secs: 5,
                ..TaskConfig::default()
            },
            generation: GenerationConfig::DryRun,
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.storage.validate()?;
        self.uploads.validate()?;
        self.tasks.validate()?;
        self.generation.validate()
    }
}
