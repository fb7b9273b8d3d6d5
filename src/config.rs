use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QuadchatError, Result};
use crate::store::streams::DEFAULT_BUFFER_SIZE;

pub const DEFAULT_INITIAL_REVEAL: usize = 10;
pub const DEFAULT_REVEAL_STEP: usize = 10;

/// Which conversation store backs the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoreBackend {
    #[default]
    InMemory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = QuadchatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(StoreBackend::InMemory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(QuadchatError::Configuration(format!(
                "unknown store backend: {other}"
            ))),
        }
    }
}

/// What happens to the input buffer when a send fails after it was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendFailurePolicy {
    /// Put the text back so the user can retry.
    #[default]
    RestoreInput,
    /// Leave the buffer empty; the text is lost.
    KeepCleared,
}

impl FromStr for SendFailurePolicy {
    type Err = QuadchatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "restore" | "restore-input" => Ok(SendFailurePolicy::RestoreInput),
            "keep-cleared" | "clear" => Ok(SendFailurePolicy::KeepCleared),
            other => Err(QuadchatError::Configuration(format!(
                "unknown send failure policy: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QuadchatConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    pub backend: StoreBackend,

    /// Capacity of each live query's broadcast buffer
    pub stream_buffer: usize,

    /// Number of conversation summaries visible before the first "show more"
    pub initial_reveal: usize,

    /// How many more summaries each "show more" reveals
    pub reveal_step: usize,

    pub send_failure_policy: SendFailurePolicy,
}

impl QuadchatConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            backend: StoreBackend::default(),
            stream_buffer: DEFAULT_BUFFER_SIZE,
            initial_reveal: DEFAULT_INITIAL_REVEAL,
            reveal_step: DEFAULT_REVEAL_STEP,
            send_failure_policy: SendFailurePolicy::default(),
        }
    }

    pub fn with_backend(mut self, backend: StoreBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_send_failure_policy(mut self, policy: SendFailurePolicy) -> Self {
        self.send_failure_policy = policy;
        self
    }

    /// Builds a configuration from `QUADCHAT_*` environment variables, loading a
    /// `.env` file first when one exists.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(
                target: "quadchat::config",
                "Loaded environment variables from {:?}",
                path
            ),
            Err(_) => tracing::debug!(
                target: "quadchat::config",
                "No .env file found, using process environment only"
            ),
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("QUADCHAT_DATA_DIR").unwrap_or_else(|| "./data".to_string());
        let logs_dir = lookup("QUADCHAT_LOGS_DIR").unwrap_or_else(|| "./logs".to_string());
        let mut config = Self::new(Path::new(&data_dir), Path::new(&logs_dir));

        if let Some(backend) = lookup("QUADCHAT_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(policy) = lookup("QUADCHAT_SEND_FAILURE_POLICY") {
            config.send_failure_policy = policy.parse()?;
        }
        if let Some(buffer) = lookup("QUADCHAT_STREAM_BUFFER") {
            config.stream_buffer = parse_positive("QUADCHAT_STREAM_BUFFER", &buffer)?;
        }
        if let Some(reveal) = lookup("QUADCHAT_INITIAL_REVEAL") {
            config.initial_reveal = parse_positive("QUADCHAT_INITIAL_REVEAL", &reveal)?;
        }
        if let Some(step) = lookup("QUADCHAT_REVEAL_STEP") {
            config.reveal_step = parse_positive("QUADCHAT_REVEAL_STEP", &step)?;
        }

        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("quadchat.sqlite")
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(QuadchatError::Configuration(format!(
            "{key} must be a positive integer, got {value:?}"
        ))),
    }
}
