//! Threadmind - memory for a single LLM chat agent
//!
//! Keeps a per-thread narrative context and a cross-thread entity graph:
//! - Threads with append-only message logs and rolling summaries
//! - A shared knowledge graph the model edits through tool calls
//! - Background summarization that folds recent turns back into memory

pub mod agent;
pub mod llm;
pub mod memory;
pub mod store;
pub mod tools;

pub use agent::ChatAgent;
pub use llm::{LlmClient, OpenAiClient};
pub use memory::{EntityGraph, MemorySummarizer, ThreadRegistry};
pub use store::{DocumentStore, FileStore, MemoryStore};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default number of trailing messages sent as context each turn
pub const DEFAULT_RECENT_MESSAGES: usize = 10;

/// Default number of new messages that triggers a summarization pass
pub const DEFAULT_SUMMARY_FREQUENCY: usize = 5;

/// Default model used when nothing is configured
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Settings for the chat-completions provider
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,

    /// Model name sent with every request
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Sampling temperature for conversational turns
    pub temperature: f32,

    /// Sampling temperature for summarization passes
    pub summary_temperature: f32,

    /// Completion token cap
    pub max_tokens: u32,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.7,
            summary_temperature: 0.3,
            max_tokens: 2048,
            timeout_secs: 60,
        }
    }
}

/// Configuration for Threadmind
#[derive(Debug, Clone)]
pub struct ThreadmindConfig {
    /// Directory holding config.toml and the document store
    pub data_dir: PathBuf,

    /// How many trailing messages go into each turn's context
    pub recent_messages_count: usize,

    /// New messages required before a summarization pass runs
    pub summary_update_frequency: usize,

    /// Tool-call round trips allowed per turn
    pub max_tool_rounds: usize,

    /// Provider settings
    pub llm: LlmConfig,
}

/// On-disk shape of config.toml. Every key is optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    recent_messages_count: Option<usize>,
    summary_update_frequency: Option<usize>,
    max_tool_rounds: Option<usize>,
    llm: Option<LlmConfigToml>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmConfigToml {
    base_url: Option<String>,
    model: Option<String>,
    api_key_env: Option<String>,
    temperature: Option<f32>,
    summary_temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
}

impl ThreadmindConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            recent_messages_count: DEFAULT_RECENT_MESSAGES,
            summary_update_frequency: DEFAULT_SUMMARY_FREQUENCY,
            max_tool_rounds: 1,
            llm: LlmConfig::default(),
        }
    }

    /// Load `{data_dir}/config.toml` on top of the defaults.
    ///
    /// Precedence for the model and base URL:
    ///   1. `THREADMIND_MODEL` / `THREADMIND_BASE_URL` environment variables
    ///   2. `[llm]` table in config.toml
    ///   3. built-in defaults
    ///
    /// A missing file is not an error; a malformed one is.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let mut config = Self::new(data_dir.to_path_buf());
        let config_file = data_dir.join("config.toml");

        if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            let parsed: ConfigToml = toml::from_str(&content)
                .map_err(|e| ThreadmindError::Config(format!("{}: {}", config_file.display(), e)))?;
            config.apply(parsed);
            info!("Loaded config from {}", config_file.display());
        }

        if let Ok(model) = std::env::var("THREADMIND_MODEL") {
            config.llm.model = model;
        }
        if let Ok(base_url) = std::env::var("THREADMIND_BASE_URL") {
            config.llm.base_url = base_url;
        }

        if config.summary_update_frequency == 0 {
            warn!("summary_update_frequency of 0 would summarize every turn; using 1");
            config.summary_update_frequency = 1;
        }

        Ok(config)
    }

    fn apply(&mut self, parsed: ConfigToml) {
        if let Some(n) = parsed.recent_messages_count {
            self.recent_messages_count = n;
        }
        if let Some(n) = parsed.summary_update_frequency {
            self.summary_update_frequency = n;
        }
        if let Some(n) = parsed.max_tool_rounds {
            self.max_tool_rounds = n;
        }
        if let Some(llm) = parsed.llm {
            if let Some(v) = llm.base_url {
                self.llm.base_url = v;
            }
            if let Some(v) = llm.model {
                self.llm.model = v;
            }
            if let Some(v) = llm.api_key_env {
                self.llm.api_key_env = v;
            }
            if let Some(v) = llm.temperature {
                self.llm.temperature = v;
            }
            if let Some(v) = llm.summary_temperature {
                self.llm.summary_temperature = v;
            }
            if let Some(v) = llm.max_tokens {
                self.llm.max_tokens = v;
            }
            if let Some(v) = llm.timeout_secs {
                self.llm.timeout_secs = v;
            }
        }
    }

    /// Directory used by the file-backed document store
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn with_recent_messages(mut self, count: usize) -> Self {
        self.recent_messages_count = count;
        self
    }

    pub fn with_summary_frequency(mut self, frequency: usize) -> Self {
        self.summary_update_frequency = frequency.max(1);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.llm.model = model.into();
        self
    }
}

/// Result type for Threadmind operations
pub type Result<T> = std::result::Result<T, ThreadmindError>;

/// Errors that can occur in Threadmind
#[derive(Debug, thiserror::Error)]
pub enum ThreadmindError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Invalid arguments: {0}")]
    ParseFailure(String),

    #[error("LLM provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
