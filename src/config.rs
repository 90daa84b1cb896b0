//! TOML configuration.
//!
//! ```toml
//! [llm]
//! model = "gemini-2.0-flash"
//! base_url = "https://example.invalid/v1/chat/completions"
//! api_key = ["key-one", "key-two"]   # or a single string
//! key_cooldown_secs = 60
//! max_attempts = 15
//!
//! [standardization]
//! enabled = true
//!
//! [inference]
//! enabled = true
//! max_community_pairs = 5
//! max_pairs_within = 10
//!
//! [consolidation]
//! max_predicate_words = 3
//! ```
//!
//! Every field except `model` and `base_url` has a default. When no key is
//! configured, `KG_LOOM_API_KEYS` (comma separated) is consulted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::gateway::{
    Clock, CompletionRequest, KeyPool, RequestExecutor, RetryPolicy, SystemClock, UreqTransport,
};
use crate::pipeline::InferenceLimits;

/// Environment variable holding comma-separated fallback keys.
pub const API_KEYS_ENV: &str = "KG_LOOM_API_KEYS";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoomConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub standardization: StandardizationConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

/// One key or a list of keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyList {
    One(String),
    Many(Vec<String>),
}

impl Default for KeyList {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl KeyList {
    /// Non-blank keys, trimmed.
    pub fn keys(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Self::One(key) => vec![key.as_str()],
            Self::Many(keys) => keys.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Completion endpoint, credentials and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: KeyList,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Cooldown applied to a rate-limited key without a retry hint.
    #[serde(default = "default_key_cooldown_secs")]
    pub key_cooldown_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    0.2
}
fn default_key_cooldown_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    15
}
fn default_base_retry_delay_secs() -> u64 {
    5
}
fn default_max_backoff_secs() -> u64 {
    300
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_max_community_pairs() -> usize {
    5
}
fn default_max_pairs_within() -> usize {
    10
}
fn default_max_predicate_words() -> usize {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            base_url: String::new(),
            api_key: KeyList::default(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            key_cooldown_secs: default_key_cooldown_secs(),
            max_attempts: default_max_attempts(),
            base_retry_delay_secs: default_base_retry_delay_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for StandardizationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Limits on community-driven relation inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cross-community pairs sent for inference.
    #[serde(default = "default_max_community_pairs")]
    pub max_community_pairs: usize,
    /// Unconnected node pairs per community sent for inference.
    #[serde(default = "default_max_pairs_within")]
    pub max_pairs_within: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_community_pairs: default_max_community_pairs(),
            max_pairs_within: default_max_pairs_within(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Word limit for predicates; 0 disables truncation.
    #[serde(default = "default_max_predicate_words")]
    pub max_predicate_words: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_predicate_words: default_max_predicate_words(),
        }
    }
}

/// Model identifier and sampling parameters shared by every request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ModelSettings {
    pub fn request(&self, prompt: impl Into<String>) -> CompletionRequest {
        CompletionRequest::new(self.model.clone(), prompt)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
    }
}

impl LoomConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    /// Parse TOML text; `origin` names the source in errors.
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Check the values the gateway cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::Invalid {
            message: message.to_string(),
        };
        if self.llm.model.trim().is_empty() {
            return Err(invalid("`llm.model` must not be empty"));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(invalid("`llm.base_url` must not be empty"));
        }
        if self.llm.max_attempts == 0 {
            return Err(invalid("`llm.max_attempts` must be at least 1"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(invalid("`llm.temperature` must be between 0.0 and 2.0"));
        }
        Ok(())
    }

    /// Configured keys, or the `KG_LOOM_API_KEYS` fallback when none are set.
    pub fn api_keys(&self) -> Vec<String> {
        self.api_keys_or(std::env::var(API_KEYS_ENV).ok().as_deref())
    }

    /// Configured keys, or the comma-separated `fallback` when none are set.
    pub fn api_keys_or(&self, fallback: Option<&str>) -> Vec<String> {
        let configured = self.llm.api_key.keys();
        if !configured.is_empty() {
            return configured;
        }
        fallback
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn key_cooldown(&self) -> Duration {
        Duration::from_secs(self.llm.key_cooldown_secs)
    }

    pub fn key_pool(&self) -> Result<KeyPool, ConfigError> {
        self.key_pool_with_clock(Arc::new(SystemClock))
    }

    pub fn key_pool_with_clock(&self, clock: Arc<dyn Clock>) -> Result<KeyPool, ConfigError> {
        KeyPool::with_clock(&self.api_keys(), self.key_cooldown(), clock)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.llm.max_attempts,
            base_delay: Duration::from_secs(self.llm.base_retry_delay_secs),
            max_backoff: Duration::from_secs(self.llm.max_backoff_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            model: self.llm.model.clone(),
            max_tokens: self.llm.max_tokens,
            temperature: self.llm.temperature,
        }
    }

    pub fn inference_limits(&self) -> InferenceLimits {
        InferenceLimits {
            max_community_pairs: self.inference.max_community_pairs,
            max_pairs_within: self.inference.max_pairs_within,
            ..InferenceLimits::default()
        }
    }

    /// Validate, then assemble an HTTP-backed executor with its own pool.
    pub fn executor(&self) -> Result<RequestExecutor, ConfigError> {
        self.validate()?;
        let pool = Arc::new(self.key_pool()?);
        let transport = Arc::new(UreqTransport::new(Duration::from_secs(self.llm.timeout_secs)));
        Ok(RequestExecutor::new(
            self.llm.base_url.clone(),
            pool,
            transport,
            self.retry_policy(),
        ))
    }
}
