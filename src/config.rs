//! Session configuration.
//!
//! Every field carries a serde default so clients may send partial config
//! objects; unknown fields are ignored.

use serde::{Deserialize, Serialize};

use crate::actions::ActionType;
use crate::retry::ErrorCategory;

/// Retry policy for LLM calls and other transient operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategy {
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms", alias = "backoffMs")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier", alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms", alias = "maxBackoffMs")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retryable_categories", alias = "retryableCategories")]
    pub retryable_categories: Vec<ErrorCategory>,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            retryable_categories: default_retryable_categories(),
        }
    }
}

impl RetryStrategy {
    /// Backoff before retry attempt `k` (1-indexed), clamped to the cap.
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let raw = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        (raw as u64).min(self.max_backoff_ms)
    }

    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        category.is_retryable() && self.retryable_categories.contains(&category)
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_retryable_categories() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::RateLimit,
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Recoverable,
    ]
}

/// Content-cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStrategy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_size", alias = "maxSize")]
    pub max_size: usize,
    #[serde(default = "default_cache_ttl_ms", alias = "ttlMs")]
    pub ttl_ms: u64,
    #[serde(default = "default_true", alias = "compressionEnabled")]
    pub compression_enabled: bool,
    #[serde(default = "default_compression_threshold", alias = "compressionThreshold")]
    pub compression_threshold: usize,
    #[serde(default, alias = "warmingEnabled")]
    pub warming_enabled: bool,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_cache_max_size(),
            ttl_ms: default_cache_ttl_ms(),
            compression_enabled: true,
            compression_threshold: default_compression_threshold(),
            warming_enabled: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_max_size() -> usize {
    50
}
fn default_cache_ttl_ms() -> u64 {
    300_000
}
fn default_compression_threshold() -> usize {
    10_240
}

/// Per-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard cap on planner iterations; on breach the task fails with
    /// `max_steps_reached`.
    #[serde(default = "default_max_steps", alias = "maxSteps")]
    pub max_steps: u32,
    /// Attach screenshots to planner prompts when the model supports vision.
    #[serde(default, alias = "enableVision")]
    pub enable_vision: bool,
    /// Export a replay record when the session reaches a terminal state.
    #[serde(default, alias = "enableReplay")]
    pub enable_replay: bool,
    /// Apply the strict guardrail family (emails, phone numbers) in addition
    /// to the base family.
    #[serde(default, alias = "strictSecurity")]
    pub strict_security: bool,
    #[serde(default, alias = "retryStrategy")]
    pub retry: RetryStrategy,
    #[serde(default, alias = "cacheStrategy")]
    pub cache: CacheStrategy,
    /// Whitelist of action types the planner may emit. `None` allows the
    /// full vocabulary.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "toolsEnabled")]
    pub tools_enabled: Option<Vec<ActionType>>,
    #[serde(default = "default_max_actions_per_step", alias = "maxActionsPerStep")]
    pub max_actions_per_step: u32,
    /// Consecutive action failures before the task is marked failed.
    #[serde(default = "default_max_failures", alias = "maxFailures")]
    pub max_failures: u32,
    /// Force a fresh strategic plan every N steps.
    #[serde(default = "default_planning_interval", alias = "planningInterval")]
    pub planning_interval: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            enable_vision: false,
            enable_replay: false,
            strict_security: false,
            retry: RetryStrategy::default(),
            cache: CacheStrategy::default(),
            tools_enabled: None,
            max_actions_per_step: default_max_actions_per_step(),
            max_failures: default_max_failures(),
            planning_interval: default_planning_interval(),
        }
    }
}

impl SessionConfig {
    pub fn is_tool_enabled(&self, action_type: ActionType) -> bool {
        match &self.tools_enabled {
            None => true,
            // `complete` must always be reachable or no task can terminate.
            Some(allowed) => {
                action_type == ActionType::Complete || allowed.contains(&action_type)
            }
        }
    }
}

fn default_max_steps() -> u32 {
    50
}
fn default_max_actions_per_step() -> u32 {
    3
}
fn default_max_failures() -> u32 {
    3
}
fn default_planning_interval() -> u32 {
    5
}
