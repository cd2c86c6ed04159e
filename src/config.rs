//! Configuration loading and defaults for turnwise.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::approval::ApprovalMode;
use crate::core::engine::DEFAULT_MAX_TURNS;
use crate::models::{ModelLimits, limits_for_model};

pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
const CONFIG_DIR: &str = ".turnwise";
const MAX_TURNS_LIMIT: u32 = 1_000;

// === Types ===

/// Raw retry configuration loaded from config files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // Clamp to a sane range to guard against NaN/negative from misconfigured values
        let delay = delay.clamp(0.0, 300.0);
        std::time::Duration::from_secs_f64(delay)
    }
}

/// Resolved CLI configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub approval_mode: Option<String>,
    /// Approve workspace edits without asking, whatever the session says.
    pub auto_edit: Option<bool>,
    pub max_turns: Option<u32>,
    pub sessions_dir: Option<String>,
    pub context_window: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub compaction: Option<bool>,
    pub audit: Option<bool>,
    pub audit_log_path: Option<String>,
    pub retry: Option<RetryConfig>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = resolve_load_config_path(path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => load_config_file(path)?,
            _ => Config::default(),
        };

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, far from their source.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref key) = self.api_key
            && key.trim().is_empty()
        {
            anyhow::bail!("api_key cannot be empty string");
        }
        if let Some(mode) = self.approval_mode.as_deref() {
            mode.parse::<ApprovalMode>()?;
        }
        if let Some(turns) = self.max_turns
            && !(1..=MAX_TURNS_LIMIT).contains(&turns)
        {
            anyhow::bail!("Invalid max_turns {turns}: expected 1..={MAX_TURNS_LIMIT}.");
        }
        if let (Some(context), Some(output)) = (self.context_window, self.max_output_tokens)
            && output >= context
        {
            anyhow::bail!(
                "max_output_tokens ({output}) must be smaller than context_window ({context})."
            );
        }
        if let Some(url) = self.base_url.as_deref()
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            anyhow::bail!("Invalid base_url '{url}': expected an http(s) URL.");
        }
        Ok(())
    }

    /// Return the API base URL (normalized, without a trailing `/v1`).
    #[must_use]
    pub fn base_url(&self) -> String {
        let base = self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        normalize_base_url(base)
    }

    /// Read the API key from config/environment.
    pub fn api_key(&self) -> Result<String> {
        if let Some(configured) = self.api_key.as_deref()
            && !configured.trim().is_empty()
        {
            return Ok(configured.to_string());
        }
        anyhow::bail!(
            "API key not found. Set it using one of these methods:\n\
             1. Set TURNWISE_API_KEY in the environment or a .env file\n\
             2. Add api_key = \"...\" to ~/{CONFIG_DIR}/config.toml"
        )
    }

    #[must_use]
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Global approval mode; invalid values were rejected by `validate`.
    #[must_use]
    pub fn approval_mode(&self) -> ApprovalMode {
        self.approval_mode
            .as_deref()
            .and_then(|mode| mode.parse().ok())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn auto_edit(&self) -> bool {
        self.auto_edit.unwrap_or(false)
    }

    #[must_use]
    pub fn max_turns(&self) -> u32 {
        self.max_turns.unwrap_or(DEFAULT_MAX_TURNS)
    }

    #[must_use]
    pub fn compaction_enabled(&self) -> bool {
        self.compaction.unwrap_or(true)
    }

    /// Limits for the configured model, with explicit overrides applied.
    #[must_use]
    pub fn model_limits(&self) -> ModelLimits {
        let mut limits = limits_for_model(&self.model());
        if let Some(context) = self.context_window {
            limits.context = context;
        }
        if let Some(output) = self.max_output_tokens {
            limits.output = output;
        }
        limits
    }

    /// Root for session logs (`~/.turnwise` unless overridden).
    #[must_use]
    pub fn sessions_root(&self) -> Option<PathBuf> {
        match self.sessions_dir.as_deref() {
            Some(dir) => Some(expand_path(dir)),
            None => dirs::home_dir().map(|home| home.join(CONFIG_DIR)),
        }
    }

    /// Audit log location, or `None` when auditing is turned off.
    #[must_use]
    pub fn audit_log_path(&self) -> Option<PathBuf> {
        if !self.audit.unwrap_or(true) {
            return None;
        }
        match self.audit_log_path.as_deref() {
            Some(path) => Some(expand_path(path)),
            None => crate::audit::default_audit_path(),
        }
    }

    /// Resolve the effective retry policy with defaults applied.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();

        let Some(cfg) = &self.retry else {
            return defaults;
        };

        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

// === Defaults ===

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR).join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TURNWISE_CONFIG") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(expand_path(trimmed));
        }
    }
    None
}

fn expand_pathbuf(path: PathBuf) -> PathBuf {
    if let Some(raw) = path.to_str() {
        return expand_path(raw);
    }
    path
}

fn resolve_load_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(expand_pathbuf(path));
    }

    if let Some(path) = env_config_path() {
        if path.exists() {
            return Some(path);
        }

        if let Some(home_path) = home_config_path()
            && home_path.exists()
        {
            return Some(home_path);
        }

        return Some(path);
    }

    home_config_path()
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

fn load_config_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

// === Environment Overrides ===

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("TURNWISE_API_KEY") {
        config.api_key = Some(value);
    }
    if let Ok(value) = std::env::var("TURNWISE_BASE_URL") {
        config.base_url = Some(value);
    }
    if let Ok(value) = std::env::var("TURNWISE_MODEL") {
        config.model = Some(value);
    }
    if let Ok(value) = std::env::var("TURNWISE_APPROVAL_MODE") {
        config.approval_mode = Some(value);
    }
    if let Ok(value) = std::env::var("TURNWISE_SESSIONS_DIR") {
        config.sessions_dir = Some(value);
    }
}

fn normalize_base_url(base: &str) -> String {
    base.trim()
        .trim_end_matches('/')
        .trim_end_matches("/v1")
        .to_string()
}
