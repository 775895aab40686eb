//! Runtime configuration
//!
//! Loaded from a JSON document (kebab-case keys, every field optional) and
//! then patched from `STRATUS_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::priority::DEFAULT_MAX_CONCURRENT;
use crate::network::redirect::{DEFAULT_MAX_REDIRECT_DEPTH, RedirectPolicy};
use crate::network::request::DEFAULT_PRIORITY;
use crate::utils::{Result, StratusError};

/// Request queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueConfig {
    /// Transport slots shared by all requests
    pub max_concurrent_requests: usize,
    pub default_priority: f32,
    /// Applied to requests whose policy is `default`
    pub default_redirect_policy: RedirectPolicy,
    pub max_redirect_depth: u8,
    pub user_agent: String,
    /// Whether cellular switches nobody has set are allowed
    pub cellular_switch_default: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT,
            default_priority: DEFAULT_PRIORITY,
            default_redirect_policy: RedirectPolicy::ValidateConnection,
            max_redirect_depth: DEFAULT_MAX_REDIRECT_DEPTH,
            user_agent: format!("{}/{}", crate::NAME.to_lowercase(), crate::VERSION),
            cellular_switch_default: true,
        }
    }
}

/// Network transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Whole-request timeout in seconds, 0 disables it
    pub request_timeout: u64,
    /// Trust the platform's root certificates
    pub use_native_roots: bool,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout > 0).then(|| Duration::from_secs(self.request_timeout))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            request_timeout: 0,
            use_native_roots: true,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StratusConfig {
    pub queue: QueueConfig,
    pub transport: TransportConfig,
}

impl StratusConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StratusError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StratusError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Apply `STRATUS_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("STRATUS_MAX_CONCURRENT") {
            self.queue.max_concurrent_requests = parse_var("STRATUS_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = lookup("STRATUS_MAX_REDIRECTS") {
            self.queue.max_redirect_depth = parse_var("STRATUS_MAX_REDIRECTS", &value)?;
        }
        if let Some(value) = lookup("STRATUS_USER_AGENT") {
            self.queue.user_agent = value;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the queue cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent_requests == 0 {
            return Err(StratusError::Config(
                "max-concurrent-requests must be at least 1".into(),
            ));
        }
        if !self.queue.default_priority.is_finite() {
            return Err(StratusError::Config("default-priority must be finite".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StratusError::Config(format!("{} has invalid value {:?}", name, value)))
}
