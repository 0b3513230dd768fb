//! Numeric limits and persistence options for a controller.
//!
//! Settings can be built in code or loaded from a TOML file with
//! environment overrides:
//!
//! ```toml
//! state_key = "import_last_params"
//! delay_attempts_ms = 500
//! max_attempts = 5
//! max_iterations = 0   # unbounded
//! allow_fail = true
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;

/// Environment prefix for overrides, e.g. `BATCHLOOP__MAX_ATTEMPTS=3`.
pub const ENV_PREFIX: &str = "BATCHLOOP";

/// Errors that can occur when loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The configuration file was not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] ConfigError),

    /// The configuration file path is invalid.
    #[error("invalid configuration path: {0}")]
    InvalidPath(String),

    /// A value is out of range.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Run configuration. Immutable once handed to a controller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Key under which the last params are persisted.
    pub state_key: String,
    /// Delay before retrying a failed attempt, in milliseconds.
    pub delay_attempts_ms: u64,
    /// Number of `start`/`resume` calls allowed over the controller's lifetime.
    pub max_batches: u32,
    /// Consecutive failed attempts before an iteration is unrecoverable.
    pub max_attempts: u32,
    /// Successful iterations per batch (0 = unlimited)
    pub max_iterations: u32,
    /// Skip iterations that exhaust their attempts instead of aborting.
    pub allow_fail: bool,
    /// Lifetime of the persisted params in days (0 = no expiry)
    pub state_ttl_days: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            state_key: "batch_last_params".to_string(),
            delay_attempts_ms: 1000,
            max_batches: 1,
            max_attempts: 20,
            max_iterations: 10,
            allow_fail: false,
            state_ttl_days: 365,
        }
    }
}

impl BatchSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a TOML file, with `BATCHLOOP__*` environment
    /// overrides applied on top. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, cannot be parsed, or
    /// holds invalid values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();

        let path_str = path
            .to_str()
            .ok_or_else(|| SettingsError::InvalidPath(format!("{:?}", path)))?;

        if !path.exists() {
            return Err(SettingsError::FileNotFound(path_str.to_string()));
        }

        let config = Config::builder()
            .add_source(File::with_name(path_str))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: BatchSettings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check values that cannot be expressed through types alone.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.state_key.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "state_key cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_state_key(mut self, key: impl Into<String>) -> Self {
        self.state_key = key.into();
        self
    }

    pub fn with_delay_attempts(mut self, delay: Duration) -> Self {
        self.delay_attempts_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_batches(mut self, max: u32) -> Self {
        self.max_batches = max;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// `None` removes the iteration cap.
    pub fn with_max_iterations(mut self, max: Option<u32>) -> Self {
        self.max_iterations = max.unwrap_or(0);
        self
    }

    pub fn with_allow_fail(mut self, allow: bool) -> Self {
        self.allow_fail = allow;
        self
    }

    /// `None` keeps persisted params forever.
    pub fn with_state_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.state_ttl_days = ttl.map_or(0, |ttl| (ttl.as_secs() / 86_400).max(1));
        self
    }

    pub fn delay_attempts(&self) -> Duration {
        Duration::from_millis(self.delay_attempts_ms)
    }

    /// Iteration cap, `None` when unbounded.
    pub fn iteration_cap(&self) -> Option<u32> {
        (self.max_iterations > 0).then_some(self.max_iterations)
    }

    /// `None` when persisted params never expire, including lifetimes too
    /// long to represent.
    pub fn state_ttl(&self) -> Option<Duration> {
        if self.state_ttl_days == 0 {
            return None;
        }
        self.state_ttl_days
            .checked_mul(86_400)
            .map(Duration::from_secs)
    }
}
