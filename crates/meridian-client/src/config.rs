//! Configuration types and loading
//!
//! `SessionConfig` can be built in code or loaded from a TOML file.
//! Defaults match the first-party client's tuning; loading validates the
//! retry policy so misconfiguration fails at startup, not mid-retry.
//! Secrets (passwords, device secrets) never live in the TOML - they
//! belong to the [`meridian_auth::CredentialSource`] the caller builds.

use std::path::Path;
use std::time::Duration;

use meridian_auth::Endpoints;
use serde::Deserialize;

/// Retry policy for the request executor.
///
/// Changing these values carelessly makes retries spammy; aggressive
/// settings can get an account or address limited for high traffic.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempt budget for classes that consume it (invalid-credential
    /// and transient-server retries).
    pub max_attempts: u32,
    /// Cumulative sleep budget across all retries of one request.
    /// `None` disables the budget.
    pub max_total_wait_secs: Option<f64>,
    /// Honor explicit Retry-After waits.
    pub handle_rate_limits: bool,
    /// A Retry-After above this propagates the error instead of waiting.
    pub max_retry_after_secs: f64,
    /// Share one throttle window per endpoint across concurrent callers.
    pub coalesce_rate_limited: bool,
    /// Back off exponentially on capacity throttles (no Retry-After).
    pub handle_capacity_backoff: bool,
    pub backoff_start_secs: f64,
    pub backoff_factor: f64,
    pub backoff_cap_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_total_wait_secs: Some(65.0),
            handle_rate_limits: true,
            max_retry_after_secs: 60.0,
            coalesce_rate_limited: true,
            handle_capacity_backoff: true,
            backoff_start_secs: 1.0,
            backoff_factor: 1.5,
            backoff_cap_secs: 20.0,
        }
    }
}

impl RetryPolicy {
    pub fn max_total_wait(&self) -> Option<Duration> {
        self.max_total_wait_secs.map(Duration::from_secs_f64)
    }
}

/// Session runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Client build reported in the user agent.
    pub build: String,
    /// OS token reported in the user agent.
    pub os: String,
    /// Persisted device identifier; generated when absent.
    pub device_id: Option<String>,
    /// Per-request transport timeout, so no wait is unbounded.
    pub http_timeout_secs: u64,
    /// Refresh this long before the earliest credential expiry.
    pub refresh_margin_secs: u64,
    /// Refresh attempts within the storm window before the next
    /// failure is treated as fatal instead of escalating to a full
    /// reauthentication.
    pub storm_max_attempts: usize,
    pub storm_window_secs: u64,
    pub retry: RetryPolicy,
    /// Service base URLs; overridable for staging environments.
    #[serde(skip)]
    pub endpoints: Endpoints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            build: "12.41".to_owned(),
            os: "Windows/10.0.19045.64bit".to_owned(),
            device_id: None,
            http_timeout_secs: 30,
            refresh_margin_secs: 300,
            storm_max_attempts: 3,
            storm_window_secs: 20,
            retry: RetryPolicy::default(),
            endpoints: Endpoints::default(),
        }
    }
}

impl SessionConfig {
    /// User agent sent on every request.
    pub fn user_agent(&self) -> String {
        format!("Meridian/{} {}", self.build, self.os)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn storm_window(&self) -> Duration {
        Duration::from_secs(self.storm_window_secs)
    }

    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate values a typo would silently break.
    pub fn validate(&self) -> common::Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(common::Error::Config(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            )));
        }
        if self.retry.backoff_start_secs <= 0.0 || self.retry.backoff_cap_secs <= 0.0 {
            return Err(common::Error::Config(
                "retry backoff values must be positive".into(),
            ));
        }
        if self.retry.max_retry_after_secs < 0.0 {
            return Err(common::Error::Config(
                "retry.max_retry_after_secs must not be negative".into(),
            ));
        }
        if self.storm_max_attempts == 0 {
            return Err(common::Error::Config(
                "storm_max_attempts must be greater than 0".into(),
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(common::Error::Config(
                "http_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
