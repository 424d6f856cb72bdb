//! Application-level configuration loading: turn rules, reconciliation cadence and store limits.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "BUZZ_TURN_CONFIG_PATH";

/// What happens when the countdown reaches zero without a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Keep the holder at zero until the adjudicator decides.
    AwaitAdjudicator,
    /// Treat expiry as a failed answer.
    AutoFail,
}

/// What an accepted answer clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptPolicy {
    /// Clear only the holder's claim; the rest of the queue keeps its place.
    ClearHolder,
    /// Clear every claim, starting a fresh round.
    ResetRound,
}

/// Immutable runtime configuration shared across the application.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Countdown length of each turn.
    #[serde(rename = "turn_duration_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub turn_duration: Duration,
    /// Score delta applied on accept.
    pub accept_delta: i64,
    /// Score delta applied on fail.
    pub fail_delta: i64,
    /// What happens when the countdown runs out.
    pub expiry_policy: ExpiryPolicy,
    /// What an accepted answer clears.
    pub accept_policy: AcceptPolicy,
    /// Whether the first buzz of an unknown player registers them.
    pub auto_register: bool,
    /// Period of the polling fallback.
    #[serde(rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Window collapsing bursts of push notifications.
    #[serde(rename = "debounce_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub debounce: Duration,
    /// Stop polling while the push feed is connected.
    pub suspend_polling_when_healthy: bool,
    /// First delay before resubscribing to the change feed.
    #[serde(rename = "reconnect_initial_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_initial: Duration,
    /// Cap on the resubscription delay.
    #[serde(rename = "reconnect_max_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_max: Duration,
    /// Attempts at clearing a holder's claim after the score was written.
    pub clear_retry_attempts: u32,
    /// Attempts at the idempotent score step.
    pub score_retry_attempts: u32,
    /// Bound on every store round trip.
    #[serde(rename = "store_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub store_timeout: Duration,
    /// Bound on the score step of one adjudication.
    #[serde(rename = "resolution_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub resolution_timeout: Duration,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        turn_secs = config.turn_duration.as_secs(),
                        expiry = ?config.expiry_policy,
                        "loaded turn configuration"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(contents)?;
        config.normalize();
        Ok(config)
    }

    /// Score delta for a verdict.
    pub fn delta_for(&self, verdict: crate::state::state_machine::Verdict) -> i64 {
        match verdict {
            crate::state::state_machine::Verdict::Accept => self.accept_delta,
            crate::state::state_machine::Verdict::Fail => self.fail_delta,
        }
    }

    fn normalize(&mut self) {
        if self.turn_duration.is_zero() {
            self.turn_duration = Duration::from_secs(1);
        }
        if self.reconnect_max < self.reconnect_initial {
            self.reconnect_max = self.reconnect_initial;
        }
        self.clear_retry_attempts = self.clear_retry_attempts.max(1);
        self.score_retry_attempts = self.score_retry_attempts.max(1);
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            turn_duration: Duration::from_secs(15),
            accept_delta: 1,
            fail_delta: -1,
            expiry_policy: ExpiryPolicy::AwaitAdjudicator,
            accept_policy: AcceptPolicy::ClearHolder,
            auto_register: true,
            poll_interval: Duration::from_millis(2_000),
            debounce: Duration::from_millis(120),
            suspend_polling_when_healthy: true,
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            clear_retry_attempts: 3,
            score_retry_attempts: 2,
            store_timeout: Duration::from_secs(3),
            resolution_timeout: Duration::from_secs(5),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_keeps_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config.turn_duration, Duration::from_secs(15));
        assert_eq!(config.accept_delta, 1);
        assert_eq!(config.fail_delta, -1);
        assert_eq!(config.expiry_policy, ExpiryPolicy::AwaitAdjudicator);
        assert_eq!(config.poll_interval, Duration::from_millis(2_000));
        assert_eq!(config.debounce, Duration::from_millis(120));
    }

    #[test]
    fn durations_are_read_in_their_units() {
        let config = AppConfig::from_json(
            r#"{
                "turn_duration_secs": 20,
                "poll_interval_ms": 1500,
                "expiry_policy": "auto_fail",
                "accept_policy": "reset_round"
            }"#,
        )
        .unwrap();
        assert_eq!(config.turn_duration, Duration::from_secs(20));
        assert_eq!(config.poll_interval, Duration::from_millis(1_500));
        assert_eq!(config.expiry_policy, ExpiryPolicy::AutoFail);
        assert_eq!(config.accept_policy, AcceptPolicy::ResetRound);
    }

    #[test]
    fn nonsensical_limits_are_clamped() {
        let config = AppConfig::from_json(
            r#"{ "reconnect_initial_ms": 5000, "reconnect_max_ms": 10, "clear_retry_attempts": 0 }"#,
        )
        .unwrap();
        assert_eq!(config.reconnect_max, Duration::from_secs(5));
        assert_eq!(config.clear_retry_attempts, 1);
    }
}
