// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Durra configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or file path
    pub database_url: String,
    /// Length of the ownership lease granted to an executor
    pub lease_length: Duration,
    /// Crash watchdog poll interval (zero disables the watchdog)
    pub watchdog_check_frequency: Duration,
    /// Postponed watchdog poll interval (zero disables the watchdog)
    pub postponed_check_frequency: Duration,
    /// Timeout watchdog poll interval (zero disables the watchdog)
    pub timeout_check_frequency: Duration,
    /// How often a waiting subscription pulls new messages
    pub message_pull_frequency: Duration,
    /// How long a flow waits in-process before suspending
    pub max_inline_wait: Duration,
    /// Maximum watchdog-originated invocations running at once in this process
    pub max_concurrent_dispatches: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DURRA_DATABASE_URL`: SQLite connection string (e.g. `sqlite:.data/durra.db?mode=rwc`)
    ///
    /// Optional (with defaults):
    /// - `DURRA_LEASE_LENGTH_MS`: lease length (default: 10000)
    /// - `DURRA_WATCHDOG_CHECK_FREQUENCY_MS`: crash watchdog interval (default: 1000)
    /// - `DURRA_POSTPONED_CHECK_FREQUENCY_MS`: postponed watchdog interval (default: 1000)
    /// - `DURRA_TIMEOUT_CHECK_FREQUENCY_MS`: timeout watchdog interval (default: 1000)
    /// - `DURRA_MESSAGE_PULL_FREQUENCY_MS`: subscription pull interval (default: 250)
    /// - `DURRA_MAX_INLINE_WAIT_MS`: in-process wait before suspending (default: 0)
    /// - `DURRA_MAX_CONCURRENT_DISPATCHES`: watchdog dispatch limit (default: 32)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DURRA_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DURRA_DATABASE_URL"))?;

        let lease_length = millis_var("DURRA_LEASE_LENGTH_MS", 10_000)?;
        if lease_length.is_zero() {
            return Err(ConfigError::Invalid(
                "DURRA_LEASE_LENGTH_MS",
                "must be greater than zero",
            ));
        }

        let max_concurrent_dispatches: u32 = std::env::var("DURRA_MAX_CONCURRENT_DISPATCHES")
            .unwrap_or_else(|_| "32".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DURRA_MAX_CONCURRENT_DISPATCHES",
                    "must be a positive integer",
                )
            })?;
        if max_concurrent_dispatches == 0 {
            return Err(ConfigError::Invalid(
                "DURRA_MAX_CONCURRENT_DISPATCHES",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            lease_length,
            watchdog_check_frequency: millis_var("DURRA_WATCHDOG_CHECK_FREQUENCY_MS", 1_000)?,
            postponed_check_frequency: millis_var("DURRA_POSTPONED_CHECK_FREQUENCY_MS", 1_000)?,
            timeout_check_frequency: millis_var("DURRA_TIMEOUT_CHECK_FREQUENCY_MS", 1_000)?,
            message_pull_frequency: millis_var("DURRA_MESSAGE_PULL_FREQUENCY_MS", 250)?,
            max_inline_wait: millis_var("DURRA_MAX_INLINE_WAIT_MS", 0)?,
            max_concurrent_dispatches,
        })
    }
}

fn millis_var(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative number of milliseconds")),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
