// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process tuning for a [`crate::Registry`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use durra_core::{Config, FlowId};

use crate::error::FlowFailure;

/// Callback invoked once for every failure persisted as `Failed`.
pub type UnhandledFailureHandler = Arc<dyn Fn(&FlowId, &FlowFailure) + Send + Sync>;

/// Engine settings shared by every flow registered on one registry.
#[derive(Clone)]
pub struct Settings {
    /// Length of the ownership lease; renewed every half lease.
    pub lease_length: Duration,
    /// Crash watchdog poll interval (zero disables).
    pub watchdog_check_frequency: Duration,
    /// Postponed watchdog poll interval (zero disables).
    pub postponed_check_frequency: Duration,
    /// Timeout watchdog poll interval (zero disables).
    pub timeout_check_frequency: Duration,
    /// How often an unsatisfied wait pulls the message log again.
    pub message_pull_frequency: Duration,
    /// How long a flow waits in-process before it suspends or postpones.
    pub max_inline_wait: Duration,
    /// Watchdog-originated invocations allowed to run at once.
    pub max_concurrent_dispatches: usize,
    /// Process-wide callback for failures no flow handler took care of.
    pub unhandled_failure: Option<UnhandledFailureHandler>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lease_length: Duration::from_secs(10),
            watchdog_check_frequency: Duration::from_secs(1),
            postponed_check_frequency: Duration::from_secs(1),
            timeout_check_frequency: Duration::from_secs(1),
            message_pull_frequency: Duration::from_millis(250),
            max_inline_wait: Duration::ZERO,
            max_concurrent_dispatches: 32,
            unhandled_failure: None,
        }
    }
}

impl Settings {
    /// Set the lease length.
    pub fn with_lease_length(mut self, lease_length: Duration) -> Self {
        self.lease_length = lease_length;
        self
    }

    /// Set the crash watchdog interval.
    pub fn with_watchdog_check_frequency(mut self, frequency: Duration) -> Self {
        self.watchdog_check_frequency = frequency;
        self
    }

    /// Set the postponed watchdog interval.
    pub fn with_postponed_check_frequency(mut self, frequency: Duration) -> Self {
        self.postponed_check_frequency = frequency;
        self
    }

    /// Set the timeout watchdog interval.
    pub fn with_timeout_check_frequency(mut self, frequency: Duration) -> Self {
        self.timeout_check_frequency = frequency;
        self
    }

    /// Set the message pull interval.
    pub fn with_message_pull_frequency(mut self, frequency: Duration) -> Self {
        self.message_pull_frequency = frequency;
        self
    }

    /// Set the inline wait budget.
    pub fn with_max_inline_wait(mut self, wait: Duration) -> Self {
        self.max_inline_wait = wait;
        self
    }

    /// Set the watchdog dispatch limit.
    pub fn with_max_concurrent_dispatches(mut self, limit: usize) -> Self {
        self.max_concurrent_dispatches = limit;
        self
    }

    /// Install the unhandled failure callback.
    pub fn on_unhandled_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn(&FlowId, &FlowFailure) + Send + Sync + 'static,
    {
        self.unhandled_failure = Some(Arc::new(handler));
        self
    }

    /// Disable every watchdog. Useful in tests that drive recovery by hand.
    pub fn without_watchdogs(self) -> Self {
        self.with_watchdog_check_frequency(Duration::ZERO)
            .with_postponed_check_frequency(Duration::ZERO)
            .with_timeout_check_frequency(Duration::ZERO)
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            lease_length: config.lease_length,
            watchdog_check_frequency: config.watchdog_check_frequency,
            postponed_check_frequency: config.postponed_check_frequency,
            timeout_check_frequency: config.timeout_check_frequency,
            message_pull_frequency: config.message_pull_frequency,
            max_inline_wait: config.max_inline_wait,
            max_concurrent_dispatches: config.max_concurrent_dispatches as usize,
            unhandled_failure: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("lease_length", &self.lease_length)
            .field("watchdog_check_frequency", &self.watchdog_check_frequency)
            .field("postponed_check_frequency", &self.postponed_check_frequency)
            .field("timeout_check_frequency", &self.timeout_check_frequency)
            .field("message_pull_frequency", &self.message_pull_frequency)
            .field("max_inline_wait", &self.max_inline_wait)
            .field("max_concurrent_dispatches", &self.max_concurrent_dispatches)
            .field("unhandled_failure", &self.unhandled_failure.is_some())
            .finish()
    }
}
