// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Firing of registered timeouts.
//!
//! An expired timeout becomes a [`TimeoutEvent`] in the owner's log. The event
//! carries an idempotency key, so a crash between the append and the removal
//! does not fire it twice.

use chrono::Utc;
use durra_core::{CoreError, Status, StoredTimeout};
use tracing::{debug, info, warn};

use super::Watch;
use crate::messages::TimeoutEvent;

/// Appends events for expired timeouts and wakes suspended owners.
pub(crate) struct TimeoutWatchdog {
    watch: Watch,
}

impl TimeoutWatchdog {
    pub(crate) fn new(watch: Watch) -> Self {
        Self { watch }
    }

    pub(crate) async fn run(self) {
        info!(
            flow_type = %self.watch.flow_type,
            interval_ms = self.watch.interval.as_millis() as u64,
            "Timeout watchdog started"
        );

        while self.watch.tick().await {
            self.watch.report("timeout", self.check().await);
        }

        debug!(flow_type = %self.watch.flow_type, "Timeout watchdog stopped");
    }

    pub(crate) async fn check(&self) -> Result<(), CoreError> {
        let store = &self.watch.ctx.store;
        let expired = store
            .timeouts()
            .get_timeouts(&self.watch.flow_type, Utc::now())
            .await?;

        for timeout in expired {
            if let Err(e) = self.fire(&timeout).await {
                warn!(
                    flow_id = %timeout.flow_id,
                    timeout_id = %timeout.timeout_id,
                    error = %e,
                    "Failed to fire timeout"
                );
            }
        }
        Ok(())
    }

    async fn fire(&self, timeout: &StoredTimeout) -> Result<(), CoreError> {
        let store = &self.watch.ctx.store;
        let event = TimeoutEvent {
            timeout_id: timeout.timeout_id.clone(),
            expiry: timeout.expiry,
        };
        let observed = store
            .messages()
            .append_message(&timeout.flow_id, &event.to_message()?)
            .await?;
        info!(
            flow_id = %timeout.flow_id,
            timeout_id = %timeout.timeout_id,
            "Timeout expired"
        );

        if let Some(observed) = observed
            && observed.status == Status::Suspended
        {
            self.watch
                .resume(timeout.flow_id.clone(), observed.epoch, "timeout")
                .await?;
        }

        store
            .timeouts()
            .remove_timeout(&timeout.flow_id, &timeout.timeout_id)
            .await
    }
}
