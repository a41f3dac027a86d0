// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch of postponed flows once they are due.

use chrono::Utc;
use durra_core::CoreError;
use tracing::{debug, info, warn};

use super::Watch;

/// Re-dispatches `Postponed` flows whose retry time has arrived.
pub(crate) struct PostponedWatchdog {
    watch: Watch,
}

impl PostponedWatchdog {
    pub(crate) fn new(watch: Watch) -> Self {
        Self { watch }
    }

    pub(crate) async fn run(self) {
        info!(
            flow_type = %self.watch.flow_type,
            interval_ms = self.watch.interval.as_millis() as u64,
            "Postponed watchdog started"
        );

        while self.watch.tick().await {
            self.watch.report("postponed", self.check().await);
        }

        debug!(flow_type = %self.watch.flow_type, "Postponed watchdog stopped");
    }

    pub(crate) async fn check(&self) -> Result<(), CoreError> {
        let due = self
            .watch
            .ctx
            .store
            .get_postponed_functions(&self.watch.flow_type, Utc::now())
            .await?;

        if due.is_empty() {
            return Ok(());
        }
        debug!(flow_type = %self.watch.flow_type, count = due.len(), "Postponed flows are due");

        for function in due {
            if let Err(e) = self
                .watch
                .resume(function.flow_id.clone(), function.epoch, "postponed")
                .await
            {
                warn!(flow_id = %function.flow_id, error = %e, "Failed to dispatch postponed flow");
            }
        }
        Ok(())
    }
}
