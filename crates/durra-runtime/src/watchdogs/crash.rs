// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery of flows whose executor stopped renewing its lease.

use chrono::Utc;
use durra_core::CoreError;
use tracing::{debug, info, warn};

use super::Watch;

/// Re-dispatches `Executing` flows with a lapsed lease.
pub(crate) struct CrashWatchdog {
    watch: Watch,
}

impl CrashWatchdog {
    pub(crate) fn new(watch: Watch) -> Self {
        Self { watch }
    }

    pub(crate) async fn run(self) {
        info!(
            flow_type = %self.watch.flow_type,
            interval_ms = self.watch.interval.as_millis() as u64,
            "Crash watchdog started"
        );

        while self.watch.tick().await {
            self.watch.report("crash", self.check().await);
        }

        debug!(flow_type = %self.watch.flow_type, "Crash watchdog stopped");
    }

    pub(crate) async fn check(&self) -> Result<(), CoreError> {
        let crashed = self
            .watch
            .ctx
            .store
            .get_crashed_functions(&self.watch.flow_type, Utc::now())
            .await?;

        if crashed.is_empty() {
            return Ok(());
        }

        warn!(
            flow_type = %self.watch.flow_type,
            count = crashed.len(),
            "Found flows with a lapsed lease"
        );

        for function in crashed {
            debug!(
                flow_id = %function.flow_id,
                epoch = function.epoch,
                lease_expiration = %function.lease_expiration,
                "Recovering crashed flow"
            );
            if let Err(e) = self
                .watch
                .resume(function.flow_id.clone(), function.epoch, "crashed")
                .await
            {
                warn!(flow_id = %function.flow_id, error = %e, "Failed to recover crashed flow");
            }
        }
        Ok(())
    }
}
