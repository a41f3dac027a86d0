// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background recovery loops, one set per registered flow type.
//!
//! - [`CrashWatchdog`] takes over executing flows whose lease ran out.
//! - [`PostponedWatchdog`] starts postponed flows that became due.
//! - [`TimeoutWatchdog`] turns expired timeouts into log events.
//!
//! Every take-over goes through the same epoch compare-and-swap as any other
//! executor, so several processes may run watchdogs over one store.

mod crash;
mod postponed;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use durra_core::{CoreError, FlowId, FlowType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::{Context, Dispatch};

pub(crate) use self::crash::CrashWatchdog;
pub(crate) use self::postponed::PostponedWatchdog;
pub(crate) use self::timeout::TimeoutWatchdog;

/// Start the watchdogs of one flow type. A zero interval disables that watchdog.
pub(crate) fn spawn_all(ctx: &Arc<Context>, flow_type: &FlowType, dispatch: Arc<dyn Dispatch>) {
    let settings = &ctx.settings;

    if !settings.watchdog_check_frequency.is_zero() {
        let watchdog = CrashWatchdog::new(Watch::new(ctx, flow_type, &dispatch, settings.watchdog_check_frequency));
        tokio::spawn(watchdog.run());
    }
    if !settings.postponed_check_frequency.is_zero() {
        let watchdog =
            PostponedWatchdog::new(Watch::new(ctx, flow_type, &dispatch, settings.postponed_check_frequency));
        tokio::spawn(watchdog.run());
    }
    if !settings.timeout_check_frequency.is_zero() {
        let watchdog = TimeoutWatchdog::new(Watch::new(ctx, flow_type, &dispatch, settings.timeout_check_frequency));
        tokio::spawn(watchdog.run());
    }
}

/// What every watchdog needs: the store, the flow type it polls, the
/// dispatcher it hands take-overs to, and when to stop.
pub(crate) struct Watch {
    pub(crate) ctx: Arc<Context>,
    pub(crate) flow_type: FlowType,
    pub(crate) dispatch: Arc<dyn Dispatch>,
    pub(crate) interval: Duration,
    stop: CancellationToken,
}

impl Watch {
    pub(crate) fn new(
        ctx: &Arc<Context>,
        flow_type: &FlowType,
        dispatch: &Arc<dyn Dispatch>,
        interval: Duration,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            flow_type: flow_type.clone(),
            dispatch: dispatch.clone(),
            interval,
            stop: ctx.shutdown.token().clone(),
        }
    }

    /// Sleep one interval. `false` once the registry stops.
    pub(crate) async fn tick(&self) -> bool {
        tokio::select! {
            biased;

            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.interval) => true,
        }
    }

    /// Take over `flow_id` at `epoch`, holding a dispatch permit for the run.
    pub(crate) async fn resume(&self, flow_id: FlowId, epoch: i32, reason: &'static str) -> Result<(), CoreError> {
        let permit = tokio::select! {
            biased;

            _ = self.stop.cancelled() => return Ok(()),
            permit = self.ctx.dispatch_permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            },
        };

        if self.dispatch.resume(flow_id.clone(), epoch, Some(permit)).await? {
            info!(flow_id = %flow_id, epoch, reason, "Watchdog re-dispatched flow");
        } else {
            debug!(flow_id = %flow_id, epoch, reason, "Flow already taken by another executor");
        }
        Ok(())
    }

    pub(crate) fn report(&self, watchdog: &'static str, result: Result<(), CoreError>) {
        if let Err(e) = result {
            error!(flow_type = %self.flow_type, watchdog, error = %e, "Watchdog check failed");
        }
    }
}
