// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted counting semaphores shared across flow instances.
//!
//! Holders queue in acquisition order per `(group, instance)`; the first
//! `maximum_count` entries hold the semaphore. A flow that is not in the
//! window waits inline for a while and then suspends. Releasing interrupts the
//! holders that moved into the window, which re-dispatches them.

use std::time::Duration;

use durra_core::{CoreError, FlowId};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{FlowError, FlowResult, SuspendHint};
use crate::workflow::Workflow;

/// A semaphore a flow holds; released when the flow finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeldSemaphore {
    pub(crate) group: String,
    pub(crate) instance: String,
    pub(crate) maximum_count: usize,
}

/// Handle for acquiring one semaphore from flow code.
pub struct DistributedSemaphore {
    workflow: Workflow,
    key: HeldSemaphore,
}

impl DistributedSemaphore {
    pub(crate) fn new(workflow: Workflow, group: String, instance: String, maximum_count: usize) -> Self {
        Self {
            workflow,
            key: HeldSemaphore {
                group,
                instance,
                maximum_count,
            },
        }
    }

    /// Acquire, waiting inline up to the registry's inline budget and
    /// suspending after that. Acquiring a semaphore the flow already holds
    /// succeeds immediately.
    pub async fn acquire(&self) -> FlowResult<SemaphoreLock> {
        let key = &self.key;
        let flow_id = self.workflow.flow_id();
        let settings = self.workflow.settings();
        let deadline = Instant::now() + settings.max_inline_wait;

        loop {
            self.workflow.ensure_current()?;
            let interrupt_count = self.workflow.interrupt_count().await?;
            let acquired = self
                .workflow
                .store()
                .semaphores()
                .acquire(&key.group, &key.instance, flow_id, key.maximum_count)
                .await?;

            if acquired {
                debug!(flow_id = %flow_id, group = %key.group, instance = %key.instance, "Semaphore acquired");
                self.workflow.hold(key.clone());
                return Ok(SemaphoreLock {
                    workflow: self.workflow.clone(),
                    key: key.clone(),
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(flow_id = %flow_id, group = %key.group, instance = %key.instance, "Semaphore busy, suspending");
                return Err(FlowError::Suspend(SuspendHint::new(
                    interrupt_count,
                    format!("waiting for semaphore {}/{}", key.group, key.instance),
                )));
            }
            let pause = remaining
                .min(settings.message_pull_frequency)
                .max(Duration::from_millis(1));
            tokio::time::sleep(pause).await;
        }
    }
}

/// Proof of holding a semaphore.
///
/// Dropping the lock does not release it: a flow holds its semaphores across
/// suspensions and replays until it calls [`SemaphoreLock::release`] or
/// finishes.
pub struct SemaphoreLock {
    workflow: Workflow,
    key: HeldSemaphore,
}

impl SemaphoreLock {
    /// Group name.
    pub fn group(&self) -> &str {
        &self.key.group
    }

    /// Instance name within the group.
    pub fn instance(&self) -> &str {
        &self.key.instance
    }

    /// Release and wake the flows that moved into the window.
    pub async fn release(self) -> FlowResult<()> {
        self.workflow.ensure_current()?;
        release(self.workflow.context(), &self.key, self.workflow.flow_id()).await?;
        self.workflow.forget_held(&self.key);
        Ok(())
    }
}

/// Release `holder` and interrupt whoever it let in.
pub(crate) async fn release(ctx: &Context, key: &HeldSemaphore, holder: &FlowId) -> Result<(), CoreError> {
    let semaphores = ctx.store.semaphores();
    let before = semaphores
        .get_queued(&key.group, &key.instance, key.maximum_count)
        .await?;
    let window = semaphores
        .release(&key.group, &key.instance, holder, key.maximum_count)
        .await?;

    let promoted: Vec<FlowId> = window.into_iter().filter(|id| !before.contains(id)).collect();
    if !promoted.is_empty() {
        info!(
            group = %key.group,
            instance = %key.instance,
            promoted = promoted.len(),
            "Semaphore released, waking promoted holders"
        );
    }
    ctx.wake_all(&promoted).await
}
