// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The handle a flow body receives.
//!
//! A [`Workflow`] is bound to one run of one flow instance at one epoch. Every
//! write it performs first checks that the run still owns the flow; once the
//! lease is lost every accessor returns [`FlowError::Superseded`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use durra_core::{CoreError, EffectId, FlowId, FunctionStore, StoredEffect};
use tracing::debug;

use crate::context::Context;
use crate::effect::Effect;
use crate::error::{FlowError, FlowResult};
use crate::lease::LeaseState;
use crate::messages::Messages;
use crate::semaphore::{DistributedSemaphore, HeldSemaphore};
use crate::settings::Settings;
use crate::time;

/// Context of one flow run.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<Inner>,
}

struct Inner {
    flow_id: FlowId,
    epoch: i32,
    ctx: Arc<Context>,
    lease: Arc<LeaseState>,
    effects: Mutex<HashMap<EffectId, StoredEffect>>,
    held: Mutex<Vec<HeldSemaphore>>,
}

impl Workflow {
    /// Bind a run and preload the effects stored so far.
    pub(crate) async fn load(
        flow_id: FlowId,
        epoch: i32,
        ctx: Arc<Context>,
        lease: Arc<LeaseState>,
        held: Vec<HeldSemaphore>,
    ) -> Result<Self, CoreError> {
        let effects = ctx.store.effects().get_effect_results(&flow_id).await?;
        debug!(flow_id = %flow_id, epoch, effects = effects.len(), "Loaded effects");

        let effects = effects
            .into_iter()
            .map(|effect| (effect.effect_id.clone(), effect))
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                flow_id,
                epoch,
                ctx,
                lease,
                effects: Mutex::new(effects),
                held: Mutex::new(held),
            }),
        })
    }

    /// Id of the running instance.
    pub fn flow_id(&self) -> &FlowId {
        &self.inner.flow_id
    }

    /// Epoch this run holds.
    pub fn epoch(&self) -> i32 {
        self.inner.epoch
    }

    /// Whether another executor may have taken over.
    pub fn is_superseded(&self) -> bool {
        self.inner.lease.is_superseded()
    }

    /// Memoized steps.
    pub fn effect(&self) -> Effect {
        Effect::new(self.clone())
    }

    /// The instance's message log.
    pub fn messages(&self) -> Messages {
        Messages::new(self.clone())
    }

    /// Correlation ids of this instance.
    pub fn correlations(&self) -> Correlations {
        Correlations {
            workflow: self.clone(),
        }
    }

    /// A persisted counting semaphore shared by every flow using the same
    /// `(group, instance)` pair.
    pub fn semaphore(
        &self,
        group: impl Into<String>,
        instance: impl Into<String>,
        maximum_count: usize,
    ) -> DistributedSemaphore {
        DistributedSemaphore::new(self.clone(), group.into(), instance.into(), maximum_count)
    }

    /// Durable sleep.
    ///
    /// The wake-up time is captured once under `id`, so a replay waits only for
    /// what is left. Short waits happen in-process; longer ones postpone the
    /// flow until the wake-up time.
    pub async fn delay(&self, id: &str, duration: Duration) -> FlowResult<()> {
        let wake_at: DateTime<Utc> = self
            .effect()
            .capture(format!("delay:{}", id), || async move {
                Ok::<_, FlowError>(time::from_now(duration))
            })
            .await?;

        let remaining = time::until(wake_at);
        if remaining.is_zero() {
            return Ok(());
        }
        if remaining <= self.settings().max_inline_wait {
            tokio::time::sleep(remaining).await;
            return self.ensure_current();
        }

        debug!(flow_id = %self.flow_id(), id, until = %wake_at, "Postponing for delay");
        Err(FlowError::Postpone(wake_at))
    }

    /// Wall-clock time, captured once under `id` and replayed afterwards.
    pub async fn utc_now(&self, id: &str) -> FlowResult<DateTime<Utc>> {
        self.effect()
            .capture(format!("utc_now:{}", id), || async {
                Ok::<_, FlowError>(Utc::now())
            })
            .await
    }

    pub(crate) fn ensure_current(&self) -> FlowResult<()> {
        if self.inner.lease.is_superseded() {
            return Err(FlowError::Superseded);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn lease_state(&self) -> &Arc<LeaseState> {
        &self.inner.lease
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.inner.ctx
    }

    pub(crate) fn store(&self) -> &dyn FunctionStore {
        self.inner.ctx.store.as_ref()
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.ctx.settings
    }

    /// Interrupt count to hand to a suspend. Read before looking at the state
    /// the flow waits on, so an interrupt in between rejects the suspend.
    pub(crate) async fn interrupt_count(&self) -> FlowResult<i64> {
        let count = self.store().get_interrupt_count(self.flow_id()).await?;
        Ok(count.unwrap_or_default())
    }

    pub(crate) fn cached_effect(&self, id: &EffectId) -> Option<StoredEffect> {
        self.lock_effects().get(id).cloned()
    }

    pub(crate) fn cache_effect(&self, effect: StoredEffect) {
        self.lock_effects().insert(effect.effect_id.clone(), effect);
    }

    pub(crate) fn forget_effect(&self, id: &EffectId) {
        self.lock_effects().remove(id);
    }

    pub(crate) fn hold(&self, semaphore: HeldSemaphore) {
        let mut held = self.lock_held();
        if !held.contains(&semaphore) {
            held.push(semaphore);
        }
    }

    pub(crate) fn forget_held(&self, semaphore: &HeldSemaphore) {
        self.lock_held().retain(|s| s != semaphore);
    }

    pub(crate) fn held(&self) -> Vec<HeldSemaphore> {
        self.lock_held().clone()
    }

    fn lock_effects(&self) -> std::sync::MutexGuard<'_, HashMap<EffectId, StoredEffect>> {
        self.inner.effects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, Vec<HeldSemaphore>> {
        self.inner.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Correlation ids of the running instance.
///
/// Correlations let external code find flow instances by a business key.
#[derive(Clone)]
pub struct Correlations {
    workflow: Workflow,
}

impl Correlations {
    /// Attach `correlation` (idempotent).
    pub async fn register(&self, correlation: &str) -> FlowResult<()> {
        self.workflow.ensure_current()?;
        self.workflow
            .store()
            .correlations()
            .set_correlation(self.workflow.flow_id(), correlation)
            .await?;
        Ok(())
    }

    /// Detach `correlation`.
    pub async fn remove(&self, correlation: &str) -> FlowResult<()> {
        self.workflow.ensure_current()?;
        self.workflow
            .store()
            .correlations()
            .remove_correlation(self.workflow.flow_id(), correlation)
            .await?;
        Ok(())
    }

    /// Sorted correlation ids.
    pub async fn get(&self) -> FlowResult<Vec<String>> {
        let correlations = self
            .workflow
            .store()
            .correlations()
            .get_correlations(self.workflow.flow_id())
            .await?;
        Ok(correlations)
    }

    /// Whether `correlation` is attached.
    pub async fn contains(&self, correlation: &str) -> FlowResult<bool> {
        Ok(self.get().await?.iter().any(|c| c == correlation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn test_utc_now_is_replayed() {
        let ctx = test_support::context(Settings::default());
        let first = test_support::workflow(&ctx, "clock").await;
        let captured = first.utc_now("start").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let replay = test_support::reload(&first).await;
        assert_eq!(replay.utc_now("start").await.unwrap(), captured);
    }

    #[tokio::test]
    async fn test_short_delay_waits_inline() {
        let settings = Settings::default().with_max_inline_wait(Duration::from_secs(1));
        let ctx = test_support::context(settings);
        let workflow = test_support::workflow(&ctx, "short-delay").await;

        let started = std::time::Instant::now();
        workflow.delay("pause", Duration::from_millis(30)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_long_delay_postpones_until_captured_time() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "long-delay").await;

        let first = workflow.delay("pause", Duration::from_secs(60)).await;
        let Err(FlowError::Postpone(until)) = first else {
            panic!("expected postpone, got {:?}", first);
        };

        // A replay postpones to the same instant rather than another minute.
        let replay = test_support::reload(&workflow).await;
        match replay.delay("pause", Duration::from_secs(60)).await {
            Err(FlowError::Postpone(again)) => assert_eq!(again, until),
            other => panic!("expected postpone, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_correlations() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "correlated").await;
        let correlations = workflow.correlations();

        correlations.register("order-7").await.unwrap();
        correlations.register("customer-3").await.unwrap();
        correlations.register("order-7").await.unwrap();
        assert_eq!(
            correlations.get().await.unwrap(),
            vec!["customer-3".to_string(), "order-7".to_string()]
        );

        correlations.remove("customer-3").await.unwrap();
        assert!(!correlations.contains("customer-3").await.unwrap());
        assert!(correlations.contains("order-7").await.unwrap());
    }

    #[tokio::test]
    async fn test_superseded_workflow_refuses_writes() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "stale").await;
        test_support::take_over(&workflow).await;

        assert!(workflow.is_superseded());
        assert!(matches!(
            workflow.correlations().register("x").await,
            Err(FlowError::Superseded)
        ));
    }
}
