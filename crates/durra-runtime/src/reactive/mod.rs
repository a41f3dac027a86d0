// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reactive subscriptions over a flow's message log.
//!
//! A [`Chain`] is built from operators and awaited through a terminal such as
//! [`Chain::first`]. The terminal pulls the log, evaluates the chain over
//! everything delivered so far and returns once the chain is satisfied. If it
//! is not satisfied within the inline wait budget the flow suspends; a later
//! message or timeout interrupts it and the whole flow replays.
//!
//! Timeouts are captured as effects the first time a chain is awaited. When
//! one expires a [`TimeoutEvent`] is appended to the log (by the waiting flow
//! itself or by the timeout watchdog), so a replay sees the timeout at the
//! same log position.

pub mod operators;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use durra_core::{CoreError, StoredMessage, StoredTimeout};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{FlowError, FlowFailure, FlowResult, SuspendHint};
use crate::messages::{MessageType, Messages, TimeoutEvent};
use crate::time;

pub use self::operators::{Emission, Item};

type Evaluator<T> = Arc<dyn Fn(&[StoredMessage]) -> Result<Emission<T>, CoreError> + Send + Sync>;

#[derive(Debug, Clone)]
struct ChainTimeout {
    id: String,
    duration: Duration,
}

/// A composable subscription over the running flow's messages.
pub struct Chain<T> {
    messages: Messages,
    eval: Evaluator<T>,
    timeouts: Vec<ChainTimeout>,
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Self {
            messages: self.messages.clone(),
            eval: self.eval.clone(),
            timeouts: self.timeouts.clone(),
        }
    }
}

impl Chain<StoredMessage> {
    pub(crate) fn source(messages: Messages) -> Self {
        Self {
            messages,
            eval: Arc::new(|log: &[StoredMessage]| Ok(operators::source(log))),
            timeouts: Vec::new(),
        }
    }
}

impl<T: MessageType> Chain<T> {
    pub(crate) fn of_type(messages: Messages) -> Self {
        Self {
            messages,
            eval: Arc::new(|log: &[StoredMessage]| operators::of_type::<T>(log)),
            timeouts: Vec::new(),
        }
    }
}

impl<T: Send + 'static> Chain<T> {
    fn derive<U>(
        self,
        eval: impl Fn(&[StoredMessage]) -> Result<Emission<U>, CoreError> + Send + Sync + 'static,
    ) -> Chain<U> {
        Chain {
            messages: self.messages,
            eval: Arc::new(eval),
            timeouts: self.timeouts,
        }
    }

    /// Keep values matching `predicate`.
    pub fn filter<F>(self, predicate: F) -> Chain<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let upstream = self.eval.clone();
        self.derive(move |log| Ok(operators::filter(upstream(log)?, &predicate)))
    }

    /// Transform each value.
    pub fn map<U, F>(self, f: F) -> Chain<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let upstream = self.eval.clone();
        self.derive(move |log| Ok(operators::map(upstream(log)?, &f)))
    }

    /// Complete after `count` values.
    pub fn take(self, count: usize) -> Chain<T> {
        let upstream = self.eval.clone();
        self.derive(move |log| Ok(operators::take(upstream(log)?, count)))
    }

    /// Drop the first `count` values.
    pub fn skip(self, count: usize) -> Chain<T> {
        let upstream = self.eval.clone();
        self.derive(move |log| Ok(operators::skip(upstream(log)?, count)))
    }

    /// Complete at the first value matching `predicate`, without emitting it.
    pub fn take_until<F>(self, predicate: F) -> Chain<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let upstream = self.eval.clone();
        self.derive(move |log| Ok(operators::take_until(upstream(log)?, &predicate)))
    }

    /// Emit values in chunks of `size`.
    pub fn buffer(self, size: usize) -> Chain<Vec<T>> {
        let upstream = self.eval.clone();
        self.derive(move |log| Ok(operators::buffer(upstream(log)?, size)))
    }

    /// Interleave with another chain over the same log.
    pub fn merge(self, other: Chain<T>) -> Chain<T> {
        let left = self.eval.clone();
        let right = other.eval;
        let mut merged = self.derive(move |log| Ok(operators::merge(left(log)?, right(log)?)));
        for timeout in other.timeouts {
            if !merged.timeouts.iter().any(|t| t.id == timeout.id) {
                merged.timeouts.push(timeout);
            }
        }
        merged
    }

    /// Complete the chain `duration` after it is first awaited.
    ///
    /// `id` must be unique within the flow; it names both the captured expiry
    /// and the persisted timeout.
    pub fn timeout(self, id: impl Into<String>, duration: Duration) -> Chain<T> {
        let id = id.into();
        let upstream = self.eval.clone();
        let timeout_id = id.clone();
        let mut chain = self.derive(move |log| {
            let fired = operators::fired_at(log, &timeout_id)?;
            Ok(operators::timeout(upstream(log)?, fired))
        });
        chain.timeouts.retain(|t| t.id != id);
        chain.timeouts.push(ChainTimeout { id, duration });
        chain
    }

    /// Evaluate the chain over a log prefix without waiting.
    pub fn evaluate(&self, log: &[StoredMessage]) -> Result<Emission<T>, CoreError> {
        (self.eval)(log)
    }

    /// The first value. Fails when the chain completes empty.
    pub async fn first(&self) -> FlowResult<T> {
        let emission = self.wait(|e| !e.items.is_empty() || e.is_completed()).await?;
        let timed_out = emission.timed_out;
        match emission.items.into_iter().next() {
            Some(item) => Ok(item.value),
            None => Err(self.empty_failure(timed_out)),
        }
    }

    /// The first value, or `None` when the chain completes empty.
    pub async fn first_or_none(&self) -> FlowResult<Option<T>> {
        let emission = self.wait(|e| !e.items.is_empty() || e.is_completed()).await?;
        Ok(emission.items.into_iter().next().map(|item| item.value))
    }

    /// The last value once the chain completes.
    pub async fn last(&self) -> FlowResult<T> {
        let emission = self.wait(Emission::is_completed).await?;
        let timed_out = emission.timed_out;
        match emission.items.into_iter().last() {
            Some(item) => Ok(item.value),
            None => Err(self.empty_failure(timed_out)),
        }
    }

    /// Every value once the chain completes.
    pub async fn collect(&self) -> FlowResult<Vec<T>> {
        let emission = self.wait(Emission::is_completed).await?;
        Ok(emission.items.into_iter().map(|item| item.value).collect())
    }

    /// Wait for completion. Returns `false` when a timeout completed the chain.
    pub async fn completion(&self) -> FlowResult<bool> {
        let emission = self.wait(Emission::is_completed).await?;
        Ok(!emission.timed_out)
    }

    fn empty_failure(&self, timed_out: bool) -> FlowError {
        if timed_out {
            FlowError::Failed(FlowFailure::new("timeout", "chain timed out before emitting"))
        } else {
            FlowError::Failed(FlowFailure::new("no_elements", "chain completed without emitting"))
        }
    }

    async fn wait(&self, satisfied: fn(&Emission<T>) -> bool) -> FlowResult<Emission<T>> {
        let workflow = self.messages.workflow();
        let settings = workflow.settings();
        let expiries = self.resolve_timeouts().await?;
        let deadline = Instant::now() + settings.max_inline_wait;
        let mut subscription = self.messages.subscribe();
        let mut delivered: Vec<StoredMessage> = Vec::new();

        loop {
            workflow.ensure_current()?;
            let interrupt_count = workflow.interrupt_count().await?;
            delivered.extend(subscription.pull().await?);

            let emission = (self.eval)(&delivered)?;
            if satisfied(&emission) {
                self.forget_timeouts(&expiries, &delivered).await?;
                return Ok(emission);
            }

            let pending = pending_timeouts(&expiries, &delivered)?;
            let now = Utc::now();
            let expired: Vec<_> = pending.iter().filter(|(_, expiry)| *expiry <= now).collect();
            if !expired.is_empty() {
                for (id, expiry) in expired {
                    debug!(flow_id = %workflow.flow_id(), timeout_id = %id, "Chain timeout expired");
                    let event = TimeoutEvent {
                        timeout_id: id.clone(),
                        expiry: *expiry,
                    };
                    workflow.ensure_current()?;
                    workflow
                        .store()
                        .messages()
                        .append_message(workflow.flow_id(), &event.to_message()?)
                        .await?;
                }
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                for (id, expiry) in &pending {
                    let timeout = StoredTimeout {
                        flow_id: workflow.flow_id().clone(),
                        timeout_id: id.clone(),
                        expiry: *expiry,
                    };
                    workflow.ensure_current()?;
                    workflow.store().timeouts().upsert_timeout(&timeout, false).await?;
                }
                debug!(
                    flow_id = %workflow.flow_id(),
                    delivered = delivered.len(),
                    pending_timeouts = pending.len(),
                    "Chain not satisfied, suspending"
                );
                return Err(FlowError::Suspend(SuspendHint::new(
                    interrupt_count,
                    "waiting for messages",
                )));
            }

            let mut pause = remaining.min(settings.message_pull_frequency);
            if let Some(next) = pending.iter().map(|(_, expiry)| *expiry).min() {
                pause = pause.min(time::until(next));
            }
            tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
        }
    }

    /// Expiry of every timeout in the chain, captured on first use.
    async fn resolve_timeouts(&self) -> FlowResult<Vec<(String, DateTime<Utc>)>> {
        let effect = self.messages.workflow().effect();
        let mut expiries = Vec::with_capacity(self.timeouts.len());
        for timeout in &self.timeouts {
            let duration = timeout.duration;
            let expiry: DateTime<Utc> = effect
                .capture(format!("timeout:{}", timeout.id), || async move {
                    Ok::<_, FlowError>(time::from_now(duration))
                })
                .await?;
            expiries.push((timeout.id.clone(), expiry));
        }
        Ok(expiries)
    }

    /// Drop registered timeouts that can no longer matter.
    async fn forget_timeouts(
        &self,
        expiries: &[(String, DateTime<Utc>)],
        delivered: &[StoredMessage],
    ) -> FlowResult<()> {
        let workflow = self.messages.workflow();
        for (id, _) in pending_timeouts(expiries, delivered)? {
            workflow.ensure_current()?;
            workflow
                .store()
                .timeouts()
                .remove_timeout(workflow.flow_id(), &id)
                .await?;
        }
        Ok(())
    }
}

fn pending_timeouts(
    expiries: &[(String, DateTime<Utc>)],
    delivered: &[StoredMessage],
) -> Result<Vec<(String, DateTime<Utc>)>, CoreError> {
    let mut pending = Vec::new();
    for (id, expiry) in expiries {
        if operators::fired_at(delivered, id)?.is_none() {
            pending.push((id.clone(), *expiry));
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::test_support;

    fn inline(wait: Duration) -> Settings {
        Settings::default()
            .with_max_inline_wait(wait)
            .with_message_pull_frequency(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_first_returns_available_message() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "first").await;
        let messages = workflow.messages();
        messages.append(&"hello".to_string(), None).await.unwrap();

        assert_eq!(messages.of_type::<String>().first().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unsatisfied_chain_suspends_and_registers_timeout() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "suspends").await;

        let result = workflow
            .messages()
            .of_type::<String>()
            .timeout("reply", Duration::from_secs(30))
            .first()
            .await;
        let Err(FlowError::Suspend(hint)) = result else {
            panic!("expected suspend, got {:?}", result.map(|_| ()));
        };
        assert_eq!(hint.interrupt_count, 0);

        let timeouts = ctx
            .store
            .timeouts()
            .get_timeouts_for(workflow.flow_id())
            .await
            .unwrap();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].timeout_id, "reply");
    }

    #[tokio::test]
    async fn test_inline_wait_sees_late_message() {
        let ctx = test_support::context(inline(Duration::from_secs(2)));
        let workflow = test_support::workflow(&ctx, "late").await;
        let messages = workflow.messages();

        let writer = messages.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append(&"one".to_string(), None).await.unwrap();
            writer.append(&"two".to_string(), None).await.unwrap();
        });

        let values = messages.of_type::<String>().take(2).collect().await.unwrap();
        assert_eq!(values, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_fires_inline() {
        let ctx = test_support::context(inline(Duration::from_secs(2)));
        let workflow = test_support::workflow(&ctx, "inline-timeout").await;
        let chain = workflow
            .messages()
            .of_type::<String>()
            .timeout("reply", Duration::from_millis(30));

        assert_eq!(chain.first_or_none().await.unwrap(), None);
        assert!(!chain.completion().await.unwrap());

        // The timeout is part of the log now; a late message does not change the outcome.
        workflow.messages().append(&"late".to_string(), None).await.unwrap();
        let replay = test_support::reload(&workflow).await;
        let again = replay
            .messages()
            .of_type::<String>()
            .timeout("reply", Duration::from_millis(30))
            .first()
            .await;
        assert!(matches!(again, Err(FlowError::Failed(ref f)) if f.kind == "timeout"));
    }

    #[tokio::test]
    async fn test_satisfied_chain_removes_pending_timeout() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "cleanup").await;
        let chain = workflow
            .messages()
            .of_type::<String>()
            .timeout("reply", Duration::from_secs(30));

        assert!(matches!(chain.first().await, Err(FlowError::Suspend(_))));
        workflow.messages().append(&"answer".to_string(), None).await.unwrap();

        let replay = test_support::reload(&workflow).await;
        let value = replay
            .messages()
            .of_type::<String>()
            .timeout("reply", Duration::from_secs(30))
            .first()
            .await
            .unwrap();
        assert_eq!(value, "answer");
        assert!(
            ctx.store
                .timeouts()
                .get_timeouts_for(workflow.flow_id())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_merge_and_buffer() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "merge").await;
        let messages = workflow.messages();
        messages.append(&"text".to_string(), None).await.unwrap();
        messages.append(&serde_json::json!(1), None).await.unwrap();
        messages.append(&"more".to_string(), None).await.unwrap();

        let strings = messages.of_type::<String>().take(2);
        let numbers = messages
            .of_type::<serde_json::Value>()
            .map(|v| v.to_string())
            .take(1);
        let merged = strings.merge(numbers).buffer(2).collect().await.unwrap();
        assert_eq!(
            merged,
            vec![
                vec!["text".to_string(), "1".to_string()],
                vec!["more".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_completion_fails_first() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "empty").await;
        let messages = workflow.messages();
        messages.append(&"stop".to_string(), None).await.unwrap();

        let result = messages
            .of_type::<String>()
            .take_until(|s| s == "stop")
            .first()
            .await;
        assert!(matches!(result, Err(FlowError::Failed(ref f)) if f.kind == "no_elements"));
    }
}
