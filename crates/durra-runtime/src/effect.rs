// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Memoized steps.
//!
//! A captured step runs at most once to completion per flow instance: its
//! value (or its [`FlowError::Failed`] failure) is persisted under the effect
//! id and replayed on every later run. A step that was started but never
//! completed runs again.

use std::future::Future;

use durra_core::{EffectId, StoredEffect, WorkStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::codec;
use crate::error::{FlowError, FlowFailure, FlowResult};
use crate::workflow::Workflow;

/// Effect API of one flow run.
#[derive(Clone)]
pub struct Effect {
    workflow: Workflow,
}

impl Effect {
    pub(crate) fn new(workflow: Workflow) -> Self {
        Self { workflow }
    }

    /// Run `work` once and memoize its outcome under `id`.
    ///
    /// Only [`FlowError::Failed`] is memoized as a failure. Suspends,
    /// postpones and store errors propagate and leave the step unfinished, so
    /// it runs again on the next attempt.
    #[instrument(skip_all, fields(flow_id = %self.workflow.flow_id()))]
    pub async fn capture<T, F, Fut>(&self, id: impl Into<EffectId>, work: F) -> FlowResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlowResult<T>>,
    {
        let id = id.into();
        if let Some(stored) = self.workflow.cached_effect(&id)
            && stored.work_status == WorkStatus::Completed
        {
            debug!(effect_id = %id, "Replaying completed effect");
            return replay(&stored);
        }

        self.write(StoredEffect::started(id.clone())).await?;

        match work().await {
            Ok(value) => {
                let bytes = codec::encode(id.as_str(), &value).map_err(FlowError::serialization)?;
                self.write(StoredEffect::completed(id, Some(bytes))).await?;
                Ok(value)
            }
            Err(FlowError::Failed(failure)) => {
                debug!(effect_id = %id, kind = %failure.kind, "Memoizing failed effect");
                self.write(StoredEffect::failed(id, (&failure).into())).await?;
                Err(FlowError::Failed(failure))
            }
            Err(other) => Err(other),
        }
    }

    /// The memoized value of `id`, if the step completed.
    ///
    /// A memoized failure is returned as the error it was.
    pub fn get<T: DeserializeOwned>(&self, id: impl Into<EffectId>) -> FlowResult<Option<T>> {
        match self.workflow.cached_effect(&id.into()) {
            Some(stored) if stored.work_status == WorkStatus::Completed => replay(&stored).map(Some),
            _ => Ok(None),
        }
    }

    /// Store `value` as the completed result of `id`, replacing what was there.
    pub async fn upsert<T: Serialize>(&self, id: impl Into<EffectId>, value: &T) -> FlowResult<()> {
        let id = id.into();
        let bytes = codec::encode(id.as_str(), value).map_err(FlowError::serialization)?;
        self.write(StoredEffect::completed(id, Some(bytes))).await
    }

    /// Whether `id` has completed.
    pub fn contains(&self, id: impl Into<EffectId>) -> bool {
        self.workflow
            .cached_effect(&id.into())
            .is_some_and(|stored| stored.work_status == WorkStatus::Completed)
    }

    /// Forget `id`, so the step runs again when next captured.
    pub async fn clear(&self, id: impl Into<EffectId>) -> FlowResult<()> {
        let id = id.into();
        self.workflow.ensure_current()?;
        self.workflow
            .store()
            .effects()
            .delete_effect_result(self.workflow.flow_id(), &id)
            .await?;
        self.workflow.forget_effect(&id);
        Ok(())
    }

    async fn write(&self, effect: StoredEffect) -> FlowResult<()> {
        self.workflow.ensure_current()?;
        self.workflow
            .store()
            .effects()
            .set_effect_result(self.workflow.flow_id(), &effect)
            .await?;
        self.workflow.cache_effect(effect);
        Ok(())
    }
}

fn replay<T: DeserializeOwned>(stored: &StoredEffect) -> FlowResult<T> {
    if let Some(exception) = &stored.exception {
        return Err(FlowError::Failed(FlowFailure::from(exception)));
    }
    codec::decode(stored.effect_id.as_str(), stored.result.as_deref()).map_err(FlowError::serialization)
}
