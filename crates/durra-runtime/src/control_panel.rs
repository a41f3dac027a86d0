// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Administrative handle for one flow instance.
//!
//! A [`ControlPanel`] caches the stored row. Every mutation is guarded by the
//! cached epoch; when the flow moved on in the meantime the call fails with
//! [`ControlPanelError::Stale`] and the panel has to be refreshed.

use chrono::{DateTime, Utc};
use durra_core::{
    EffectId, FlowId, FunctionState, Status, StoredEffect, StoredFunction, StoredMessage,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::codec;
use crate::error::{ControlPanelError, FlowFailure};
use crate::invoker::Invoker;

/// View and controls for one instance.
pub struct ControlPanel<P, R> {
    invoker: Invoker<P, R>,
    function: StoredFunction,
}

impl<P, R> ControlPanel<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(invoker: Invoker<P, R>, function: StoredFunction) -> Self {
        Self { invoker, function }
    }

    /// Instance id.
    pub fn flow_id(&self) -> &FlowId {
        &self.function.flow_id
    }

    /// Cached status.
    pub fn status(&self) -> Status {
        self.function.status
    }

    /// Cached epoch.
    pub fn epoch(&self) -> i32 {
        self.function.epoch
    }

    /// Cached retry time of a postponed instance.
    pub fn postponed_until(&self) -> Option<DateTime<Utc>> {
        self.function.postponed_until
    }

    /// Cached interrupt count.
    pub fn interrupt_count(&self) -> i64 {
        self.function.interrupt_count
    }

    /// Decoded result of a succeeded instance.
    pub fn result(&self) -> Result<Option<R>, ControlPanelError> {
        match &self.function.result {
            Some(bytes) => Ok(Some(codec::decode("result", Some(bytes.as_slice()))?)),
            None => Ok(None),
        }
    }

    /// Failure of a failed instance.
    pub fn failure(&self) -> Option<FlowFailure> {
        self.function.exception.as_ref().map(FlowFailure::from)
    }

    /// Decoded parameter.
    pub fn parameter(&self) -> Result<Option<P>, ControlPanelError> {
        match &self.function.parameter {
            Some(bytes) => Ok(Some(codec::decode("parameter", Some(bytes.as_slice()))?)),
            None => Ok(None),
        }
    }

    /// Stored effects.
    pub async fn effects(&self) -> Result<Vec<StoredEffect>, ControlPanelError> {
        Ok(self
            .invoker
            .context()
            .store
            .effects()
            .get_effect_results(self.flow_id())
            .await?)
    }

    /// The whole message log.
    pub async fn messages(&self) -> Result<Vec<StoredMessage>, ControlPanelError> {
        Ok(self
            .invoker
            .context()
            .store
            .messages()
            .get_messages(self.flow_id(), 0)
            .await?)
    }

    /// Correlation ids.
    pub async fn correlations(&self) -> Result<Vec<String>, ControlPanelError> {
        Ok(self
            .invoker
            .context()
            .store
            .correlations()
            .get_correlations(self.flow_id())
            .await?)
    }

    /// Reload the row.
    pub async fn refresh(&mut self) -> Result<(), ControlPanelError> {
        let flow_id = self.flow_id().clone();
        match self.invoker.context().store.get_function(&flow_id).await? {
            Some(function) => {
                self.function = function;
                Ok(())
            }
            None => Err(ControlPanelError::NotFound(flow_id)),
        }
    }

    /// Re-run the instance in the caller's task from any non-barricaded status.
    pub async fn restart(&mut self) -> Result<R, ControlPanelError> {
        let flow_id = self.flow_id().clone();
        let Some(restarted) = self.invoker.restart(&flow_id, self.epoch()).await? else {
            return Err(ControlPanelError::Stale(flow_id));
        };
        let outcome = self.invoker.run_restarted(flow_id, restarted).await;
        self.refresh().await?;
        Ok(outcome.into_result()?)
    }

    /// Re-run the instance in the background.
    pub async fn schedule_restart(&mut self) -> Result<(), ControlPanelError> {
        let flow_id = self.flow_id().clone();
        let Some(restarted) = self.invoker.restart(&flow_id, self.epoch()).await? else {
            return Err(ControlPanelError::Stale(flow_id));
        };
        self.invoker.spawn_restarted(flow_id, restarted);
        self.refresh().await
    }

    /// Park the instance until `until`.
    pub async fn postpone(&mut self, until: DateTime<Utc>) -> Result<(), ControlPanelError> {
        let state = FunctionState {
            status: Status::Postponed,
            parameter: self.function.parameter.clone(),
            result: None,
            exception: None,
            postponed_until: Some(until),
            timestamp: Utc::now(),
        };
        self.write(state).await
    }

    /// Mark the instance failed with `message`.
    pub async fn fail(&mut self, message: impl Into<String>) -> Result<(), ControlPanelError> {
        let failure = FlowFailure::new("administrative", message);
        let state = FunctionState {
            status: Status::Failed,
            parameter: self.function.parameter.clone(),
            result: None,
            exception: Some((&failure).into()),
            postponed_until: None,
            timestamp: Utc::now(),
        };
        self.write(state).await
    }

    /// Mark the instance succeeded with `result`.
    pub async fn succeed(&mut self, result: &R) -> Result<(), ControlPanelError> {
        let state = FunctionState {
            status: Status::Succeeded,
            parameter: self.function.parameter.clone(),
            result: Some(codec::encode("result", result)?),
            exception: None,
            postponed_until: None,
            timestamp: Utc::now(),
        };
        self.write(state).await
    }

    /// Replace the stored parameter, keeping everything else.
    ///
    /// Refused while the instance is executing or barricaded.
    pub async fn save_parameter(&mut self, parameter: &P) -> Result<(), ControlPanelError> {
        if matches!(self.function.status, Status::Executing | Status::Barricaded) {
            return Err(ControlPanelError::InvalidStatus {
                flow_id: self.flow_id().clone(),
                status: self.function.status,
            });
        }
        let state = FunctionState {
            status: self.function.status,
            parameter: Some(codec::encode("parameter", parameter)?),
            result: self.function.result.clone(),
            exception: self.function.exception.clone(),
            postponed_until: self.function.postponed_until,
            timestamp: Utc::now(),
        };
        self.write(state).await
    }

    /// Forget one memoized effect, so the step runs again on the next run.
    pub async fn clear_effect(&self, effect_id: impl Into<EffectId>) -> Result<(), ControlPanelError> {
        let effect_id = effect_id.into();
        self.invoker
            .context()
            .store
            .effects()
            .delete_effect_result(self.flow_id(), &effect_id)
            .await?;
        Ok(())
    }

    /// Delete the instance and everything it owns.
    pub async fn delete(self) -> Result<bool, ControlPanelError> {
        let deleted = self
            .invoker
            .context()
            .store
            .delete_function(self.flow_id())
            .await?;
        if deleted {
            info!(flow_id = %self.flow_id(), "Flow deleted");
        }
        Ok(deleted)
    }

    /// Stop the instance for good. Rejected while it is executing.
    pub async fn barricade(&mut self) -> Result<bool, ControlPanelError> {
        let barricaded = self
            .invoker
            .context()
            .store
            .barricade_function(self.flow_id())
            .await?;
        if barricaded {
            info!(flow_id = %self.flow_id(), "Flow barricaded");
            self.refresh().await?;
        }
        Ok(barricaded)
    }

    async fn write(&mut self, state: FunctionState) -> Result<(), ControlPanelError> {
        let flow_id = self.flow_id().clone();
        let written = self
            .invoker
            .context()
            .store
            .set_function_state(&flow_id, &state, self.epoch())
            .await?;
        if !written {
            return Err(ControlPanelError::Stale(flow_id));
        }
        info!(flow_id = %flow_id, status = %state.status, "Flow state changed from control panel");
        self.refresh().await
    }
}
