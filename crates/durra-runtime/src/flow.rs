// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed handle for one registered flow type.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use durra_core::{FlowId, FlowType, Status};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec;
use crate::control_panel::ControlPanel;
use crate::error::{FlowFailure, InvocationError};
use crate::invoker::Invoker;
use crate::messages::{MessageType, MessageWriter};

/// Decides what happens to a flow whose body failed.
pub(crate) type FailureHandler = Arc<dyn Fn(&FlowId, &FlowFailure) -> FailureAction + Send + Sync>;

/// Outcome chosen by a failure handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Persist the failure.
    Fail,
    /// Retry at the given time instead.
    Postpone(DateTime<Utc>),
}

/// Per-flow-type options.
#[derive(Clone, Default)]
pub struct FlowOptions {
    pub(crate) on_failure: Option<FailureHandler>,
}

impl FlowOptions {
    /// Install a failure handler. Called for every failure before it is
    /// persisted; returning [`FailureAction::Postpone`] turns it into a retry.
    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn(&FlowId, &FlowFailure) -> FailureAction + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(handler));
        self
    }
}

/// Entry point for invoking and administering instances of one flow type.
pub struct Flow<P, R> {
    invoker: Invoker<P, R>,
}

impl<P, R> Clone for Flow<P, R> {
    fn clone(&self) -> Self {
        Self {
            invoker: self.invoker.clone(),
        }
    }
}

impl<P, R> Flow<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(invoker: Invoker<P, R>) -> Self {
        Self { invoker }
    }

    /// The registered flow type.
    pub fn flow_type(&self) -> &FlowType {
        self.invoker.flow_type()
    }

    /// Create `instance` and run it until it finishes or stops waiting.
    ///
    /// A flow that suspends or postpones is reported as
    /// [`InvocationError::Suspended`] / [`InvocationError::Postponed`]; it keeps
    /// going in the background once woken.
    pub async fn invoke(&self, instance: &str, parameter: P) -> Result<R, InvocationError> {
        let parameter = codec::encode("parameter", &parameter)?;
        self.invoker.invoke(instance, parameter).await
    }

    /// Create `instance` and run it in the background.
    pub async fn schedule(&self, instance: &str, parameter: P) -> Result<FlowId, InvocationError> {
        let parameter = codec::encode("parameter", &parameter)?;
        self.invoker.schedule(instance, parameter).await
    }

    /// Create `instance` postponed until `until`.
    pub async fn schedule_at(
        &self,
        instance: &str,
        parameter: P,
        until: DateTime<Utc>,
    ) -> Result<FlowId, InvocationError> {
        let parameter = codec::encode("parameter", &parameter)?;
        self.invoker.schedule_at(instance, parameter, until).await
    }

    /// Administrative view of `instance`, `None` when it does not exist.
    pub async fn control_panel(&self, instance: &str) -> Result<Option<ControlPanel<P, R>>, InvocationError> {
        let flow_id = self.invoker.flow_id(instance);
        let function = self.invoker.context().store.get_function(&flow_id).await?;
        Ok(function.map(|function| ControlPanel::new(self.invoker.clone(), function)))
    }

    /// Writer for `instance`'s message log.
    pub fn message_writer(&self, instance: &str) -> MessageWriter {
        MessageWriter::new(self.invoker.context().clone(), self.invoker.flow_id(instance))
    }

    /// Append one message to `instance`'s log.
    pub async fn send_message<T: MessageType>(
        &self,
        instance: &str,
        message: &T,
        idempotency_key: Option<&str>,
    ) -> Result<(), InvocationError> {
        self.message_writer(instance)
            .append(message, idempotency_key)
            .await?;
        Ok(())
    }

    /// Instances of this flow type, optionally filtered by status.
    pub async fn instances(&self, status: Option<Status>) -> Result<Vec<FlowId>, InvocationError> {
        let store = &self.invoker.context().store;
        Ok(store.get_instances(self.flow_type(), status).await?)
    }

    /// Instances of this flow type carrying `correlation`.
    pub async fn instances_with_correlation(&self, correlation: &str) -> Result<Vec<FlowId>, InvocationError> {
        let store = &self.invoker.context().store;
        Ok(store
            .correlations()
            .get_flows_with_correlation(Some(self.flow_type()), correlation)
            .await?)
    }
}
