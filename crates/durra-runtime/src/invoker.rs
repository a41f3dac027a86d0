// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runs one flow type.
//!
//! The invoker owns the lifecycle of a single execution: it starts the lease
//! renewer, binds a [`Workflow`], runs the user handler on its own task and
//! turns the outcome into exactly one compare-and-swap state write. When a
//! suspend is rejected because an interrupt arrived while the flow was
//! deciding to wait, the flow is replayed in place at the same epoch.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durra_core::{CoreError, FlowId, FlowType, FunctionState, Status};
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::context::{Context, Dispatch};
use crate::error::{FlowError, FlowFailure, FlowResult, InvocationError};
use crate::flow::{FailureAction, FailureHandler};
use crate::lease::Lease;
use crate::semaphore::{self, HeldSemaphore};
use crate::shutdown::InFlightGuard;
use crate::time;
use crate::workflow::Workflow;

pub(crate) type Handler<P, R> = Arc<dyn Fn(P, Workflow) -> BoxFuture<'static, FlowResult<R>> + Send + Sync>;

/// How one execution ended.
#[derive(Debug)]
pub(crate) enum Outcome<R> {
    Succeeded(R),
    Failed(FlowFailure),
    Postponed(DateTime<Utc>),
    Suspended,
    /// Another executor owns the flow; nothing was written.
    Superseded,
    /// The registry was aborted mid-run; nothing was written.
    Aborted,
    /// A store call failed; the row is left for the crash watchdog.
    Abandoned(CoreError),
}

impl<R> Outcome<R> {
    pub(crate) fn into_result(self) -> Result<R, InvocationError> {
        match self {
            Self::Succeeded(value) => Ok(value),
            Self::Failed(failure) => Err(InvocationError::Failed(failure)),
            Self::Postponed(until) => Err(InvocationError::Postponed(until)),
            Self::Suspended => Err(InvocationError::Suspended),
            Self::Superseded => Err(InvocationError::Superseded),
            Self::Aborted => Err(InvocationError::Aborted),
            Self::Abandoned(e) => Err(InvocationError::Store(e)),
        }
    }
}

/// Executes instances of one flow type.
pub(crate) struct Invoker<P, R> {
    flow_type: FlowType,
    handler: Handler<P, R>,
    on_failure: Option<FailureHandler>,
    ctx: Arc<Context>,
    _types: PhantomData<fn(P) -> R>,
}

impl<P, R> Clone for Invoker<P, R> {
    fn clone(&self) -> Self {
        Self {
            flow_type: self.flow_type.clone(),
            handler: self.handler.clone(),
            on_failure: self.on_failure.clone(),
            ctx: self.ctx.clone(),
            _types: PhantomData,
        }
    }
}

impl<P, R> Invoker<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        flow_type: FlowType,
        handler: Handler<P, R>,
        on_failure: Option<FailureHandler>,
        ctx: Arc<Context>,
    ) -> Self {
        Self {
            flow_type,
            handler,
            on_failure,
            ctx,
            _types: PhantomData,
        }
    }

    pub(crate) fn flow_type(&self) -> &FlowType {
        &self.flow_type
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub(crate) fn flow_id(&self, instance: &str) -> FlowId {
        FlowId::new(self.flow_type.clone(), instance)
    }

    /// Create the instance and run it to its first stop in the caller's task.
    ///
    /// Parameters arrive encoded so callers never hold a `&P` across an await.
    pub(crate) async fn invoke(&self, instance: &str, parameter: Vec<u8>) -> Result<R, InvocationError> {
        let guard = self.enter()?;
        let flow_id = self.flow_id(instance);
        let lease = time::from_now(self.ctx.settings.lease_length);

        if !self
            .ctx
            .store
            .create_function(&flow_id, Some(&parameter), lease, None, Utc::now())
            .await?
        {
            return Err(InvocationError::AlreadyExists(flow_id));
        }
        info!(flow_id = %flow_id, "Flow invoked");

        self.execute(flow_id, Some(parameter), 0, lease, guard)
            .await
            .into_result()
    }

    /// Create the instance and run it in the background.
    pub(crate) async fn schedule(&self, instance: &str, parameter: Vec<u8>) -> Result<FlowId, InvocationError> {
        let guard = self.enter()?;
        let flow_id = self.flow_id(instance);
        let lease = time::from_now(self.ctx.settings.lease_length);

        if !self
            .ctx
            .store
            .create_function(&flow_id, Some(&parameter), lease, None, Utc::now())
            .await?
        {
            return Err(InvocationError::AlreadyExists(flow_id));
        }
        info!(flow_id = %flow_id, "Flow scheduled");

        self.spawn_execution(flow_id.clone(), Some(parameter), 0, lease, guard, None);
        Ok(flow_id)
    }

    /// Create the instance postponed until `until`; the postponed watchdog starts it.
    pub(crate) async fn schedule_at(
        &self,
        instance: &str,
        parameter: Vec<u8>,
        until: DateTime<Utc>,
    ) -> Result<FlowId, InvocationError> {
        let _guard = self.enter()?;
        let flow_id = self.flow_id(instance);

        if !self
            .ctx
            .store
            .create_function(&flow_id, Some(&parameter), Utc::now(), Some(until), Utc::now())
            .await?
        {
            return Err(InvocationError::AlreadyExists(flow_id));
        }
        info!(flow_id = %flow_id, until = %until, "Flow scheduled for later");
        Ok(flow_id)
    }

    /// Force the instance back to `Executing` at `expected_epoch + 1`.
    ///
    /// Returns the new epoch and the stored parameter, or `None` when the
    /// epoch moved on.
    pub(crate) async fn restart(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
    ) -> Result<Option<Restarted>, InvocationError> {
        let guard = self.enter()?;
        let lease = time::from_now(self.ctx.settings.lease_length);
        let Some(function) = self
            .ctx
            .store
            .restart_execution(flow_id, expected_epoch, lease)
            .await?
        else {
            return Ok(None);
        };
        info!(flow_id = %flow_id, epoch = function.epoch, "Flow restarted");

        Ok(Some(Restarted {
            epoch: function.epoch,
            parameter: function.parameter,
            lease,
            guard,
        }))
    }

    pub(crate) async fn run_restarted(&self, flow_id: FlowId, restarted: Restarted) -> Outcome<R> {
        self.execute(
            flow_id,
            restarted.parameter,
            restarted.epoch,
            restarted.lease,
            restarted.guard,
        )
        .await
    }

    pub(crate) fn spawn_restarted(&self, flow_id: FlowId, restarted: Restarted) {
        self.spawn_execution(
            flow_id,
            restarted.parameter,
            restarted.epoch,
            restarted.lease,
            restarted.guard,
            None,
        );
    }

    fn enter(&self) -> Result<InFlightGuard, InvocationError> {
        self.ctx.shutdown.enter().ok_or(InvocationError::ShuttingDown)
    }

    fn spawn_execution(
        &self,
        flow_id: FlowId,
        parameter: Option<Vec<u8>>,
        epoch: i32,
        lease: DateTime<Utc>,
        guard: InFlightGuard,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let invoker = self.clone();
        self.ctx.spawn(async move {
            let _permit = permit;
            invoker.execute(flow_id, parameter, epoch, lease, guard).await;
        });
    }

    /// Run the flow at `epoch` until it stops, then persist how it stopped.
    async fn execute(
        &self,
        flow_id: FlowId,
        parameter: Option<Vec<u8>>,
        epoch: i32,
        lease_expiration: DateTime<Utc>,
        _guard: InFlightGuard,
    ) -> Outcome<R> {
        let mut lease = Lease::start(
            self.ctx.store.clone(),
            flow_id.clone(),
            epoch,
            lease_expiration,
            self.ctx.settings.lease_length,
            &self.ctx.root,
        );
        let mut held: Vec<HeldSemaphore> = Vec::new();

        loop {
            let input: P = match codec::decode("parameter", parameter.as_deref()) {
                Ok(input) => input,
                Err(e) => {
                    lease.stop();
                    let failure = FlowFailure::new("serialization", e.to_string());
                    return self.persist_failure(&flow_id, &parameter, epoch, failure, &held).await;
                }
            };

            let workflow = match Workflow::load(
                flow_id.clone(),
                epoch,
                self.ctx.clone(),
                lease.state(),
                held,
            )
            .await
            {
                Ok(workflow) => workflow,
                Err(e) => {
                    error!(flow_id = %flow_id, epoch, error = %e, "Failed to load effects");
                    return Outcome::Abandoned(e);
                }
            };

            debug!(flow_id = %flow_id, epoch, "Running flow");
            let result = self.run_handler(input, workflow.clone()).await;
            held = workflow.held();

            let Some(result) = result else {
                debug!(flow_id = %flow_id, epoch, "Flow task aborted");
                return Outcome::Aborted;
            };

            if lease.state().is_superseded() && !matches!(result, Err(FlowError::Store(_))) {
                warn!(flow_id = %flow_id, epoch, "Flow was superseded, dropping its outcome");
                return Outcome::Superseded;
            }

            match result {
                Ok(value) => {
                    lease.stop();
                    return self.persist_success(&flow_id, &parameter, epoch, value, &held).await;
                }
                Err(FlowError::Failed(failure)) => {
                    lease.stop();
                    return self.persist_failure(&flow_id, &parameter, epoch, failure, &held).await;
                }
                Err(FlowError::Postpone(until)) => {
                    lease.stop();
                    return self.persist_postponed(&flow_id, &parameter, epoch, until).await;
                }
                Err(FlowError::Superseded) => {
                    warn!(flow_id = %flow_id, epoch, "Flow was superseded");
                    return Outcome::Superseded;
                }
                Err(FlowError::Store(e)) => {
                    error!(
                        flow_id = %flow_id,
                        epoch,
                        error = %e,
                        "Store failed while the flow was running, leaving it for the crash watchdog"
                    );
                    return Outcome::Abandoned(e);
                }
                Err(FlowError::Suspend(hint)) => {
                    lease.stop();
                    let suspended = self
                        .ctx
                        .store
                        .suspend_function(&flow_id, hint.interrupt_count, Utc::now(), epoch)
                        .await;
                    match suspended {
                        Ok(true) => {
                            info!(flow_id = %flow_id, epoch, reason = %hint.reason, "Flow suspended");
                            return Outcome::Suspended;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!(flow_id = %flow_id, epoch, error = %e, "Failed to suspend flow");
                            return Outcome::Abandoned(e);
                        }
                    }

                    // Rejected: either an interrupt arrived or the flow was taken over.
                    match self.reclaim(&flow_id, epoch).await {
                        Ok(Some(renewed)) => {
                            debug!(flow_id = %flow_id, epoch, "Interrupted while suspending, replaying");
                            lease = Lease::start(
                                self.ctx.store.clone(),
                                flow_id.clone(),
                                epoch,
                                renewed,
                                self.ctx.settings.lease_length,
                                &self.ctx.root,
                            );
                        }
                        Ok(None) => {
                            warn!(flow_id = %flow_id, epoch, "Suspend rejected, flow was taken over");
                            return Outcome::Superseded;
                        }
                        Err(e) => return Outcome::Abandoned(e),
                    }
                }
            }
        }
    }

    /// After a rejected suspend: renew the lease if the epoch is still ours.
    async fn reclaim(&self, flow_id: &FlowId, epoch: i32) -> Result<Option<DateTime<Utc>>, CoreError> {
        let Some(function) = self.ctx.store.get_function(flow_id).await? else {
            return Ok(None);
        };
        if function.epoch != epoch || function.status != Status::Executing {
            return Ok(None);
        }
        let renewed = time::from_now(self.ctx.settings.lease_length);
        if self.ctx.store.renew_lease(flow_id, epoch, renewed).await? {
            Ok(Some(renewed))
        } else {
            Ok(None)
        }
    }

    /// Run the handler on its own task so panics and aborts are contained.
    async fn run_handler(&self, input: P, workflow: Workflow) -> Option<FlowResult<R>> {
        let task = self.ctx.spawn((self.handler)(input, workflow));
        match task.await {
            Ok(result) => Some(result),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                Some(Err(FlowError::Failed(FlowFailure::new("panic", message))))
            }
            Err(_) => None,
        }
    }

    async fn persist_success(
        &self,
        flow_id: &FlowId,
        parameter: &Option<Vec<u8>>,
        epoch: i32,
        value: R,
        held: &[HeldSemaphore],
    ) -> Outcome<R> {
        let result = match codec::encode("result", &value) {
            Ok(result) => result,
            Err(e) => {
                let failure = FlowFailure::new("serialization", e.to_string());
                return self.persist_failure(flow_id, parameter, epoch, failure, held).await;
            }
        };
        let state = FunctionState {
            status: Status::Succeeded,
            parameter: parameter.clone(),
            result: Some(result),
            exception: None,
            postponed_until: None,
            timestamp: Utc::now(),
        };
        match self.write_state(flow_id, &state, epoch).await {
            Ok(true) => {
                info!(flow_id = %flow_id, epoch, "Flow succeeded");
                self.finish(flow_id, held).await;
                Outcome::Succeeded(value)
            }
            Ok(false) => Outcome::Superseded,
            Err(e) => Outcome::Abandoned(e),
        }
    }

    async fn persist_failure(
        &self,
        flow_id: &FlowId,
        parameter: &Option<Vec<u8>>,
        epoch: i32,
        failure: FlowFailure,
        held: &[HeldSemaphore],
    ) -> Outcome<R> {
        let action = match &self.on_failure {
            Some(handler) => handler(flow_id, &failure),
            None => FailureAction::Fail,
        };
        if let FailureAction::Postpone(until) = action {
            info!(flow_id = %flow_id, epoch, failure = %failure, until = %until, "Failure handler postponed flow");
            return self.persist_postponed(flow_id, parameter, epoch, until).await;
        }

        let state = FunctionState {
            status: Status::Failed,
            parameter: parameter.clone(),
            result: None,
            exception: Some((&failure).into()),
            postponed_until: None,
            timestamp: Utc::now(),
        };
        match self.write_state(flow_id, &state, epoch).await {
            Ok(true) => {
                warn!(flow_id = %flow_id, epoch, failure = %failure, "Flow failed");
                if let Some(callback) = &self.ctx.settings.unhandled_failure {
                    callback(flow_id, &failure);
                }
                self.finish(flow_id, held).await;
                Outcome::Failed(failure)
            }
            Ok(false) => Outcome::Superseded,
            Err(e) => Outcome::Abandoned(e),
        }
    }

    async fn persist_postponed(
        &self,
        flow_id: &FlowId,
        parameter: &Option<Vec<u8>>,
        epoch: i32,
        until: DateTime<Utc>,
    ) -> Outcome<R> {
        let state = FunctionState {
            status: Status::Postponed,
            parameter: parameter.clone(),
            result: None,
            exception: None,
            postponed_until: Some(until),
            timestamp: Utc::now(),
        };
        match self.write_state(flow_id, &state, epoch).await {
            Ok(true) => {
                info!(flow_id = %flow_id, epoch, until = %until, "Flow postponed");
                Outcome::Postponed(until)
            }
            Ok(false) => Outcome::Superseded,
            Err(e) => Outcome::Abandoned(e),
        }
    }

    async fn write_state(&self, flow_id: &FlowId, state: &FunctionState, epoch: i32) -> Result<bool, CoreError> {
        let written = self.ctx.store.set_function_state(flow_id, state, epoch).await;
        match &written {
            Ok(false) => {
                warn!(flow_id = %flow_id, epoch, status = %state.status, "State write rejected, flow was taken over");
            }
            Err(e) => {
                error!(flow_id = %flow_id, epoch, status = %state.status, error = %e, "Failed to persist flow state");
            }
            Ok(true) => {}
        }
        written
    }

    /// Give back what a finished flow was holding.
    async fn finish(&self, flow_id: &FlowId, held: &[HeldSemaphore]) {
        for key in held {
            if let Err(e) = semaphore::release(&self.ctx, key, flow_id).await {
                warn!(flow_id = %flow_id, group = %key.group, error = %e, "Failed to release semaphore");
            }
        }
        if let Err(e) = self.ctx.store.timeouts().remove(flow_id).await {
            warn!(flow_id = %flow_id, error = %e, "Failed to remove timeouts");
        }
    }
}

/// Leadership and parameter of a restarted instance, ready to run.
pub(crate) struct Restarted {
    epoch: i32,
    parameter: Option<Vec<u8>>,
    lease: DateTime<Utc>,
    guard: InFlightGuard,
}

#[async_trait]
impl<P, R> Dispatch for Invoker<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    async fn resume(
        &self,
        flow_id: FlowId,
        expected_epoch: i32,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<bool, CoreError> {
        let Some(guard) = self.ctx.shutdown.enter() else {
            debug!(flow_id = %flow_id, "Shutting down, not resuming");
            return Ok(false);
        };

        let epoch = expected_epoch + 1;
        let lease = time::from_now(self.ctx.settings.lease_length);
        if !self
            .ctx
            .store
            .try_to_become_leader(&flow_id, expected_epoch, epoch, lease)
            .await?
        {
            debug!(flow_id = %flow_id, expected_epoch, "Lost leadership race");
            return Ok(false);
        }

        let Some(function) = self.ctx.store.get_function(&flow_id).await? else {
            return Ok(false);
        };
        info!(flow_id = %flow_id, epoch, "Resuming flow");

        self.spawn_execution(flow_id, function.parameter, epoch, lease, guard, permit);
        Ok(true)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "flow panicked".to_string()
    }
}
