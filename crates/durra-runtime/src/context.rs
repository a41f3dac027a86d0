// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State shared by everything registered on one registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use durra_core::{CoreError, FlowId, FlowType, FunctionStatus, FunctionStore, Status};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::settings::Settings;
use crate::shutdown::ShutdownCoordinator;

/// Type-erased entry point for re-dispatching a flow instance.
///
/// Watchdogs and cross-flow wake-ups only know a [`FlowId`]; the typed
/// invoker behind this trait decodes the parameter itself.
#[async_trait]
pub(crate) trait Dispatch: Send + Sync {
    /// Take over `flow_id` at `expected_epoch` and run it in the background.
    ///
    /// Returns `false` when another executor won the epoch or the registry is
    /// shutting down. The permit, when given, is held until the run finishes.
    async fn resume(
        &self,
        flow_id: FlowId,
        expected_epoch: i32,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<bool, CoreError>;
}

pub(crate) struct Context {
    pub(crate) store: Arc<dyn FunctionStore>,
    pub(crate) settings: Settings,
    pub(crate) shutdown: ShutdownCoordinator,
    /// Parent of every lease renewer and watchdog. Cancelled only by abort.
    pub(crate) root: CancellationToken,
    pub(crate) dispatch_permits: Arc<Semaphore>,
    flows: Mutex<HashMap<FlowType, Arc<dyn Dispatch>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Context {
    pub(crate) fn new(store: Arc<dyn FunctionStore>, settings: Settings) -> Self {
        let root = CancellationToken::new();
        let permits = settings.max_concurrent_dispatches.max(1);
        Self {
            store,
            shutdown: ShutdownCoordinator::with_token(root.child_token()),
            root,
            dispatch_permits: Arc::new(Semaphore::new(permits)),
            settings,
            flows: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_flow(
        &self,
        flow_type: &FlowType,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<(), RegistryError> {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        if flows.contains_key(flow_type) {
            return Err(RegistryError::AlreadyRegistered(flow_type.to_string()));
        }
        flows.insert(flow_type.clone(), dispatch);
        Ok(())
    }

    pub(crate) fn dispatcher(&self, flow_type: &FlowType) -> Option<Arc<dyn Dispatch>> {
        let flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        flows.get(flow_type).cloned()
    }

    pub(crate) fn flow_types(&self) -> Vec<FlowType> {
        let flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<_> = flows.keys().cloned().collect();
        types.sort();
        types
    }

    /// Drop every dispatcher. Invokers hold the context, so this also breaks
    /// the reference cycle between them.
    pub(crate) fn clear_flows(&self) {
        self.flows.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Spawn a task that `abort_tasks` can kill.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }

    pub(crate) fn abort_tasks(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        debug!(tasks = tasks.len(), "Aborting in-flight tasks");
        for task in tasks {
            task.abort();
        }
    }

    /// Re-dispatch the owner of a message if the append found it suspended.
    ///
    /// The append already flipped the row to `Postponed` at the same epoch, so
    /// the observed epoch is the one to take over from.
    pub(crate) async fn wake(
        &self,
        flow_id: &FlowId,
        observed: Option<FunctionStatus>,
    ) -> Result<(), CoreError> {
        let Some(observed) = observed else {
            return Ok(());
        };
        if observed.status != Status::Suspended {
            return Ok(());
        }

        match self.dispatcher(&flow_id.flow_type) {
            Some(dispatch) => {
                let resumed = dispatch.resume(flow_id.clone(), observed.epoch, None).await?;
                debug!(flow_id = %flow_id, epoch = observed.epoch, resumed, "Woke suspended flow");
            }
            None => {
                debug!(
                    flow_id = %flow_id,
                    "No local handler for flow type, leaving it to the postponed watchdog"
                );
            }
        }
        Ok(())
    }

    /// Interrupt the given flows and re-dispatch the ones that became due.
    pub(crate) async fn wake_all(&self, flow_ids: &[FlowId]) -> Result<(), CoreError> {
        if flow_ids.is_empty() {
            return Ok(());
        }
        self.store.interrupt(flow_ids).await?;

        let now = Utc::now();
        for flow_id in flow_ids {
            let Some(function) = self.store.get_function(flow_id).await? else {
                continue;
            };
            let due = function.status == Status::Postponed
                && function.postponed_until.is_some_and(|until| until <= now);
            if !due {
                continue;
            }
            if let Some(dispatch) = self.dispatcher(&flow_id.flow_type)
                && let Err(e) = dispatch.resume(flow_id.clone(), function.epoch, None).await
            {
                warn!(flow_id = %flow_id, error = %e, "Failed to re-dispatch interrupted flow");
            }
        }
        Ok(())
    }
}
