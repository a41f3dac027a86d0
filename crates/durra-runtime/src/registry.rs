// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow registration and process lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use durra_core::{FlowType, FunctionStore};
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::context::{Context, Dispatch};
use crate::error::{FlowResult, RegistryError};
use crate::flow::{Flow, FlowOptions};
use crate::invoker::{Handler, Invoker};
use crate::settings::Settings;
use crate::shutdown::ShutdownCoordinator;
use crate::watchdogs;
use crate::workflow::Workflow;

/// Owns the flow types of one process and the machinery shared by them.
///
/// Registering a flow type starts its watchdogs, so it must happen inside a
/// Tokio runtime. Dropping the registry stops the watchdogs; invocations that
/// are already running finish on their own.
pub struct Registry {
    ctx: Arc<Context>,
}

impl Registry {
    /// Create a registry over `store`.
    pub fn new(store: Arc<dyn FunctionStore>, settings: Settings) -> Self {
        info!(settings = ?settings, "Creating registry");
        Self {
            ctx: Arc::new(Context::new(store, settings)),
        }
    }

    /// The store flows are persisted in.
    pub fn store(&self) -> &Arc<dyn FunctionStore> {
        &self.ctx.store
    }

    /// Effective settings.
    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    /// Graceful-termination handle.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.ctx.shutdown
    }

    /// Registered flow types, sorted.
    pub fn flow_types(&self) -> Vec<FlowType> {
        self.ctx.flow_types()
    }

    /// Register `handler` for `flow_type` with default options.
    pub fn register<P, R, F, Fut>(
        &self,
        flow_type: impl Into<FlowType>,
        handler: F,
    ) -> Result<Flow<P, R>, RegistryError>
    where
        P: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(P, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<R>> + Send + 'static,
    {
        self.register_with(flow_type, handler, FlowOptions::default())
    }

    /// Register `handler` for `flow_type`.
    pub fn register_with<P, R, F, Fut>(
        &self,
        flow_type: impl Into<FlowType>,
        handler: F,
        options: FlowOptions,
    ) -> Result<Flow<P, R>, RegistryError>
    where
        P: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(P, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<R>> + Send + 'static,
    {
        if self.ctx.shutdown.is_shutting_down() {
            return Err(RegistryError::ShuttingDown);
        }

        let flow_type = flow_type.into();
        let handler: Handler<P, R> = Arc::new(move |parameter, workflow| handler(parameter, workflow).boxed());
        let invoker = Invoker::new(flow_type.clone(), handler, options.on_failure, self.ctx.clone());

        let dispatch: Arc<dyn Dispatch> = Arc::new(invoker.clone());
        self.ctx.add_flow(&flow_type, dispatch.clone())?;
        watchdogs::spawn_all(&self.ctx, &flow_type, dispatch);

        info!(flow_type = %flow_type, "Flow type registered");
        Ok(Flow::new(invoker))
    }

    /// Stop accepting work, stop the watchdogs and wait up to `timeout` for
    /// running invocations. Returns `true` when all of them finished.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.ctx.shutdown.shutdown(timeout).await;
        self.ctx.clear_flows();
        drained
    }

    /// Kill everything this registry started, without writing any state.
    ///
    /// Flows that were running stay `Executing` in the store; their leases run
    /// out and the crash watchdog of another registry takes them over.
    pub fn abort(&self) {
        warn!(in_flight = self.ctx.shutdown.in_flight(), "Aborting registry");
        self.ctx.root.cancel();
        self.ctx.abort_tasks();
        self.ctx.clear_flows();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.ctx.shutdown.token().cancel();
        self.ctx.clear_flows();
    }
}
