// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation engine for durra.
//!
//! A flow is an async function whose progress survives process crashes. The
//! engine persists every invocation through a [`durra_core::FunctionStore`]
//! and makes sure exactly one executor owns it at a time:
//!
//! - **Leasing** - the owner holds an epoch and renews a lease; every write
//!   is a compare-and-swap on that epoch.
//! - **Watchdogs** - lapsed leases, due postponements and expired timeouts are
//!   picked up by background loops in any process sharing the store.
//! - **Effects** - side-effecting steps are memoized, so a replay skips them.
//! - **Messages** - each instance has an append-only log; flows wait on it
//!   through reactive [`Chain`]s and suspend when nothing has arrived yet.
//! - **Semaphores** - persisted FIFO counting semaphores shared across flows.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use durra_core::InMemoryStore;
//! use durra_runtime::{FlowError, FlowResult, Registry, Settings, Workflow};
//!
//! async fn greet(name: String, workflow: Workflow) -> FlowResult<String> {
//!     workflow
//!         .effect()
//!         .capture("greeting", || async move { Ok::<_, FlowError>(format!("hello {}", name)) })
//!         .await
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Registry::new(Arc::new(InMemoryStore::new()), Settings::default());
//! let greet = registry.register("greet", greet)?;
//!
//! let greeting: String = greet.invoke("greet-1", "world".to_string()).await?;
//! assert_eq!(greeting, "hello world");
//!
//! registry.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

mod codec;
mod context;
mod control_panel;
mod effect;
mod error;
mod flow;
mod invoker;
mod lease;
mod messages;
pub mod reactive;
mod registry;
mod semaphore;
mod settings;
mod shutdown;
mod time;
mod watchdogs;
mod workflow;

#[cfg(test)]
mod test_support;

pub use control_panel::ControlPanel;
pub use effect::Effect;
pub use error::{
    ControlPanelError, FlowError, FlowFailure, FlowResult, InvocationError, RegistryError,
    SuspendHint,
};
pub use flow::{FailureAction, Flow, FlowOptions};
pub use messages::{MessageType, MessageWriter, Messages, Subscription, TimeoutEvent};
pub use reactive::{Chain, Emission, Item};
pub use registry::Registry;
pub use semaphore::{DistributedSemaphore, SemaphoreLock};
pub use settings::{Settings, UnhandledFailureHandler};
pub use shutdown::{InFlightGuard, ShutdownCoordinator};
pub use workflow::{Correlations, Workflow};
