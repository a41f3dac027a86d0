// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime error types.
//!
//! [`FlowError`] is what flow code returns; most variants are control flow
//! rather than failures and are converted into status transitions by the
//! engine. [`InvocationError`] and [`ControlPanelError`] are what callers of
//! the public surfaces see.

use std::fmt;

use chrono::{DateTime, Utc};
use durra_core::{CoreError, FlowId, Status, StoredException};
use thiserror::Error;

/// Result type of flow bodies and of everything they call on the workflow context.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// Why a flow stopped without a value.
#[derive(Debug)]
pub enum FlowError {
    /// Waiting on a message, timeout or semaphore that is not there yet.
    Suspend(SuspendHint),
    /// Retry at the given time.
    Postpone(DateTime<Utc>),
    /// Business failure; persisted as `Failed` unless a failure handler postpones it.
    Failed(FlowFailure),
    /// Another executor holds the flow now; nothing more may be written.
    Superseded,
    /// Store failure; the flow is left `Executing` for the crash watchdog.
    Store(CoreError),
}

impl FlowError {
    /// A failure with the generic `error` type.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Failed(FlowFailure::new("error", message))
    }

    /// Postpone for `delay` from now.
    pub fn postpone_for(delay: std::time::Duration) -> Self {
        Self::Postpone(crate::time::from_now(delay))
    }

    /// A value the flow produced or asked for could not be (de)serialized.
    /// Retrying cannot fix that, so it fails the flow instead of leaving it to
    /// the crash watchdog.
    pub(crate) fn serialization(err: CoreError) -> Self {
        Self::Failed(FlowFailure::new("serialization", err.to_string()))
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suspend(hint) => write!(f, "suspended ({})", hint.reason),
            Self::Postpone(until) => write!(f, "postponed until {}", until),
            Self::Failed(failure) => write!(f, "{}", failure),
            Self::Superseded => write!(f, "superseded by another executor"),
            Self::Store(err) => write!(f, "store error: {}", err),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(FlowFailure::from(err))
    }
}

impl From<CoreError> for FlowError {
    fn from(err: CoreError) -> Self {
        Self::Store(err)
    }
}

impl From<FlowFailure> for FlowError {
    fn from(failure: FlowFailure) -> Self {
        Self::Failed(failure)
    }
}

/// Carried by a suspend so the engine can guard the `Suspended` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendHint {
    /// Interrupt count read before the last look at the store.
    pub interrupt_count: i64,
    /// What the flow is waiting for, for logs.
    pub reason: String,
}

impl SuspendHint {
    /// Create a hint.
    pub fn new(interrupt_count: i64, reason: impl Into<String>) -> Self {
        Self {
            interrupt_count,
            reason: reason.into(),
        }
    }
}

/// A failure raised by flow code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowFailure {
    /// Failure kind (`error`, `panic`, `timeout`, ...).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Cause chain, when there is one.
    pub details: Option<String>,
}

impl FlowFailure {
    /// Create a failure without details.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }
}

impl fmt::Display for FlowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<anyhow::Error> for FlowFailure {
    fn from(err: anyhow::Error) -> Self {
        let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        Self {
            kind: "error".to_string(),
            message: err.to_string(),
            details: (!causes.is_empty()).then(|| causes.join("\ncaused by: ")),
        }
    }
}

impl From<&StoredException> for FlowFailure {
    fn from(exception: &StoredException) -> Self {
        Self {
            kind: exception.exception_type.clone(),
            message: exception.message.clone(),
            details: exception.stack_trace.clone(),
        }
    }
}

impl From<&FlowFailure> for StoredException {
    fn from(failure: &FlowFailure) -> Self {
        Self {
            exception_type: failure.kind.clone(),
            message: failure.message.clone(),
            stack_trace: failure.details.clone(),
        }
    }
}

/// Errors returned by [`crate::Flow`] invocation surfaces.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The flow failed.
    #[error("flow failed: {0}")]
    Failed(FlowFailure),

    /// The flow postponed itself; the postponed watchdog will pick it up.
    #[error("flow postponed until {0}")]
    Postponed(DateTime<Utc>),

    /// The flow is waiting for an external event.
    #[error("flow suspended")]
    Suspended,

    /// An instance with this id already exists.
    #[error("flow '{0}' already exists")]
    AlreadyExists(FlowId),

    /// No instance with this id exists.
    #[error("flow '{0}' not found")]
    NotFound(FlowId),

    /// Another executor took over while this one was running.
    #[error("flow was superseded by another executor")]
    Superseded,

    /// The execution was dropped without writing state (registry aborted).
    #[error("flow execution was aborted")]
    Aborted,

    /// The registry is shutting down and accepts no new work.
    #[error("registry is shutting down")]
    ShuttingDown,

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] CoreError),
}

/// Errors returned by [`crate::ControlPanel`].
#[derive(Debug, Error)]
pub enum ControlPanelError {
    /// The cached epoch is stale; call `refresh` and retry.
    #[error("control panel for '{0}' is stale")]
    Stale(FlowId),

    /// The instance no longer exists.
    #[error("flow '{0}' not found")]
    NotFound(FlowId),

    /// The instance's status does not allow the change, e.g. it is executing.
    #[error("flow '{flow_id}' is {status} and cannot be changed")]
    InvalidStatus {
        /// The instance.
        flow_id: FlowId,
        /// Its cached status.
        status: Status,
    },

    /// The re-invocation itself did not succeed.
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] CoreError),
}

/// Errors returned when registering flows.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The flow type has a handler already.
    #[error("flow type '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The registry is shutting down.
    #[error("registry is shutting down")]
    ShuttingDown,
}
