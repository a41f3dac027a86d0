// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by the store contract and the runtime.
//!
//! Every record here is what a store backend persists. Payloads (parameters,
//! results, effect values, message content) are opaque serialized bytes; the
//! runtime decides the encoding.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Name of a registered flow kind (e.g. `"order-fulfilment"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowType(String);

impl FlowType {
    /// Create a flow type from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FlowType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of one durable invocation: flow type plus instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId {
    /// The registered flow kind.
    pub flow_type: FlowType,
    /// Caller-chosen instance name, unique within the flow type.
    pub instance: String,
}

impl FlowId {
    /// Build a flow id.
    pub fn new(flow_type: impl Into<FlowType>, instance: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_type, self.instance)
    }
}

/// Lifecycle status of a stored function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Owned by the holder of the current epoch and running.
    Executing,
    /// Finished with a result.
    Succeeded,
    /// Finished with an unhandled failure.
    Failed,
    /// Parked until `postponed_until`.
    Postponed,
    /// Parked until an external event (message, timeout, semaphore) interrupts it.
    Suspended,
    /// Administratively stopped; never eligible for leadership again.
    Barricaded,
}

impl Status {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Postponed => "postponed",
            Self::Suspended => "suspended",
            Self::Barricaded => "barricaded",
        }
    }

    /// Whether the status ends execution until an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Barricaded)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "executing" => Ok(Self::Executing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "postponed" => Ok(Self::Postponed),
            "suspended" => Ok(Self::Suspended),
            "barricaded" => Ok(Self::Barricaded),
            other => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown status '{}'", other),
            }),
        }
    }
}

/// A failure captured from user code, persisted with the function or an effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredException {
    /// Failure kind (error type name, `"panic"`, ...).
    pub exception_type: String,
    /// Human-readable message.
    pub message: String,
    /// Optional source chain or backtrace.
    pub stack_trace: Option<String>,
}

impl StoredException {
    /// Create a stored exception without a stack trace.
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }
}

/// The persisted invocation record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFunction {
    /// Primary key.
    pub flow_id: FlowId,
    /// Serialized parameter.
    pub parameter: Option<Vec<u8>>,
    /// Serialized result once succeeded.
    pub result: Option<Vec<u8>>,
    /// Failure once failed.
    pub exception: Option<StoredException>,
    /// Current status.
    pub status: Status,
    /// Retry time when postponed.
    pub postponed_until: Option<DateTime<Utc>>,
    /// Ownership counter; the compare-and-swap token for every write.
    pub epoch: i32,
    /// When the current lease runs out.
    pub lease_expiration: DateTime<Utc>,
    /// Bumped by every interrupt (message append, semaphore promotion).
    pub interrupt_count: i64,
    /// Last write time.
    pub timestamp: DateTime<Utc>,
    /// Optional caller-owned state blob.
    pub default_state: Option<Vec<u8>>,
}

/// Epoch and status of a function as observed by a message append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionStatus {
    /// Status at append time.
    pub status: Status,
    /// Epoch at append time.
    pub epoch: i32,
}

/// An `Executing` function as returned by the crash query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredExecutingFunction {
    /// The function.
    pub flow_id: FlowId,
    /// Epoch the crashed executor held.
    pub epoch: i32,
    /// The lapsed lease.
    pub lease_expiration: DateTime<Utc>,
}

/// A `Postponed` function whose retry time has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPostponedFunction {
    /// The function.
    pub flow_id: FlowId,
    /// Epoch at postponement.
    pub epoch: i32,
    /// Retry time.
    pub postponed_until: DateTime<Utc>,
}

/// Stable identifier of one memoized step inside a flow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectId(String);

impl EffectId {
    /// Create an effect id.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EffectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EffectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Progress of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Entered but not finished (the executor may have crashed inside it).
    Started,
    /// Finished; `result` or `exception` is fixed from now on.
    Completed,
}

impl WorkStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for WorkStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            other => Err(CoreError::ValidationError {
                field: "work_status".to_string(),
                message: format!("unknown work status '{}'", other),
            }),
        }
    }
}

/// One memoized step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEffect {
    /// Step id.
    pub effect_id: EffectId,
    /// Progress.
    pub work_status: WorkStatus,
    /// Serialized value on success.
    pub result: Option<Vec<u8>>,
    /// Failure, when the step is a memoized failure.
    pub exception: Option<StoredException>,
}

impl StoredEffect {
    /// A step that has been entered but has not finished.
    pub fn started(effect_id: impl Into<EffectId>) -> Self {
        Self {
            effect_id: effect_id.into(),
            work_status: WorkStatus::Started,
            result: None,
            exception: None,
        }
    }

    /// A successfully finished step.
    pub fn completed(effect_id: impl Into<EffectId>, result: Option<Vec<u8>>) -> Self {
        Self {
            effect_id: effect_id.into(),
            work_status: WorkStatus::Completed,
            result,
            exception: None,
        }
    }

    /// A finished step whose failure is replayed on every re-execution.
    pub fn failed(effect_id: impl Into<EffectId>, exception: StoredException) -> Self {
        Self {
            effect_id: effect_id.into(),
            work_status: WorkStatus::Completed,
            result: None,
            exception: Some(exception),
        }
    }
}

/// One entry of a bulk effect change-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectChange {
    /// Insert or overwrite.
    Upsert(StoredEffect),
    /// Remove if present.
    Delete(EffectId),
}

/// A message to append; position is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Serialized content.
    pub content: Vec<u8>,
    /// Type tag used by subscribers to filter and decode.
    pub message_type: String,
    /// Deduplication token; a repeated key for the same instance is dropped.
    pub idempotency_key: Option<String>,
}

impl NewMessage {
    /// Create a message without an idempotency key.
    pub fn new(message_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            content,
            message_type: message_type.into(),
            idempotency_key: None,
        }
    }

    /// Attach an idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A message as stored in a flow instance's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Position in the log, contiguous from 0.
    pub position: i64,
    /// Serialized content.
    pub content: Vec<u8>,
    /// Type tag.
    pub message_type: String,
    /// Deduplication token.
    pub idempotency_key: Option<String>,
}

/// A scheduled wake-up for a flow instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTimeout {
    /// Owner.
    pub flow_id: FlowId,
    /// Id unique within the owner.
    pub timeout_id: String,
    /// Absolute expiry.
    pub expiry: DateTime<Utc>,
}

/// Convert an absolute time to the millisecond ticks backends persist.
pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert persisted millisecond ticks back to an absolute time.
pub fn from_millis(millis: i64) -> Result<DateTime<Utc>, CoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| CoreError::ValidationError {
        field: "timestamp".to_string(),
        message: format!("{} is out of range", millis),
    })
}
