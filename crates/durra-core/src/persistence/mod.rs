// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store contract and backends.
//!
//! [`FunctionStore`] is the single persistence boundary of the engine. It owns
//! the functions table and hands out the effect, message, timeout, semaphore and
//! correlation sub-stores. Every mutation of a function row is a compare-and-swap
//! on its epoch; a stale `expected_epoch` is reported as `false`/`None`, never as
//! an error, so callers can branch without error-based control flow.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
pub(crate) mod conformance;

pub use self::memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::types::{
    EffectChange, EffectId, FlowId, FlowType, FunctionStatus, NewMessage, Status,
    StoredEffect, StoredException, StoredExecutingFunction, StoredFunction, StoredMessage,
    StoredPostponedFunction, StoredTimeout,
};

/// Full replacement of the mutable part of a function row.
///
/// Used by [`FunctionStore::set_function_state`]; the row is rewritten as a
/// whole, absent fields are stored as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionState {
    /// New status. `Executing` is only reachable through leadership operations.
    pub status: Status,
    /// Serialized parameter.
    pub parameter: Option<Vec<u8>>,
    /// Serialized result.
    pub result: Option<Vec<u8>>,
    /// Failure.
    pub exception: Option<StoredException>,
    /// Retry time, required for `Postponed`.
    pub postponed_until: Option<DateTime<Utc>>,
    /// Write time.
    pub timestamp: DateTime<Utc>,
}

impl FunctionState {
    /// Validate the combination before it reaches a backend.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self.status {
            Status::Executing | Status::Barricaded => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("'{}' cannot be set through set_function_state", self.status),
            }),
            Status::Postponed if self.postponed_until.is_none() => {
                Err(CoreError::ValidationError {
                    field: "postponed_until".to_string(),
                    message: "required for postponed status".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Functions table plus access to the sub-stores.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Memoized effects.
    fn effects(&self) -> &dyn EffectsStore;

    /// Per-instance message logs.
    fn messages(&self) -> &dyn MessageStore;

    /// Scheduled wake-ups.
    fn timeouts(&self) -> &dyn TimeoutStore;

    /// Persisted FIFO semaphores.
    fn semaphores(&self) -> &dyn SemaphoreStore;

    /// Correlation index.
    fn correlations(&self) -> &dyn CorrelationStore;

    /// Prepare the schema. Safe to call repeatedly.
    async fn initialize(&self) -> Result<(), CoreError>;

    /// Remove every row from every table.
    async fn truncate_all(&self) -> Result<(), CoreError>;

    /// Insert a new function at epoch 0.
    ///
    /// The row starts `Executing` with the given lease, or `Postponed` when
    /// `postpone_until` is set. Returns `false` and leaves the existing row
    /// untouched when the id is taken.
    async fn create_function(
        &self,
        flow_id: &FlowId,
        parameter: Option<&[u8]>,
        lease_expiration: DateTime<Utc>,
        postpone_until: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Force the function back to `Executing` at `expected_epoch + 1`.
    ///
    /// Used for administrative re-invocation from any non-barricaded status.
    /// Clears result, exception and postponement. Returns the updated row, or
    /// `None` on epoch mismatch.
    async fn restart_execution(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<Option<StoredFunction>, CoreError>;

    /// Extend the lease of an `Executing` function held at `expected_epoch`.
    async fn renew_lease(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// The election primitive: move to `Executing` at `new_epoch` iff the stored
    /// epoch equals `expected_epoch` and the function is not barricaded.
    async fn try_to_become_leader(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        new_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Rewrite status, parameter, result, exception and postponement at
    /// `expected_epoch`, moving the epoch to `expected_epoch + 1`.
    async fn set_function_state(
        &self,
        flow_id: &FlowId,
        state: &FunctionState,
        expected_epoch: i32,
    ) -> Result<bool, CoreError>;

    /// Move an `Executing` function to `Suspended` at `expected_epoch + 1`,
    /// provided no interrupt happened since `expected_interrupt_count` was read.
    async fn suspend_function(
        &self,
        flow_id: &FlowId,
        expected_interrupt_count: i64,
        timestamp: DateTime<Utc>,
        expected_epoch: i32,
    ) -> Result<bool, CoreError>;

    /// Bump the interrupt count of each function and make suspended ones
    /// dispatch-eligible (`Postponed` until now). Missing ids are skipped.
    async fn interrupt(&self, flow_ids: &[FlowId]) -> Result<(), CoreError>;

    /// Current interrupt count, `None` when the function does not exist.
    async fn get_interrupt_count(&self, flow_id: &FlowId) -> Result<Option<i64>, CoreError>;

    /// Permanently stop a function. Creates a barricaded row if none exists.
    /// Rejected (`false`) while the function is `Executing`.
    async fn barricade_function(&self, flow_id: &FlowId) -> Result<bool, CoreError>;

    /// Replace the default-state blob. Not epoch guarded.
    async fn set_default_state(
        &self,
        flow_id: &FlowId,
        state: Option<&[u8]>,
    ) -> Result<bool, CoreError>;

    /// Read one function.
    async fn get_function(&self, flow_id: &FlowId) -> Result<Option<StoredFunction>, CoreError>;

    /// `Executing` functions of `flow_type` whose lease ran out before the cutoff.
    async fn get_crashed_functions(
        &self,
        flow_type: &FlowType,
        lease_expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredExecutingFunction>, CoreError>;

    /// `Postponed` functions of `flow_type` due at or before the cutoff.
    async fn get_postponed_functions(
        &self,
        flow_type: &FlowType,
        expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredPostponedFunction>, CoreError>;

    /// Instances of `flow_type`, optionally filtered by status.
    async fn get_instances(
        &self,
        flow_type: &FlowType,
        status: Option<Status>,
    ) -> Result<Vec<FlowId>, CoreError>;

    /// Delete a function and everything it owns: effects, messages, timeouts,
    /// correlations and semaphore entries. Returns whether the function existed.
    async fn delete_function(&self, flow_id: &FlowId) -> Result<bool, CoreError>;
}

/// Memoized effect results.
#[async_trait]
pub trait EffectsStore: Send + Sync {
    /// Upsert by `(flow_id, effect_id)`.
    async fn set_effect_result(
        &self,
        flow_id: &FlowId,
        effect: &StoredEffect,
    ) -> Result<(), CoreError>;

    /// Apply upserts and deletes atomically.
    async fn set_effect_results(
        &self,
        flow_id: &FlowId,
        changes: &[EffectChange],
    ) -> Result<(), CoreError>;

    /// All effects of a flow instance.
    async fn get_effect_results(&self, flow_id: &FlowId) -> Result<Vec<StoredEffect>, CoreError>;

    /// Remove one effect.
    async fn delete_effect_result(
        &self,
        flow_id: &FlowId,
        effect_id: &EffectId,
    ) -> Result<(), CoreError>;

    /// Remove all effects of a flow instance.
    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError>;
}

/// Append-only message logs.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append at the next position and interrupt the owner.
    ///
    /// A message whose idempotency key was already seen for the instance is
    /// dropped. Returns the owner's status and epoch as observed at append time
    /// (before a `Suspended` owner is flipped to `Postponed`). `None` means there
    /// is nothing to wake: either no function exists for the id yet or the
    /// message was a duplicate and nothing was appended.
    async fn append_message(
        &self,
        flow_id: &FlowId,
        message: &NewMessage,
    ) -> Result<Option<FunctionStatus>, CoreError>;

    /// Append a batch with the same deduplication rule, optionally interrupting
    /// every owner in the same pass.
    async fn append_messages(
        &self,
        messages: &[(FlowId, NewMessage)],
        interrupt: bool,
    ) -> Result<(), CoreError>;

    /// Messages at position `skip` and later, in position order.
    async fn get_messages(&self, flow_id: &FlowId, skip: i64)
    -> Result<Vec<StoredMessage>, CoreError>;

    /// Overwrite the message at `position`. Returns `false` if there is none.
    async fn replace_message(
        &self,
        flow_id: &FlowId,
        position: i64,
        message: &NewMessage,
    ) -> Result<bool, CoreError>;

    /// Drop the whole log of an instance.
    async fn truncate(&self, flow_id: &FlowId) -> Result<(), CoreError>;
}

/// Scheduled wake-ups.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Insert a timeout; an existing one is replaced only when `overwrite` is set.
    async fn upsert_timeout(&self, timeout: &StoredTimeout, overwrite: bool)
    -> Result<(), CoreError>;

    /// Remove one timeout.
    async fn remove_timeout(&self, flow_id: &FlowId, timeout_id: &str) -> Result<(), CoreError>;

    /// Timeouts of `flow_type` expiring at or before the cutoff, earliest first.
    async fn get_timeouts(
        &self,
        flow_type: &FlowType,
        expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredTimeout>, CoreError>;

    /// All timeouts of one instance.
    async fn get_timeouts_for(&self, flow_id: &FlowId) -> Result<Vec<StoredTimeout>, CoreError>;

    /// Remove all timeouts of one instance.
    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError>;
}

/// Persisted FIFO counting semaphores keyed by `(group, instance)`.
#[async_trait]
pub trait SemaphoreStore: Send + Sync {
    /// Enqueue `holder` (idempotently) and report whether it is inside the
    /// first `maximum_count` entries.
    async fn acquire(
        &self,
        group: &str,
        instance: &str,
        holder: &FlowId,
        maximum_count: usize,
    ) -> Result<bool, CoreError>;

    /// Remove `holder` and return the holders now inside the window.
    async fn release(
        &self,
        group: &str,
        instance: &str,
        holder: &FlowId,
        maximum_count: usize,
    ) -> Result<Vec<FlowId>, CoreError>;

    /// The first `count` entries in acquisition order.
    async fn get_queued(
        &self,
        group: &str,
        instance: &str,
        count: usize,
    ) -> Result<Vec<FlowId>, CoreError>;
}

/// Correlation ids attached to flow instances.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Attach a correlation id (idempotent).
    async fn set_correlation(&self, flow_id: &FlowId, correlation: &str) -> Result<(), CoreError>;

    /// Correlation ids of one instance, sorted.
    async fn get_correlations(&self, flow_id: &FlowId) -> Result<Vec<String>, CoreError>;

    /// Instances carrying a correlation id, optionally limited to one flow type.
    async fn get_flows_with_correlation(
        &self,
        flow_type: Option<&FlowType>,
        correlation: &str,
    ) -> Result<Vec<FlowId>, CoreError>;

    /// Detach one correlation id.
    async fn remove_correlation(&self, flow_id: &FlowId, correlation: &str)
    -> Result<(), CoreError>;

    /// Detach every correlation id of an instance.
    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError>;
}
