// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store.
//!
//! All tables live behind one mutex, so every operation is trivially atomic and
//! writes per flow id are serialized. Intended for tests and single-process
//! embedding; nothing survives the process.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CoreError;
use crate::types::{
    EffectChange, EffectId, FlowId, FlowType, FunctionStatus, NewMessage, Status,
    StoredEffect, StoredExecutingFunction, StoredFunction, StoredMessage,
    StoredPostponedFunction, StoredTimeout,
};

use super::{
    CorrelationStore, EffectsStore, FunctionState, FunctionStore, MessageStore, SemaphoreStore,
    TimeoutStore,
};

#[derive(Default)]
struct Tables {
    functions: HashMap<FlowId, StoredFunction>,
    effects: HashMap<FlowId, Vec<StoredEffect>>,
    messages: HashMap<FlowId, Vec<StoredMessage>>,
    timeouts: HashMap<FlowId, BTreeMap<String, DateTime<Utc>>>,
    semaphores: HashMap<(String, String), Vec<FlowId>>,
    correlations: HashMap<FlowId, BTreeSet<String>>,
}

impl Tables {
    fn interrupt(&mut self, flow_id: &FlowId, now: DateTime<Utc>) {
        if let Some(function) = self.functions.get_mut(flow_id) {
            function.interrupt_count += 1;
            if function.status == Status::Suspended {
                function.status = Status::Postponed;
                function.postponed_until = Some(now);
            }
        }
    }

    /// Returns `None` when the idempotency key was already seen.
    fn append(&mut self, flow_id: &FlowId, message: &NewMessage) -> Option<i64> {
        let log = self.messages.entry(flow_id.clone()).or_default();
        let duplicate = message.idempotency_key.as_deref().is_some_and(|key| {
            log.iter()
                .any(|m| m.idempotency_key.as_deref() == Some(key))
        });
        if duplicate {
            return None;
        }

        let position = log.len() as i64;
        log.push(StoredMessage {
            position,
            content: message.content.clone(),
            message_type: message.message_type.clone(),
            idempotency_key: message.idempotency_key.clone(),
        });
        Some(position)
    }
}

/// Store keeping every table in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FunctionStore for InMemoryStore {
    fn effects(&self) -> &dyn EffectsStore {
        self
    }

    fn messages(&self) -> &dyn MessageStore {
        self
    }

    fn timeouts(&self) -> &dyn TimeoutStore {
        self
    }

    fn semaphores(&self) -> &dyn SemaphoreStore {
        self
    }

    fn correlations(&self) -> &dyn CorrelationStore {
        self
    }

    async fn initialize(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn truncate_all(&self) -> Result<(), CoreError> {
        *self.tables.lock().await = Tables::default();
        Ok(())
    }

    async fn create_function(
        &self,
        flow_id: &FlowId,
        parameter: Option<&[u8]>,
        lease_expiration: DateTime<Utc>,
        postpone_until: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        if tables.functions.contains_key(flow_id) {
            return Ok(false);
        }

        let status = if postpone_until.is_some() {
            Status::Postponed
        } else {
            Status::Executing
        };
        tables.functions.insert(
            flow_id.clone(),
            StoredFunction {
                flow_id: flow_id.clone(),
                parameter: parameter.map(<[u8]>::to_vec),
                result: None,
                exception: None,
                status,
                postponed_until: postpone_until,
                epoch: 0,
                lease_expiration,
                interrupt_count: 0,
                timestamp,
                default_state: None,
            },
        );
        Ok(true)
    }

    async fn restart_execution(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<Option<StoredFunction>, CoreError> {
        let mut tables = self.tables.lock().await;
        let Some(function) = tables.functions.get_mut(flow_id) else {
            return Ok(None);
        };
        if function.epoch != expected_epoch || function.status == Status::Barricaded {
            return Ok(None);
        }

        function.status = Status::Executing;
        function.epoch = expected_epoch + 1;
        function.lease_expiration = lease_expiration;
        function.postponed_until = None;
        function.result = None;
        function.exception = None;
        function.timestamp = Utc::now();
        Ok(Some(function.clone()))
    }

    async fn renew_lease(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        match tables.functions.get_mut(flow_id) {
            Some(function)
                if function.epoch == expected_epoch && function.status == Status::Executing =>
            {
                function.lease_expiration = lease_expiration;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_to_become_leader(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        new_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        match tables.functions.get_mut(flow_id) {
            Some(function)
                if function.epoch == expected_epoch && function.status != Status::Barricaded =>
            {
                function.status = Status::Executing;
                function.epoch = new_epoch;
                function.lease_expiration = lease_expiration;
                function.timestamp = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_function_state(
        &self,
        flow_id: &FlowId,
        state: &FunctionState,
        expected_epoch: i32,
    ) -> Result<bool, CoreError> {
        state.validate()?;
        let mut tables = self.tables.lock().await;
        match tables.functions.get_mut(flow_id) {
            Some(function)
                if function.epoch == expected_epoch && function.status != Status::Barricaded =>
            {
                function.status = state.status;
                function.parameter = state.parameter.clone();
                function.result = state.result.clone();
                function.exception = state.exception.clone();
                function.postponed_until = state.postponed_until;
                function.timestamp = state.timestamp;
                function.epoch = expected_epoch + 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn suspend_function(
        &self,
        flow_id: &FlowId,
        expected_interrupt_count: i64,
        timestamp: DateTime<Utc>,
        expected_epoch: i32,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        match tables.functions.get_mut(flow_id) {
            Some(function)
                if function.epoch == expected_epoch
                    && function.status == Status::Executing
                    && function.interrupt_count == expected_interrupt_count =>
            {
                function.status = Status::Suspended;
                function.postponed_until = None;
                function.timestamp = timestamp;
                function.epoch = expected_epoch + 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn interrupt(&self, flow_ids: &[FlowId]) -> Result<(), CoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        for flow_id in flow_ids {
            tables.interrupt(flow_id, now);
        }
        Ok(())
    }

    async fn get_interrupt_count(&self, flow_id: &FlowId) -> Result<Option<i64>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.functions.get(flow_id).map(|f| f.interrupt_count))
    }

    async fn barricade_function(&self, flow_id: &FlowId) -> Result<bool, CoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        match tables.functions.get_mut(flow_id) {
            Some(function) if function.status == Status::Executing => Ok(false),
            Some(function) => {
                function.status = Status::Barricaded;
                function.postponed_until = None;
                function.epoch += 1;
                function.timestamp = now;
                Ok(true)
            }
            None => {
                tables.functions.insert(
                    flow_id.clone(),
                    StoredFunction {
                        flow_id: flow_id.clone(),
                        parameter: None,
                        result: None,
                        exception: None,
                        status: Status::Barricaded,
                        postponed_until: None,
                        epoch: 0,
                        lease_expiration: now,
                        interrupt_count: 0,
                        timestamp: now,
                        default_state: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn set_default_state(
        &self,
        flow_id: &FlowId,
        state: Option<&[u8]>,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        match tables.functions.get_mut(flow_id) {
            Some(function) => {
                function.default_state = state.map(<[u8]>::to_vec);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_function(&self, flow_id: &FlowId) -> Result<Option<StoredFunction>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.functions.get(flow_id).cloned())
    }

    async fn get_crashed_functions(
        &self,
        flow_type: &FlowType,
        lease_expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredExecutingFunction>, CoreError> {
        let tables = self.tables.lock().await;
        let mut crashed: Vec<_> = tables
            .functions
            .values()
            .filter(|f| {
                &f.flow_id.flow_type == flow_type
                    && f.status == Status::Executing
                    && f.lease_expiration < lease_expires_before
            })
            .map(|f| StoredExecutingFunction {
                flow_id: f.flow_id.clone(),
                epoch: f.epoch,
                lease_expiration: f.lease_expiration,
            })
            .collect();
        crashed.sort_by_key(|f| f.lease_expiration);
        Ok(crashed)
    }

    async fn get_postponed_functions(
        &self,
        flow_type: &FlowType,
        expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredPostponedFunction>, CoreError> {
        let tables = self.tables.lock().await;
        let mut due: Vec<_> = tables
            .functions
            .values()
            .filter(|f| &f.flow_id.flow_type == flow_type && f.status == Status::Postponed)
            .filter_map(|f| {
                let until = f.postponed_until?;
                (until <= expires_before).then(|| StoredPostponedFunction {
                    flow_id: f.flow_id.clone(),
                    epoch: f.epoch,
                    postponed_until: until,
                })
            })
            .collect();
        due.sort_by_key(|f| f.postponed_until);
        Ok(due)
    }

    async fn get_instances(
        &self,
        flow_type: &FlowType,
        status: Option<Status>,
    ) -> Result<Vec<FlowId>, CoreError> {
        let tables = self.tables.lock().await;
        let mut ids: Vec<_> = tables
            .functions
            .values()
            .filter(|f| &f.flow_id.flow_type == flow_type)
            .filter(|f| status.is_none_or(|s| f.status == s))
            .map(|f| f.flow_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_function(&self, flow_id: &FlowId) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        let existed = tables.functions.remove(flow_id).is_some();
        tables.effects.remove(flow_id);
        tables.messages.remove(flow_id);
        tables.timeouts.remove(flow_id);
        tables.correlations.remove(flow_id);
        for queue in tables.semaphores.values_mut() {
            queue.retain(|holder| holder != flow_id);
        }
        debug!(flow_id = %flow_id, existed, "Function deleted");
        Ok(existed)
    }
}

#[async_trait]
impl EffectsStore for InMemoryStore {
    async fn set_effect_result(
        &self,
        flow_id: &FlowId,
        effect: &StoredEffect,
    ) -> Result<(), CoreError> {
        self.set_effect_results(flow_id, &[EffectChange::Upsert(effect.clone())])
            .await
    }

    async fn set_effect_results(
        &self,
        flow_id: &FlowId,
        changes: &[EffectChange],
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let effects = tables.effects.entry(flow_id.clone()).or_default();
        for change in changes {
            match change {
                EffectChange::Upsert(effect) => {
                    match effects.iter_mut().find(|e| e.effect_id == effect.effect_id) {
                        Some(existing) => *existing = effect.clone(),
                        None => effects.push(effect.clone()),
                    }
                }
                EffectChange::Delete(effect_id) => effects.retain(|e| &e.effect_id != effect_id),
            }
        }
        Ok(())
    }

    async fn get_effect_results(&self, flow_id: &FlowId) -> Result<Vec<StoredEffect>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.effects.get(flow_id).cloned().unwrap_or_default())
    }

    async fn delete_effect_result(
        &self,
        flow_id: &FlowId,
        effect_id: &EffectId,
    ) -> Result<(), CoreError> {
        self.set_effect_results(flow_id, &[EffectChange::Delete(effect_id.clone())])
            .await
    }

    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.tables.lock().await.effects.remove(flow_id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append_message(
        &self,
        flow_id: &FlowId,
        message: &NewMessage,
    ) -> Result<Option<FunctionStatus>, CoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let observed = tables.functions.get(flow_id).map(|f| FunctionStatus {
            status: f.status,
            epoch: f.epoch,
        });

        if tables.append(flow_id, message).is_none() {
            debug!(flow_id = %flow_id, key = ?message.idempotency_key, "Duplicate message dropped");
            return Ok(None);
        }
        tables.interrupt(flow_id, now);
        Ok(observed)
    }

    async fn append_messages(
        &self,
        messages: &[(FlowId, NewMessage)],
        interrupt: bool,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let mut touched = BTreeSet::new();
        for (flow_id, message) in messages {
            if tables.append(flow_id, message).is_some() {
                touched.insert(flow_id.clone());
            }
        }
        if interrupt {
            for flow_id in &touched {
                tables.interrupt(flow_id, now);
            }
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        flow_id: &FlowId,
        skip: i64,
    ) -> Result<Vec<StoredMessage>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .get(flow_id)
            .map(|log| {
                log.iter()
                    .filter(|m| m.position >= skip)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn replace_message(
        &self,
        flow_id: &FlowId,
        position: i64,
        message: &NewMessage,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables
            .messages
            .get_mut(flow_id)
            .and_then(|log| log.iter_mut().find(|m| m.position == position))
        else {
            return Ok(false);
        };
        stored.content = message.content.clone();
        stored.message_type = message.message_type.clone();
        stored.idempotency_key = message.idempotency_key.clone();
        Ok(true)
    }

    async fn truncate(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.tables.lock().await.messages.remove(flow_id);
        Ok(())
    }
}

#[async_trait]
impl TimeoutStore for InMemoryStore {
    async fn upsert_timeout(
        &self,
        timeout: &StoredTimeout,
        overwrite: bool,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let timeouts = tables.timeouts.entry(timeout.flow_id.clone()).or_default();
        if overwrite || !timeouts.contains_key(&timeout.timeout_id) {
            timeouts.insert(timeout.timeout_id.clone(), timeout.expiry);
        }
        Ok(())
    }

    async fn remove_timeout(&self, flow_id: &FlowId, timeout_id: &str) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(timeouts) = tables.timeouts.get_mut(flow_id) {
            timeouts.remove(timeout_id);
        }
        Ok(())
    }

    async fn get_timeouts(
        &self,
        flow_type: &FlowType,
        expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredTimeout>, CoreError> {
        let tables = self.tables.lock().await;
        let mut due: Vec<_> = tables
            .timeouts
            .iter()
            .filter(|(flow_id, _)| &flow_id.flow_type == flow_type)
            .flat_map(|(flow_id, timeouts)| {
                timeouts.iter().map(move |(id, expiry)| StoredTimeout {
                    flow_id: flow_id.clone(),
                    timeout_id: id.clone(),
                    expiry: *expiry,
                })
            })
            .filter(|t| t.expiry <= expires_before)
            .collect();
        due.sort_by_key(|t| t.expiry);
        Ok(due)
    }

    async fn get_timeouts_for(&self, flow_id: &FlowId) -> Result<Vec<StoredTimeout>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .timeouts
            .get(flow_id)
            .map(|timeouts| {
                timeouts
                    .iter()
                    .map(|(id, expiry)| StoredTimeout {
                        flow_id: flow_id.clone(),
                        timeout_id: id.clone(),
                        expiry: *expiry,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.tables.lock().await.timeouts.remove(flow_id);
        Ok(())
    }
}

#[async_trait]
impl SemaphoreStore for InMemoryStore {
    async fn acquire(
        &self,
        group: &str,
        instance: &str,
        holder: &FlowId,
        maximum_count: usize,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        let queue = tables
            .semaphores
            .entry((group.to_string(), instance.to_string()))
            .or_default();
        let index = match queue.iter().position(|h| h == holder) {
            Some(index) => index,
            None => {
                queue.push(holder.clone());
                queue.len() - 1
            }
        };
        Ok(index < maximum_count)
    }

    async fn release(
        &self,
        group: &str,
        instance: &str,
        holder: &FlowId,
        maximum_count: usize,
    ) -> Result<Vec<FlowId>, CoreError> {
        let mut tables = self.tables.lock().await;
        let queue = tables
            .semaphores
            .entry((group.to_string(), instance.to_string()))
            .or_default();
        queue.retain(|h| h != holder);
        Ok(queue.iter().take(maximum_count).cloned().collect())
    }

    async fn get_queued(
        &self,
        group: &str,
        instance: &str,
        count: usize,
    ) -> Result<Vec<FlowId>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .semaphores
            .get(&(group.to_string(), instance.to_string()))
            .map(|queue| queue.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CorrelationStore for InMemoryStore {
    async fn set_correlation(&self, flow_id: &FlowId, correlation: &str) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .correlations
            .entry(flow_id.clone())
            .or_default()
            .insert(correlation.to_string());
        Ok(())
    }

    async fn get_correlations(&self, flow_id: &FlowId) -> Result<Vec<String>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .correlations
            .get(flow_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_flows_with_correlation(
        &self,
        flow_type: Option<&FlowType>,
        correlation: &str,
    ) -> Result<Vec<FlowId>, CoreError> {
        let tables = self.tables.lock().await;
        let mut ids: Vec<_> = tables
            .correlations
            .iter()
            .filter(|(flow_id, set)| {
                set.contains(correlation) && flow_type.is_none_or(|t| &flow_id.flow_type == t)
            })
            .map(|(flow_id, _)| flow_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove_correlation(
        &self,
        flow_id: &FlowId,
        correlation: &str,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(set) = tables.correlations.get_mut(flow_id) {
            set.remove(correlation);
        }
        Ok(())
    }

    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        self.tables.lock().await.correlations.remove(flow_id);
        Ok(())
    }
}
