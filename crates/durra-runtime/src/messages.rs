// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message logs: typed payloads, the in-flow handle and the external writer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use durra_core::{CoreError, FlowId, FunctionStore, NewMessage, StoredMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec;
use crate::context::Context;
use crate::error::{FlowError, FlowResult};
use crate::reactive::Chain;
use crate::workflow::Workflow;

/// A payload that can travel through a message log.
///
/// `TYPE` is the tag persisted next to the content. It must stay stable for as
/// long as logs containing it exist.
pub trait MessageType: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Persisted type tag.
    const TYPE: &'static str;
}

impl MessageType for String {
    const TYPE: &'static str = "string";
}

impl MessageType for serde_json::Value {
    const TYPE: &'static str = "json";
}

/// Appended to a log when a registered timeout expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutEvent {
    /// Id the timeout was registered under.
    pub timeout_id: String,
    /// When it was due.
    pub expiry: DateTime<Utc>,
}

impl MessageType for TimeoutEvent {
    const TYPE: &'static str = "durra.timeout";
}

impl TimeoutEvent {
    /// Idempotency key of the event, so a timeout fires at most once per log.
    pub fn idempotency_key(timeout_id: &str) -> String {
        format!("timeout:{}", timeout_id)
    }

    pub(crate) fn to_message(&self) -> Result<NewMessage, CoreError> {
        encode(self, Some(&Self::idempotency_key(&self.timeout_id)))
    }
}

pub(crate) fn encode<T: MessageType>(
    message: &T,
    idempotency_key: Option<&str>,
) -> Result<NewMessage, CoreError> {
    let content = codec::encode(T::TYPE, message)?;
    let message = NewMessage::new(T::TYPE, content);
    Ok(match idempotency_key {
        Some(key) => message.with_idempotency_key(key),
        None => message,
    })
}

/// Decode `message` as `T`; `None` when it carries another type tag.
pub(crate) fn decode<T: MessageType>(message: &StoredMessage) -> Result<Option<T>, CoreError> {
    if message.message_type != T::TYPE {
        return Ok(None);
    }
    codec::decode(T::TYPE, Some(&message.content)).map(Some)
}

/// The running instance's own log.
#[derive(Clone)]
pub struct Messages {
    workflow: Workflow,
}

impl Messages {
    pub(crate) fn new(workflow: Workflow) -> Self {
        Self { workflow }
    }

    pub(crate) fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Every message, undecoded.
    pub fn all(&self) -> Chain<StoredMessage> {
        Chain::source(self.clone())
    }

    /// Messages tagged `T::TYPE`, decoded.
    pub fn of_type<T: MessageType>(&self) -> Chain<T> {
        Chain::of_type(self.clone())
    }

    /// Append to the instance's own log.
    pub async fn append<T: MessageType>(&self, message: &T, idempotency_key: Option<&str>) -> FlowResult<()> {
        self.workflow.ensure_current()?;
        let message = encode(message, idempotency_key).map_err(FlowError::serialization)?;
        self.workflow
            .store()
            .messages()
            .append_message(self.workflow.flow_id(), &message)
            .await?;
        Ok(())
    }

    /// A cursor over the log starting at position 0.
    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.workflow.context().store.clone(), self.workflow.flow_id().clone(), 0)
    }
}

/// Incremental reader of one log.
pub struct Subscription {
    store: Arc<dyn FunctionStore>,
    flow_id: FlowId,
    skip: i64,
}

impl Subscription {
    pub(crate) fn new(store: Arc<dyn FunctionStore>, flow_id: FlowId, skip: i64) -> Self {
        Self { store, flow_id, skip }
    }

    /// Messages appended since the last pull.
    pub async fn pull(&mut self) -> Result<Vec<StoredMessage>, CoreError> {
        let messages = self.store.messages().get_messages(&self.flow_id, self.skip).await?;
        if let Some(last) = messages.last() {
            self.skip = last.position + 1;
        }
        Ok(messages)
    }

    /// Position the next pull starts at.
    pub fn position(&self) -> i64 {
        self.skip
    }
}

/// Appends to a flow instance's log from outside the flow.
///
/// A suspended owner is re-dispatched right away when its flow type is
/// registered on the same registry.
#[derive(Clone)]
pub struct MessageWriter {
    ctx: Arc<Context>,
    flow_id: FlowId,
}

impl MessageWriter {
    pub(crate) fn new(ctx: Arc<Context>, flow_id: FlowId) -> Self {
        Self { ctx, flow_id }
    }

    /// Target instance.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Append `message`; a repeated `idempotency_key` is dropped.
    pub async fn append<T: MessageType>(&self, message: &T, idempotency_key: Option<&str>) -> Result<(), CoreError> {
        self.append_raw(&encode(message, idempotency_key)?).await
    }

    /// Append a pre-encoded message.
    pub async fn append_raw(&self, message: &NewMessage) -> Result<(), CoreError> {
        let observed = self
            .ctx
            .store
            .messages()
            .append_message(&self.flow_id, message)
            .await?;
        debug!(
            flow_id = %self.flow_id,
            message_type = %message.message_type,
            observed = ?observed.map(|o| o.status),
            "Appended message"
        );
        self.ctx.wake(&self.flow_id, observed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::test_support;

    #[test]
    fn test_decode_skips_other_types() {
        let stored = StoredMessage {
            position: 0,
            content: b"\"hi\"".to_vec(),
            message_type: String::TYPE.to_string(),
            idempotency_key: None,
        };
        assert_eq!(decode::<String>(&stored).unwrap().as_deref(), Some("hi"));
        assert!(decode::<TimeoutEvent>(&stored).unwrap().is_none());
    }

    #[test]
    fn test_timeout_event_is_keyed_by_id() {
        let event = TimeoutEvent {
            timeout_id: "reply".to_string(),
            expiry: Utc::now(),
        };
        let message = event.to_message().unwrap();
        assert_eq!(message.message_type, "durra.timeout");
        assert_eq!(message.idempotency_key.as_deref(), Some("timeout:reply"));
    }

    #[tokio::test]
    async fn test_subscription_pulls_incrementally() {
        let ctx = test_support::context(Settings::default());
        let workflow = test_support::workflow(&ctx, "subscription").await;
        let messages = workflow.messages();
        let mut subscription = messages.subscribe();

        messages.append(&"a".to_string(), None).await.unwrap();
        messages.append(&"b".to_string(), None).await.unwrap();
        assert_eq!(subscription.pull().await.unwrap().len(), 2);
        assert!(subscription.pull().await.unwrap().is_empty());

        messages.append(&"c".to_string(), Some("k")).await.unwrap();
        messages.append(&"c".to_string(), Some("k")).await.unwrap();
        let pulled = subscription.pull().await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].position, 2);
        assert_eq!(subscription.position(), 3);
    }

    #[tokio::test]
    async fn test_writer_appends_without_running_flow() {
        let ctx = test_support::context(Settings::default());
        let flow_id = FlowId::new("unregistered", "x");
        let writer = MessageWriter::new(ctx.clone(), flow_id.clone());

        writer.append(&serde_json::json!({"n": 1}), None).await.unwrap();

        let stored = ctx.store.messages().get_messages(&flow_id, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message_type, "json");
    }
}
