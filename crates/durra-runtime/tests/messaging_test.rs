// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message log, reactive waits, suspension and timeouts.
//!
//! Flows wait on their message log through reactive chains. With no inline
//! budget they suspend immediately and are re-dispatched by the append that
//! satisfies them; with a budget they poll in-process.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use durra_core::{FlowId, NewMessage, Status};
use durra_runtime::{Flow, FlowResult, InvocationError, MessageType, Registry, TimeoutEvent, Workflow};
use serde_json::{Value, json};

use common::{eventually, fast_settings, init_tracing, memory_store, sqlite_store, wait_for_status};

async fn two_greetings(_: (), workflow: Workflow) -> FlowResult<Vec<String>> {
    workflow
        .messages()
        .of_type::<String>()
        .filter(|text| text.starts_with("hello"))
        .take(2)
        .collect()
        .await
}

async fn reply_or_nothing(_: (), workflow: Workflow) -> FlowResult<Option<String>> {
    workflow
        .messages()
        .of_type::<String>()
        .timeout("reply", Duration::from_millis(200))
        .first_or_none()
        .await
}

async fn send_greetings(flow: &Flow<(), Vec<String>>, instance: &str) {
    flow.send_message(instance, &"hello world".to_string(), Some("1"))
        .await
        .unwrap();
    flow.send_message(instance, &"hello world".to_string(), Some("1"))
        .await
        .unwrap();
    flow.send_message(instance, &"hello universe".to_string(), None)
        .await
        .unwrap();
}

// ============================================================================
// Suspend and Resume
// ============================================================================

/// A waiting flow suspends and is resumed by the message that satisfies it;
/// a repeated idempotency key is delivered once.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_take_two_suspends_until_messages_arrive() {
    init_tracing();
    let store = sqlite_store().await;
    let registry = Registry::new(store.clone(), fast_settings());
    let flow = registry.register("greetings", two_greetings).unwrap();

    assert!(matches!(flow.invoke("g1", ()).await, Err(InvocationError::Suspended)));
    let flow_id = FlowId::new("greetings", "g1");
    let row = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Suspended);

    send_greetings(&flow, "g1").await;

    wait_for_status(&store, &flow_id, Status::Succeeded, Duration::from_secs(5)).await;
    let panel = flow.control_panel("g1").await.unwrap().unwrap();
    assert_eq!(
        panel.result().unwrap(),
        Some(vec!["hello world".to_string(), "hello universe".to_string()])
    );
    assert_eq!(panel.messages().await.unwrap().len(), 2);
}

/// With an inline budget the flow picks the messages up without suspending.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_take_two_waits_inline() {
    init_tracing();
    let store = memory_store();
    let settings = fast_settings().with_max_inline_wait(Duration::from_secs(5));
    let registry = Registry::new(store.clone(), settings);
    let flow = registry.register("greetings", two_greetings).unwrap();

    let invoking = flow.clone();
    let invocation = tokio::spawn(async move { invoking.invoke("g2", ()).await });

    let flow_id = FlowId::new("greetings", "g2");
    wait_for_status(&store, &flow_id, Status::Executing, Duration::from_secs(5)).await;
    send_greetings(&flow, "g2").await;

    let greetings = invocation.await.unwrap().unwrap();
    assert_eq!(greetings, vec!["hello world", "hello universe"]);
}

/// Redelivering a message with a seen idempotency key does not resume the
/// suspended owner.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_message_does_not_resume_flow() {
    init_tracing();
    let store = memory_store();
    let registry = Registry::new(store.clone(), fast_settings());
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let flow = registry
        .register("greetings", move |_: (), workflow: Workflow| {
            counter.fetch_add(1, Ordering::SeqCst);
            two_greetings((), workflow)
        })
        .unwrap();

    assert!(matches!(flow.invoke("g3", ()).await, Err(InvocationError::Suspended)));
    let flow_id = FlowId::new("greetings", "g3");

    flow.send_message("g3", &"hello world".to_string(), Some("1"))
        .await
        .unwrap();
    eventually("second run", Duration::from_secs(5), || runs.load(Ordering::SeqCst) == 2).await;
    wait_for_status(&store, &flow_id, Status::Suspended, Duration::from_secs(5)).await;

    flow.send_message("g3", &"hello world".to_string(), Some("1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let row = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Suspended);

    flow.send_message("g3", &"hello universe".to_string(), None)
        .await
        .unwrap();
    wait_for_status(&store, &flow_id, Status::Succeeded, Duration::from_secs(5)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

/// Messages of other types and non-matching values are skipped.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chain_skips_unrelated_messages() {
    init_tracing();
    let store = memory_store();
    let registry = Registry::new(store.clone(), fast_settings());

    async fn approval(_: (), workflow: Workflow) -> FlowResult<Value> {
        workflow
            .messages()
            .of_type::<Value>()
            .filter(|event| event["kind"] == "approval")
            .first()
            .await
    }
    let flow = registry.register("approval", approval).unwrap();

    assert!(matches!(flow.invoke("a1", ()).await, Err(InvocationError::Suspended)));

    let writer = flow.message_writer("a1");
    writer.append(&"not json".to_string(), None).await.unwrap();
    writer.append(&json!({"kind": "comment"}), None).await.unwrap();
    writer
        .append(&json!({"kind": "approval", "by": "alice"}), None)
        .await
        .unwrap();

    let flow_id = writer.flow_id().clone();
    wait_for_status(&store, &flow_id, Status::Succeeded, Duration::from_secs(5)).await;

    let panel = flow.control_panel("a1").await.unwrap().unwrap();
    assert_eq!(panel.result().unwrap().unwrap()["by"], "alice");
}

/// A flow appending to its own log sees the message on replay.
#[tokio::test]
async fn test_flow_appends_to_own_log() {
    init_tracing();
    let registry = Registry::new(memory_store(), fast_settings());

    async fn echo(text: String, workflow: Workflow) -> FlowResult<String> {
        let messages = workflow.messages();
        messages.append(&text, Some("echo")).await?;
        messages.of_type::<String>().first().await
    }
    let flow = registry.register("echo", echo).unwrap();

    assert_eq!(flow.invoke("e1", "ping".to_string()).await.unwrap(), "ping");
    let panel = flow.control_panel("e1").await.unwrap().unwrap();
    assert_eq!(panel.messages().await.unwrap().len(), 1);
}

// ============================================================================
// Timeouts
// ============================================================================

/// The timeout watchdog completes a chain nobody wrote to.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_resumes_suspended_flow() {
    init_tracing();
    let store = memory_store();
    let registry = Registry::new(store.clone(), fast_settings());
    let flow = registry.register("reply", reply_or_nothing).unwrap();

    assert!(matches!(flow.invoke("t1", ()).await, Err(InvocationError::Suspended)));
    let flow_id = FlowId::new("reply", "t1");
    assert_eq!(store.timeouts().get_timeouts_for(&flow_id).await.unwrap().len(), 1);

    wait_for_status(&store, &flow_id, Status::Succeeded, Duration::from_secs(5)).await;
    let panel = flow.control_panel("t1").await.unwrap().unwrap();
    assert_eq!(panel.result().unwrap(), Some(None));
    assert!(store.timeouts().get_timeouts_for(&flow_id).await.unwrap().is_empty());
}

/// A message arriving before the timeout wins and the timeout is dropped.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_beats_timeout() {
    init_tracing();
    let store = memory_store();
    let registry = Registry::new(store.clone(), fast_settings());
    let flow = registry.register("reply", reply_or_nothing).unwrap();

    assert!(matches!(flow.invoke("t2", ()).await, Err(InvocationError::Suspended)));
    flow.send_message("t2", &"pong".to_string(), None).await.unwrap();

    let flow_id = FlowId::new("reply", "t2");
    wait_for_status(&store, &flow_id, Status::Succeeded, Duration::from_secs(5)).await;
    let panel = flow.control_panel("t2").await.unwrap().unwrap();
    assert_eq!(panel.result().unwrap(), Some(Some("pong".to_string())));
    assert!(store.timeouts().get_timeouts_for(&flow_id).await.unwrap().is_empty());
}

/// A chain that took its value before the timeout event landed in the log
/// completes normally, even when both are seen in the same evaluation.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_before_timeout_event_is_not_timed_out() {
    init_tracing();
    let store = memory_store();
    let registry = Registry::new(store.clone(), fast_settings());

    async fn acknowledged(_: (), workflow: Workflow) -> FlowResult<bool> {
        workflow
            .messages()
            .of_type::<String>()
            .timeout("ack", Duration::from_secs(5))
            .take(1)
            .completion()
            .await
    }
    let flow = registry.register("ack", acknowledged).unwrap();

    assert!(matches!(flow.invoke("k1", ()).await, Err(InvocationError::Suspended)));

    let flow_id = FlowId::new("ack", "k1");
    let ack = NewMessage::new(String::TYPE, serde_json::to_vec("ack").unwrap());
    let event = TimeoutEvent {
        timeout_id: "ack".to_string(),
        expiry: Utc::now(),
    };
    let fired = NewMessage::new(TimeoutEvent::TYPE, serde_json::to_vec(&event).unwrap())
        .with_idempotency_key(TimeoutEvent::idempotency_key("ack"));
    store
        .messages()
        .append_messages(&[(flow_id.clone(), ack), (flow_id.clone(), fired)], true)
        .await
        .unwrap();

    wait_for_status(&store, &flow_id, Status::Succeeded, Duration::from_secs(5)).await;
    let panel = flow.control_panel("k1").await.unwrap().unwrap();
    assert_eq!(panel.result().unwrap(), Some(true));
}
