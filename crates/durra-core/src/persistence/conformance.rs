// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Behavioural checks every backend must pass.
//!
//! Each check uses its own flow type so the whole suite can share one store.

use std::sync::Arc;

use chrono::{Duration, Utc};

use super::{FunctionState, FunctionStore};
use crate::types::{
    EffectChange, EffectId, FlowId, FlowType, NewMessage, Status, StoredEffect, StoredException,
    StoredTimeout, WorkStatus,
};

pub(crate) async fn run_all(store: &dyn FunctionStore) {
    create_is_first_writer_wins(store).await;
    create_postponed_starts_postponed(store).await;
    stale_epoch_writes_are_noops(store).await;
    leadership_takeover_bumps_epoch(store).await;
    renew_requires_executing_and_epoch(store).await;
    restart_clears_outcome(store).await;
    suspend_rejected_after_interrupt(store).await;
    append_flips_suspended_to_postponed(store).await;
    append_deduplicates_by_idempotency_key(store).await;
    duplicate_append_does_not_report_owner(store).await;
    append_batch_and_replace(store).await;
    barricade_rules(store).await;
    effects_upsert_and_delete(store).await;
    crashed_and_postponed_queries(store).await;
    timeouts_keep_or_overwrite(store).await;
    semaphore_is_fifo(store).await;
    correlations_index(store).await;
    delete_cascades(store).await;
    default_state_and_instances(store).await;
}

pub(crate) async fn racing_leaders(store: Arc<dyn FunctionStore>) {
    let flow_id = FlowId::new("conf-race", "1");
    let now = Utc::now();
    assert!(
        store
            .create_function(&flow_id, None, now, None, now)
            .await
            .unwrap()
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let flow_id = flow_id.clone();
        handles.push(tokio::spawn(async move {
            store
                .try_to_become_leader(&flow_id, 0, 1, Utc::now() + Duration::seconds(10))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one contender must win epoch 1");
    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.epoch, 1);
}

fn succeeded(result: &[u8]) -> FunctionState {
    FunctionState {
        status: Status::Succeeded,
        parameter: None,
        result: Some(result.to_vec()),
        exception: None,
        postponed_until: None,
        timestamp: Utc::now(),
    }
}

async fn create(store: &dyn FunctionStore, flow_id: &FlowId) {
    let now = Utc::now();
    assert!(
        store
            .create_function(flow_id, Some(b"param"), now + Duration::seconds(10), None, now)
            .await
            .unwrap()
    );
}

async fn create_is_first_writer_wins(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-create", "1");
    create(store, &flow_id).await;

    let now = Utc::now();
    let second = store
        .create_function(&flow_id, Some(b"other"), now, None, now)
        .await
        .unwrap();
    assert!(!second);

    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Executing);
    assert_eq!(stored.epoch, 0);
    assert_eq!(stored.interrupt_count, 0);
    assert_eq!(stored.parameter.as_deref(), Some(&b"param"[..]));
}

async fn create_postponed_starts_postponed(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-create-postponed", "1");
    let now = Utc::now();
    let until = now + Duration::seconds(30);
    assert!(
        store
            .create_function(&flow_id, None, now, Some(until), now)
            .await
            .unwrap()
    );

    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Postponed);
    assert_eq!(
        stored.postponed_until.map(|t| t.timestamp_millis()),
        Some(until.timestamp_millis())
    );
}

async fn stale_epoch_writes_are_noops(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-stale", "1");
    create(store, &flow_id).await;

    assert!(
        store
            .try_to_become_leader(&flow_id, 0, 1, Utc::now() + Duration::seconds(10))
            .await
            .unwrap()
    );

    // The old owner still believes it holds epoch 0.
    assert!(
        !store
            .set_function_state(&flow_id, &succeeded(b"stale"), 0)
            .await
            .unwrap()
    );
    assert!(
        !store
            .renew_lease(&flow_id, 0, Utc::now() + Duration::seconds(10))
            .await
            .unwrap()
    );
    assert!(
        !store
            .suspend_function(&flow_id, 0, Utc::now(), 0)
            .await
            .unwrap()
    );

    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Executing);
    assert_eq!(stored.epoch, 1);
    assert!(stored.result.is_none());

    assert!(
        store
            .set_function_state(&flow_id, &succeeded(b"done"), 1)
            .await
            .unwrap()
    );
    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Succeeded);
    assert_eq!(stored.epoch, 2);
    assert_eq!(stored.result.as_deref(), Some(&b"done"[..]));
    assert!(stored.parameter.is_none(), "state write replaces the row");

    let executing = FunctionState {
        status: Status::Executing,
        ..succeeded(b"x")
    };
    assert!(store.set_function_state(&flow_id, &executing, 2).await.is_err());
}

async fn leadership_takeover_bumps_epoch(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-leader", "1");
    create(store, &flow_id).await;
    let until = Utc::now() - Duration::seconds(1);
    let postpone = FunctionState {
        status: Status::Postponed,
        parameter: Some(b"param".to_vec()),
        result: None,
        exception: None,
        postponed_until: Some(until),
        timestamp: Utc::now(),
    };
    assert!(store.set_function_state(&flow_id, &postpone, 0).await.unwrap());

    assert!(
        !store
            .try_to_become_leader(&flow_id, 0, 2, Utc::now())
            .await
            .unwrap()
    );
    assert!(
        store
            .try_to_become_leader(&flow_id, 1, 2, Utc::now() + Duration::seconds(5))
            .await
            .unwrap()
    );

    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Executing);
    assert_eq!(stored.epoch, 2);
    assert_eq!(stored.parameter.as_deref(), Some(&b"param"[..]));
}

async fn renew_requires_executing_and_epoch(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-renew", "1");
    create(store, &flow_id).await;

    let later = Utc::now() + Duration::seconds(60);
    assert!(store.renew_lease(&flow_id, 0, later).await.unwrap());
    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(
        stored.lease_expiration.timestamp_millis(),
        later.timestamp_millis()
    );
    assert_eq!(stored.epoch, 0, "renewal keeps the epoch");

    assert!(store.suspend_function(&flow_id, 0, Utc::now(), 0).await.unwrap());
    assert!(!store.renew_lease(&flow_id, 1, later).await.unwrap());
    assert!(
        !store
            .renew_lease(&FlowId::new("conf-renew", "missing"), 0, later)
            .await
            .unwrap()
    );
}

async fn restart_clears_outcome(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-restart", "1");
    create(store, &flow_id).await;
    let failed = FunctionState {
        status: Status::Failed,
        parameter: Some(b"param".to_vec()),
        result: None,
        exception: Some(StoredException::new("boom", "it broke")),
        postponed_until: None,
        timestamp: Utc::now(),
    };
    assert!(store.set_function_state(&flow_id, &failed, 0).await.unwrap());

    assert!(
        store
            .restart_execution(&flow_id, 0, Utc::now())
            .await
            .unwrap()
            .is_none()
    );
    let restarted = store
        .restart_execution(&flow_id, 1, Utc::now() + Duration::seconds(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restarted.status, Status::Executing);
    assert_eq!(restarted.epoch, 2);
    assert!(restarted.exception.is_none());
    assert_eq!(restarted.parameter.as_deref(), Some(&b"param"[..]));
}

async fn suspend_rejected_after_interrupt(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-suspend", "1");
    create(store, &flow_id).await;

    let observed = store.get_interrupt_count(&flow_id).await.unwrap().unwrap();
    store.interrupt(std::slice::from_ref(&flow_id)).await.unwrap();

    assert!(
        !store
            .suspend_function(&flow_id, observed, Utc::now(), 0)
            .await
            .unwrap()
    );
    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Executing);
    assert_eq!(stored.interrupt_count, observed + 1);

    assert!(
        store
            .suspend_function(&flow_id, observed + 1, Utc::now(), 0)
            .await
            .unwrap()
    );
    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Suspended);
    assert_eq!(stored.epoch, 1);

    assert!(
        store
            .get_interrupt_count(&FlowId::new("conf-suspend", "missing"))
            .await
            .unwrap()
            .is_none()
    );
}

async fn append_flips_suspended_to_postponed(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-append-wake", "1");
    create(store, &flow_id).await;
    assert!(store.suspend_function(&flow_id, 0, Utc::now(), 0).await.unwrap());

    let observed = store
        .messages()
        .append_message(&flow_id, &NewMessage::new("greeting", b"hi".to_vec()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed.status, Status::Suspended);
    assert_eq!(observed.epoch, 1);

    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Postponed);
    assert_eq!(stored.interrupt_count, 1);
    assert!(stored.postponed_until.is_some());

    let due = store
        .get_postponed_functions(&flow_id.flow_type, Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].epoch, 1);

    let orphan = FlowId::new("conf-append-wake", "nobody");
    let status = store
        .messages()
        .append_message(&orphan, &NewMessage::new("greeting", b"hi".to_vec()))
        .await
        .unwrap();
    assert!(status.is_none());
    assert_eq!(store.messages().get_messages(&orphan, 0).await.unwrap().len(), 1);
}

async fn append_deduplicates_by_idempotency_key(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-append-dedupe", "1");
    create(store, &flow_id).await;
    let messages = store.messages();

    messages
        .append_message(
            &flow_id,
            &NewMessage::new("greeting", b"hello world".to_vec()).with_idempotency_key("1"),
        )
        .await
        .unwrap();
    messages
        .append_message(
            &flow_id,
            &NewMessage::new("greeting", b"hello again".to_vec()).with_idempotency_key("1"),
        )
        .await
        .unwrap();
    messages
        .append_message(&flow_id, &NewMessage::new("greeting", b"hello universe".to_vec()))
        .await
        .unwrap();

    let stored = messages.get_messages(&flow_id, 0).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].position, 0);
    assert_eq!(stored[0].content, b"hello world");
    assert_eq!(stored[1].position, 1);
    assert_eq!(stored[1].content, b"hello universe");

    let tail = messages.get_messages(&flow_id, 1).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].position, 1);
}

async fn duplicate_append_does_not_report_owner(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-append-duplicate", "1");
    create(store, &flow_id).await;
    let reply = NewMessage::new("reply", b"yes".to_vec()).with_idempotency_key("reply-1");

    let observed = store
        .messages()
        .append_message(&flow_id, &reply)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed.status, Status::Executing);

    assert!(store.suspend_function(&flow_id, 1, Utc::now(), 0).await.unwrap());

    // The redelivery appends nothing, so there is no owner to wake.
    let observed = store.messages().append_message(&flow_id, &reply).await.unwrap();
    assert!(observed.is_none());

    let stored = store.get_function(&flow_id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Suspended);
    assert_eq!(stored.interrupt_count, 1);
    assert_eq!(store.messages().get_messages(&flow_id, 0).await.unwrap().len(), 1);
}

async fn append_batch_and_replace(store: &dyn FunctionStore) {
    let first = FlowId::new("conf-append-batch", "1");
    let second = FlowId::new("conf-append-batch", "2");
    create(store, &first).await;
    create(store, &second).await;
    assert!(store.suspend_function(&second, 0, Utc::now(), 0).await.unwrap());

    store
        .messages()
        .append_messages(
            &[
                (first.clone(), NewMessage::new("a", b"1".to_vec())),
                (first.clone(), NewMessage::new("a", b"2".to_vec())),
                (second.clone(), NewMessage::new("b", b"3".to_vec())),
            ],
            true,
        )
        .await
        .unwrap();

    let logged = store.messages().get_messages(&first, 0).await.unwrap();
    assert_eq!(
        logged.iter().map(|m| m.position).collect::<Vec<_>>(),
        vec![0, 1]
    );
    let woken = store.get_function(&second).await.unwrap().unwrap();
    assert_eq!(woken.status, Status::Postponed);

    assert!(
        store
            .messages()
            .replace_message(&first, 1, &NewMessage::new("a", b"two".to_vec()))
            .await
            .unwrap()
    );
    assert!(
        !store
            .messages()
            .replace_message(&first, 7, &NewMessage::new("a", b"x".to_vec()))
            .await
            .unwrap()
    );
    let logged = store.messages().get_messages(&first, 1).await.unwrap();
    assert_eq!(logged[0].content, b"two");

    store.messages().truncate(&first).await.unwrap();
    assert!(store.messages().get_messages(&first, 0).await.unwrap().is_empty());
}

async fn barricade_rules(store: &dyn FunctionStore) {
    let running = FlowId::new("conf-barricade", "running");
    create(store, &running).await;
    assert!(!store.barricade_function(&running).await.unwrap());

    assert!(store.suspend_function(&running, 0, Utc::now(), 0).await.unwrap());
    assert!(store.barricade_function(&running).await.unwrap());
    let stored = store.get_function(&running).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Barricaded);
    assert_eq!(stored.epoch, 2);

    assert!(
        !store
            .try_to_become_leader(&running, 2, 3, Utc::now())
            .await
            .unwrap()
    );
    assert!(
        store
            .restart_execution(&running, 2, Utc::now())
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        !store
            .set_function_state(&running, &succeeded(b"x"), 2)
            .await
            .unwrap()
    );

    let unknown = FlowId::new("conf-barricade", "unknown");
    assert!(store.barricade_function(&unknown).await.unwrap());
    let now = Utc::now();
    assert!(
        !store
            .create_function(&unknown, None, now, None, now)
            .await
            .unwrap()
    );
}

async fn effects_upsert_and_delete(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-effects", "1");
    create(store, &flow_id).await;
    let effects = store.effects();

    effects
        .set_effect_result(&flow_id, &StoredEffect::started("charge"))
        .await
        .unwrap();
    effects
        .set_effect_result(
            &flow_id,
            &StoredEffect::completed("charge", Some(b"42".to_vec())),
        )
        .await
        .unwrap();

    let stored = effects.get_effect_results(&flow_id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].work_status, WorkStatus::Completed);
    assert_eq!(stored[0].result.as_deref(), Some(&b"42"[..]));

    effects
        .set_effect_results(
            &flow_id,
            &[
                EffectChange::Upsert(StoredEffect::failed(
                    "ship",
                    StoredException::new("carrier", "offline"),
                )),
                EffectChange::Delete(EffectId::new("charge")),
            ],
        )
        .await
        .unwrap();
    let stored = effects.get_effect_results(&flow_id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].effect_id.as_str(), "ship");
    assert_eq!(
        stored[0].exception.as_ref().map(|e| e.message.as_str()),
        Some("offline")
    );

    effects
        .delete_effect_result(&flow_id, &EffectId::new("ship"))
        .await
        .unwrap();
    assert!(effects.get_effect_results(&flow_id).await.unwrap().is_empty());
}

async fn crashed_and_postponed_queries(store: &dyn FunctionStore) {
    let flow_type = FlowType::new("conf-queries");
    let now = Utc::now();
    let expired = FlowId::new(flow_type.clone(), "expired");
    let alive = FlowId::new(flow_type.clone(), "alive");
    let later = FlowId::new(flow_type.clone(), "later");

    store
        .create_function(&expired, None, now - Duration::seconds(5), None, now)
        .await
        .unwrap();
    store
        .create_function(&alive, None, now + Duration::seconds(60), None, now)
        .await
        .unwrap();
    store
        .create_function(&later, None, now, Some(now + Duration::seconds(60)), now)
        .await
        .unwrap();

    let crashed = store.get_crashed_functions(&flow_type, now).await.unwrap();
    assert_eq!(crashed.len(), 1);
    assert_eq!(crashed[0].flow_id, expired);
    assert_eq!(crashed[0].epoch, 0);

    assert!(
        store
            .get_postponed_functions(&flow_type, now)
            .await
            .unwrap()
            .is_empty()
    );
    let due = store
        .get_postponed_functions(&flow_type, now + Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].flow_id, later);

    assert!(
        store
            .get_crashed_functions(&FlowType::new("conf-queries-other"), now)
            .await
            .unwrap()
            .is_empty()
    );
}

async fn timeouts_keep_or_overwrite(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-timeouts", "1");
    let now = Utc::now();
    let timeouts = store.timeouts();
    let first = StoredTimeout {
        flow_id: flow_id.clone(),
        timeout_id: "reply".to_string(),
        expiry: now + Duration::seconds(10),
    };
    let moved = StoredTimeout {
        expiry: now + Duration::seconds(20),
        ..first.clone()
    };

    timeouts.upsert_timeout(&first, false).await.unwrap();
    timeouts.upsert_timeout(&moved, false).await.unwrap();
    let stored = timeouts.get_timeouts_for(&flow_id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored[0].expiry.timestamp_millis(),
        first.expiry.timestamp_millis()
    );

    timeouts.upsert_timeout(&moved, true).await.unwrap();
    timeouts
        .upsert_timeout(
            &StoredTimeout {
                flow_id: flow_id.clone(),
                timeout_id: "early".to_string(),
                expiry: now + Duration::seconds(1),
            },
            false,
        )
        .await
        .unwrap();

    let due = timeouts
        .get_timeouts(&flow_id.flow_type, now + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(
        due.iter().map(|t| t.timeout_id.as_str()).collect::<Vec<_>>(),
        vec!["early", "reply"]
    );
    assert_eq!(
        timeouts
            .get_timeouts(&flow_id.flow_type, now + Duration::seconds(5))
            .await
            .unwrap()
            .len(),
        1
    );

    timeouts.remove_timeout(&flow_id, "early").await.unwrap();
    assert_eq!(timeouts.get_timeouts_for(&flow_id).await.unwrap().len(), 1);
}

async fn semaphore_is_fifo(store: &dyn FunctionStore) {
    let semaphores = store.semaphores();
    let holders: Vec<_> = (0..3)
        .map(|i| FlowId::new("conf-semaphore", i.to_string()))
        .collect();

    assert!(semaphores.acquire("printer", "main", &holders[0], 2).await.unwrap());
    assert!(semaphores.acquire("printer", "main", &holders[1], 2).await.unwrap());
    assert!(!semaphores.acquire("printer", "main", &holders[2], 2).await.unwrap());
    // Re-acquiring keeps the original place in the queue.
    assert!(semaphores.acquire("printer", "main", &holders[0], 2).await.unwrap());
    assert!(!semaphores.acquire("printer", "main", &holders[2], 2).await.unwrap());

    let window = semaphores
        .release("printer", "main", &holders[0], 2)
        .await
        .unwrap();
    assert_eq!(window, vec![holders[1].clone(), holders[2].clone()]);
    assert!(semaphores.acquire("printer", "main", &holders[2], 2).await.unwrap());

    let queued = semaphores.get_queued("printer", "main", 10).await.unwrap();
    assert_eq!(queued, vec![holders[1].clone(), holders[2].clone()]);
    assert!(
        semaphores
            .get_queued("printer", "other", 10)
            .await
            .unwrap()
            .is_empty()
    );
}

async fn correlations_index(store: &dyn FunctionStore) {
    let correlations = store.correlations();
    let a = FlowId::new("conf-correlations", "a");
    let b = FlowId::new("conf-correlations-other", "b");

    correlations.set_correlation(&a, "customer:7").await.unwrap();
    correlations.set_correlation(&a, "customer:7").await.unwrap();
    correlations.set_correlation(&a, "batch:1").await.unwrap();
    correlations.set_correlation(&b, "customer:7").await.unwrap();

    assert_eq!(
        correlations.get_correlations(&a).await.unwrap(),
        vec!["batch:1".to_string(), "customer:7".to_string()]
    );
    assert_eq!(
        correlations
            .get_flows_with_correlation(None, "customer:7")
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        correlations
            .get_flows_with_correlation(Some(&a.flow_type), "customer:7")
            .await
            .unwrap(),
        vec![a.clone()]
    );

    correlations.remove_correlation(&a, "batch:1").await.unwrap();
    assert_eq!(correlations.get_correlations(&a).await.unwrap().len(), 1);
}

async fn delete_cascades(store: &dyn FunctionStore) {
    let flow_id = FlowId::new("conf-delete", "1");
    create(store, &flow_id).await;
    store
        .effects()
        .set_effect_result(&flow_id, &StoredEffect::started("step"))
        .await
        .unwrap();
    store
        .messages()
        .append_message(&flow_id, &NewMessage::new("t", b"m".to_vec()))
        .await
        .unwrap();
    store
        .timeouts()
        .upsert_timeout(
            &StoredTimeout {
                flow_id: flow_id.clone(),
                timeout_id: "t".to_string(),
                expiry: Utc::now(),
            },
            true,
        )
        .await
        .unwrap();
    store
        .correlations()
        .set_correlation(&flow_id, "c")
        .await
        .unwrap();
    store
        .semaphores()
        .acquire("conf-delete", "s", &flow_id, 1)
        .await
        .unwrap();

    assert!(store.delete_function(&flow_id).await.unwrap());
    assert!(!store.delete_function(&flow_id).await.unwrap());

    assert!(store.get_function(&flow_id).await.unwrap().is_none());
    assert!(store.effects().get_effect_results(&flow_id).await.unwrap().is_empty());
    assert!(store.messages().get_messages(&flow_id, 0).await.unwrap().is_empty());
    assert!(store.timeouts().get_timeouts_for(&flow_id).await.unwrap().is_empty());
    assert!(store.correlations().get_correlations(&flow_id).await.unwrap().is_empty());
    assert!(
        store
            .semaphores()
            .get_queued("conf-delete", "s", 10)
            .await
            .unwrap()
            .is_empty()
    );
}

async fn default_state_and_instances(store: &dyn FunctionStore) {
    let flow_type = FlowType::new("conf-instances");
    let a = FlowId::new(flow_type.clone(), "a");
    let b = FlowId::new(flow_type.clone(), "b");
    create(store, &a).await;
    create(store, &b).await;
    assert!(store.suspend_function(&b, 0, Utc::now(), 0).await.unwrap());

    assert!(store.set_default_state(&a, Some(b"state")).await.unwrap());
    assert!(
        !store
            .set_default_state(&FlowId::new(flow_type.clone(), "missing"), None)
            .await
            .unwrap()
    );
    let stored = store.get_function(&a).await.unwrap().unwrap();
    assert_eq!(stored.default_state.as_deref(), Some(&b"state"[..]));

    assert_eq!(
        store.get_instances(&flow_type, None).await.unwrap(),
        vec![a.clone(), b.clone()]
    );
    assert_eq!(
        store
            .get_instances(&flow_type, Some(Status::Suspended))
            .await
            .unwrap(),
        vec![b]
    );
}
