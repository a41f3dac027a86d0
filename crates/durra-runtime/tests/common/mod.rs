// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for durra-runtime integration tests.
//!
//! Provides stores, fast settings and polling helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use durra_core::{FlowId, FunctionStore, InMemoryStore, SqliteStore, Status, StoredFunction};
use durra_runtime::Settings;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Route engine logs to the test output. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn memory_store() -> Arc<dyn FunctionStore> {
    Arc::new(InMemoryStore::new())
}

pub async fn sqlite_store() -> Arc<dyn FunctionStore> {
    let store = SqliteStore::connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite store");
    Arc::new(store)
}

/// Short leases and fast watchdogs, no inline waiting.
pub fn fast_settings() -> Settings {
    Settings::default()
        .with_lease_length(Duration::from_millis(300))
        .with_watchdog_check_frequency(Duration::from_millis(50))
        .with_postponed_check_frequency(Duration::from_millis(50))
        .with_timeout_check_frequency(Duration::from_millis(50))
        .with_message_pull_frequency(Duration::from_millis(10))
        .with_max_inline_wait(Duration::ZERO)
}

/// Unique instance name, so tests sharing a store never collide.
pub fn instance(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Poll until `flow_id` reaches `status`, panicking after `timeout`.
pub async fn wait_for_status(
    store: &Arc<dyn FunctionStore>,
    flow_id: &FlowId,
    status: Status,
    timeout: Duration,
) -> StoredFunction {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let function = store
            .get_function(flow_id)
            .await
            .expect("Failed to read function");
        if let Some(function) = function
            && function.status == status
        {
            return function;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{} did not reach {} within {:?}", flow_id, status, timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `condition` holds, panicking after `timeout`.
pub async fn eventually<F>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
