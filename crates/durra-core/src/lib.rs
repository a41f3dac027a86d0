// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durra Core - store contract for durable flows
//!
//! This crate defines what a durra deployment persists and how concurrent
//! executors coordinate through it. It contains no scheduling logic; the
//! engine lives in `durra-runtime`.
//!
//! # Storage model
//!
//! | Table | Key | Purpose |
//! |-------|-----|---------|
//! | functions | flow type, instance | status, epoch, lease, parameter, result |
//! | effects | flow id, effect id | memoized step results |
//! | messages | flow id, position | append-only inbox per instance |
//! | timeouts | flow id, timeout id | scheduled wake-ups |
//! | semaphores | group, instance, holder | FIFO permit queues |
//! | correlations | flow id, correlation | secondary lookup keys |
//!
//! # Epochs
//!
//! Every function row carries an epoch. Whoever moves the row to a new epoch
//! owns the next execution; writes from a stale epoch are rejected by the
//! store and reported as `false`/`None`. Leases are a liveness hint only:
//! a lapsed lease makes the function visible to the crash watchdog, but
//! safety comes from the epoch compare-and-swap.
//!
//! # Backends
//!
//! - [`persistence::InMemoryStore`] keeps everything in process memory
//! - [`persistence::SqliteStore`] persists to SQLite through sqlx (feature `sqlite`)
//!
//! ```ignore
//! use durra_core::persistence::{FunctionStore, SqliteStore};
//!
//! let store = SqliteStore::from_path(".data/durra.db").await?;
//! let function = store.get_function(&flow_id).await?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod error;
#[cfg(feature = "sqlite")]
pub mod migrations;
pub mod persistence;
pub mod types;

pub use config::{Config, ConfigError};
pub use error::{CoreError, Result};
pub use persistence::{
    CorrelationStore, EffectsStore, FunctionState, FunctionStore, InMemoryStore, MessageStore,
    SemaphoreStore, TimeoutStore,
};
#[cfg(feature = "sqlite")]
pub use persistence::SqliteStore;
pub use types::{
    EffectChange, EffectId, FlowId, FlowType, FunctionStatus, NewMessage, Status, StoredEffect,
    StoredException, StoredExecutingFunction, StoredFunction, StoredMessage,
    StoredPostponedFunction, StoredTimeout, WorkStatus,
};
