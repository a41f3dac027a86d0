// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for durra-core.
//!
//! Products sharing a pool with durra can apply the schema themselves instead
//! of going through [`crate::persistence::SqliteStore::initialize`].
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use durra_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:.data/durra.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all store migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
