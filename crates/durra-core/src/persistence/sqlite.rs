// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! Every compare-and-swap is a single conditional `UPDATE` whose
//! `rows_affected` decides the outcome. Multi-row operations run in one
//! transaction and always write before they read, so a deferred transaction
//! takes the write lock up front.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use crate::error::CoreError;
use crate::migrations;
use crate::types::{
    EffectChange, EffectId, FlowId, FlowType, FunctionStatus, NewMessage, Status,
    StoredEffect, StoredException, StoredExecutingFunction, StoredFunction, StoredMessage,
    StoredPostponedFunction, StoredTimeout, from_millis, to_millis,
};

use super::{
    CorrelationStore, EffectsStore, FunctionState, FunctionStore, MessageStore, SemaphoreStore,
    TimeoutStore,
};

const FUNCTION_COLUMNS: &str = "flow_type, instance, parameter, result, exception, status, \
     postponed_until, epoch, lease_expiration, interrupt_count, timestamp, default_state";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Call [`FunctionStore::initialize`] before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and apply migrations.
    ///
    /// Parent directories are created when missing.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/durra.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a SQLite URL (e.g. `sqlite::memory:` or `sqlite:app.db?mode=rwc`)
    /// and apply migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        // An in-memory database lives and dies with its single connection.
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct FunctionRow {
    flow_type: String,
    instance: String,
    parameter: Option<Vec<u8>>,
    result: Option<Vec<u8>>,
    exception: Option<String>,
    status: String,
    postponed_until: Option<i64>,
    epoch: i32,
    lease_expiration: i64,
    interrupt_count: i64,
    timestamp: i64,
    default_state: Option<Vec<u8>>,
}

impl TryFrom<FunctionRow> for StoredFunction {
    type Error = CoreError;

    fn try_from(row: FunctionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            flow_id: FlowId::new(row.flow_type, row.instance),
            parameter: row.parameter,
            result: row.result,
            exception: decode_exception(row.exception)?,
            status: row.status.parse()?,
            postponed_until: row.postponed_until.map(from_millis).transpose()?,
            epoch: row.epoch,
            lease_expiration: from_millis(row.lease_expiration)?,
            interrupt_count: row.interrupt_count,
            timestamp: from_millis(row.timestamp)?,
            default_state: row.default_state,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EffectRow {
    effect_id: String,
    work_status: String,
    result: Option<Vec<u8>>,
    exception: Option<String>,
}

impl TryFrom<EffectRow> for StoredEffect {
    type Error = CoreError;

    fn try_from(row: EffectRow) -> Result<Self, Self::Error> {
        Ok(Self {
            effect_id: EffectId::new(row.effect_id),
            work_status: row.work_status.parse()?,
            result: row.result,
            exception: decode_exception(row.exception)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    position: i64,
    content: Vec<u8>,
    message_type: String,
    idempotency_key: Option<String>,
}

impl From<MessageRow> for StoredMessage {
    fn from(row: MessageRow) -> Self {
        Self {
            position: row.position,
            content: row.content,
            message_type: row.message_type,
            idempotency_key: row.idempotency_key,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TimeoutRow {
    flow_type: String,
    instance: String,
    timeout_id: String,
    expiry: i64,
}

impl TryFrom<TimeoutRow> for StoredTimeout {
    type Error = CoreError;

    fn try_from(row: TimeoutRow) -> Result<Self, Self::Error> {
        Ok(Self {
            flow_id: FlowId::new(row.flow_type, row.instance),
            timeout_id: row.timeout_id,
            expiry: from_millis(row.expiry)?,
        })
    }
}

fn encode_exception(exception: Option<&StoredException>) -> Result<Option<String>, CoreError> {
    exception
        .map(|e| serde_json::to_string(e).map_err(|err| CoreError::serialization("exception", err)))
        .transpose()
}

fn decode_exception(raw: Option<String>) -> Result<Option<StoredException>, CoreError> {
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|err| CoreError::serialization("exception", err))
    })
    .transpose()
}

fn flow_ids(rows: Vec<(String, String)>) -> Vec<FlowId> {
    rows.into_iter()
        .map(|(flow_type, instance)| FlowId::new(flow_type, instance))
        .collect()
}

async fn interrupt_one(
    conn: &mut SqliteConnection,
    flow_id: &FlowId,
    now: i64,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE functions
        SET interrupt_count = interrupt_count + 1,
            postponed_until = CASE WHEN status = 'suspended' THEN ? ELSE postponed_until END,
            status = CASE WHEN status = 'suspended' THEN 'postponed' ELSE status END
        WHERE flow_type = ? AND instance = ?
        "#,
    )
    .bind(now)
    .bind(flow_id.flow_type.as_str())
    .bind(&flow_id.instance)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Returns whether a row was written; `false` means the idempotency key was taken.
async fn insert_message(
    conn: &mut SqliteConnection,
    flow_id: &FlowId,
    message: &NewMessage,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO messages (flow_type, instance, position, content, message_type, idempotency_key)
        SELECT ?, ?, COALESCE(MAX(position) + 1, 0), ?, ?, ?
        FROM messages
        WHERE flow_type = ? AND instance = ?
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(flow_id.flow_type.as_str())
    .bind(&flow_id.instance)
    .bind(&message.content)
    .bind(&message.message_type)
    .bind(message.idempotency_key.as_deref())
    .bind(flow_id.flow_type.as_str())
    .bind(&flow_id.instance)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn upsert_effect(
    conn: &mut SqliteConnection,
    flow_id: &FlowId,
    effect: &StoredEffect,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO effects (flow_type, instance, effect_id, work_status, result, exception)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (flow_type, instance, effect_id) DO UPDATE
        SET work_status = excluded.work_status,
            result = excluded.result,
            exception = excluded.exception
        "#,
    )
    .bind(flow_id.flow_type.as_str())
    .bind(&flow_id.instance)
    .bind(effect.effect_id.as_str())
    .bind(effect.work_status.as_str())
    .bind(effect.result.as_deref())
    .bind(encode_exception(effect.exception.as_ref())?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_effect(
    conn: &mut SqliteConnection,
    flow_id: &FlowId,
    effect_id: &EffectId,
) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM effects WHERE flow_type = ? AND instance = ? AND effect_id = ?")
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(effect_id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn semaphore_window(
    conn: &mut SqliteConnection,
    group: &str,
    instance: &str,
    count: usize,
) -> Result<Vec<FlowId>, CoreError> {
    let rows = sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT holder_type, holder_instance
        FROM semaphores
        WHERE group_id = ? AND instance = ?
        ORDER BY id
        LIMIT ?
        "#,
    )
    .bind(group)
    .bind(instance)
    .bind(count as i64)
    .fetch_all(&mut *conn)
    .await?;
    Ok(flow_ids(rows))
}

#[async_trait]
impl FunctionStore for SqliteStore {
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
        migrations::SQLITE.run(&self.pool).await?;
        Ok(())
    }

    async fn truncate_all(&self) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "functions",
            "effects",
            "messages",
            "timeouts",
            "semaphores",
            "correlations",
        ] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, parameter), fields(flow_id = %flow_id))]
    async fn create_function(
        &self,
        flow_id: &FlowId,
        parameter: Option<&[u8]>,
        lease_expiration: DateTime<Utc>,
        postpone_until: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let status = if postpone_until.is_some() {
            Status::Postponed
        } else {
            Status::Executing
        };

        let result = sqlx::query(
            r#"
            INSERT INTO functions
                (flow_type, instance, parameter, status, postponed_until, epoch,
                 lease_expiration, interrupt_count, timestamp)
            VALUES (?, ?, ?, ?, ?, 0, ?, 0, ?)
            ON CONFLICT (flow_type, instance) DO NOTHING
            "#,
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(parameter)
        .bind(status.as_str())
        .bind(postpone_until.map(to_millis))
        .bind(to_millis(lease_expiration))
        .bind(to_millis(timestamp))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn restart_execution(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<Option<StoredFunction>, CoreError> {
        let row = sqlx::query_as::<_, FunctionRow>(&format!(
            r#"
            UPDATE functions
            SET status = 'executing', epoch = epoch + 1, lease_expiration = ?,
                postponed_until = NULL, result = NULL, exception = NULL, timestamp = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ? AND status != 'barricaded'
            RETURNING {}
            "#,
            FUNCTION_COLUMNS
        ))
        .bind(to_millis(lease_expiration))
        .bind(to_millis(Utc::now()))
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(expected_epoch)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredFunction::try_from).transpose()
    }

    async fn renew_lease(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET lease_expiration = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ? AND status = 'executing'
            "#,
        )
        .bind(to_millis(lease_expiration))
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn try_to_become_leader(
        &self,
        flow_id: &FlowId,
        expected_epoch: i32,
        new_epoch: i32,
        lease_expiration: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = 'executing', epoch = ?, lease_expiration = ?, timestamp = ?
            WHERE flow_type = ? AND instance = ? AND epoch = ? AND status != 'barricaded'
            "#,
        )
        .bind(new_epoch)
        .bind(to_millis(lease_expiration))
        .bind(to_millis(Utc::now()))
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, state), fields(flow_id = %flow_id, status = %state.status))]
    async fn set_function_state(
        &self,
        flow_id: &FlowId,
        state: &FunctionState,
        expected_epoch: i32,
    ) -> Result<bool, CoreError> {
        state.validate()?;

        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = ?, parameter = ?, result = ?, exception = ?, postponed_until = ?,
                timestamp = ?, epoch = epoch + 1
            WHERE flow_type = ? AND instance = ? AND epoch = ? AND status != 'barricaded'
            "#,
        )
        .bind(state.status.as_str())
        .bind(state.parameter.as_deref())
        .bind(state.result.as_deref())
        .bind(encode_exception(state.exception.as_ref())?)
        .bind(state.postponed_until.map(to_millis))
        .bind(to_millis(state.timestamp))
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, timestamp), fields(flow_id = %flow_id))]
    async fn suspend_function(
        &self,
        flow_id: &FlowId,
        expected_interrupt_count: i64,
        timestamp: DateTime<Utc>,
        expected_epoch: i32,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = 'suspended', postponed_until = NULL, timestamp = ?, epoch = epoch + 1
            WHERE flow_type = ? AND instance = ? AND epoch = ?
              AND status = 'executing' AND interrupt_count = ?
            "#,
        )
        .bind(to_millis(timestamp))
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(expected_epoch)
        .bind(expected_interrupt_count)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn interrupt(&self, flow_ids: &[FlowId]) -> Result<(), CoreError> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        for flow_id in flow_ids {
            interrupt_one(&mut tx, flow_id, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_interrupt_count(&self, flow_id: &FlowId) -> Result<Option<i64>, CoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT interrupt_count FROM functions WHERE flow_type = ? AND instance = ?",
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count)
    }

    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn barricade_function(&self, flow_id: &FlowId) -> Result<bool, CoreError> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE functions
            SET status = 'barricaded', postponed_until = NULL, epoch = epoch + 1, timestamp = ?
            WHERE flow_type = ? AND instance = ? AND status != 'executing'
            "#,
        )
        .bind(now)
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let barricaded = if updated {
            true
        } else {
            sqlx::query(
                r#"
                INSERT INTO functions
                    (flow_type, instance, status, epoch, lease_expiration, interrupt_count, timestamp)
                VALUES (?, ?, 'barricaded', 0, ?, 0, ?)
                ON CONFLICT (flow_type, instance) DO NOTHING
                "#,
            )
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0
        };

        tx.commit().await?;
        Ok(barricaded)
    }

    async fn set_default_state(
        &self,
        flow_id: &FlowId,
        state: Option<&[u8]>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE functions SET default_state = ? WHERE flow_type = ? AND instance = ?",
        )
        .bind(state)
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_function(&self, flow_id: &FlowId) -> Result<Option<StoredFunction>, CoreError> {
        let row = sqlx::query_as::<_, FunctionRow>(&format!(
            "SELECT {} FROM functions WHERE flow_type = ? AND instance = ?",
            FUNCTION_COLUMNS
        ))
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredFunction::try_from).transpose()
    }

    async fn get_crashed_functions(
        &self,
        flow_type: &FlowType,
        lease_expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredExecutingFunction>, CoreError> {
        let rows = sqlx::query_as::<_, (String, i32, i64)>(
            r#"
            SELECT instance, epoch, lease_expiration
            FROM functions
            WHERE flow_type = ? AND status = 'executing' AND lease_expiration < ?
            ORDER BY lease_expiration
            "#,
        )
        .bind(flow_type.as_str())
        .bind(to_millis(lease_expires_before))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(instance, epoch, lease)| {
                Ok(StoredExecutingFunction {
                    flow_id: FlowId::new(flow_type.clone(), instance),
                    epoch,
                    lease_expiration: from_millis(lease)?,
                })
            })
            .collect()
    }

    async fn get_postponed_functions(
        &self,
        flow_type: &FlowType,
        expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredPostponedFunction>, CoreError> {
        let rows = sqlx::query_as::<_, (String, i32, i64)>(
            r#"
            SELECT instance, epoch, postponed_until
            FROM functions
            WHERE flow_type = ? AND status = 'postponed'
              AND postponed_until IS NOT NULL AND postponed_until <= ?
            ORDER BY postponed_until
            "#,
        )
        .bind(flow_type.as_str())
        .bind(to_millis(expires_before))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(instance, epoch, until)| {
                Ok(StoredPostponedFunction {
                    flow_id: FlowId::new(flow_type.clone(), instance),
                    epoch,
                    postponed_until: from_millis(until)?,
                })
            })
            .collect()
    }

    async fn get_instances(
        &self,
        flow_type: &FlowType,
        status: Option<Status>,
    ) -> Result<Vec<FlowId>, CoreError> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT flow_type, instance
            FROM functions
            WHERE flow_type = ? AND (? IS NULL OR status = ?)
            ORDER BY instance
            "#,
        )
        .bind(flow_type.as_str())
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(flow_ids(rows))
    }

    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn delete_function(&self, flow_id: &FlowId) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let existed = sqlx::query("DELETE FROM functions WHERE flow_type = ? AND instance = ?")
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        for table in ["effects", "messages", "timeouts", "correlations"] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE flow_type = ? AND instance = ?",
                table
            ))
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM semaphores WHERE holder_type = ? AND holder_instance = ?")
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(existed, "Function deleted");
        Ok(existed)
    }
}

#[async_trait]
impl EffectsStore for SqliteStore {
    async fn set_effect_result(
        &self,
        flow_id: &FlowId,
        effect: &StoredEffect,
    ) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_effect(&mut conn, flow_id, effect).await
    }

    async fn set_effect_results(
        &self,
        flow_id: &FlowId,
        changes: &[EffectChange],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for change in changes {
            match change {
                EffectChange::Upsert(effect) => upsert_effect(&mut tx, flow_id, effect).await?,
                EffectChange::Delete(effect_id) => delete_effect(&mut tx, flow_id, effect_id).await?,
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_effect_results(&self, flow_id: &FlowId) -> Result<Vec<StoredEffect>, CoreError> {
        let rows = sqlx::query_as::<_, EffectRow>(
            r#"
            SELECT effect_id, work_status, result, exception
            FROM effects
            WHERE flow_type = ? AND instance = ?
            ORDER BY rowid
            "#,
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredEffect::try_from).collect()
    }

    async fn delete_effect_result(
        &self,
        flow_id: &FlowId,
        effect_id: &EffectId,
    ) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        delete_effect(&mut conn, flow_id, effect_id).await
    }

    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM effects WHERE flow_type = ? AND instance = ?")
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    #[instrument(skip(self, message), fields(flow_id = %flow_id, message_type = %message.message_type))]
    async fn append_message(
        &self,
        flow_id: &FlowId,
        message: &NewMessage,
    ) -> Result<Option<FunctionStatus>, CoreError> {
        let mut tx = self.pool.begin().await?;

        if !insert_message(&mut tx, flow_id, message).await? {
            debug!(key = ?message.idempotency_key, "Duplicate message dropped");
            tx.commit().await?;
            return Ok(None);
        }

        let observed = sqlx::query_as::<_, (String, i32)>(
            "SELECT status, epoch FROM functions WHERE flow_type = ? AND instance = ?",
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .fetch_optional(&mut *tx)
        .await?;

        interrupt_one(&mut tx, flow_id, to_millis(Utc::now())).await?;
        tx.commit().await?;

        observed
            .map(|(status, epoch)| {
                Ok(FunctionStatus {
                    status: status.parse()?,
                    epoch,
                })
            })
            .transpose()
    }

    async fn append_messages(
        &self,
        messages: &[(FlowId, NewMessage)],
        interrupt: bool,
    ) -> Result<(), CoreError> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut touched: Vec<&FlowId> = Vec::new();

        for (flow_id, message) in messages {
            if insert_message(&mut tx, flow_id, message).await? && !touched.contains(&flow_id) {
                touched.push(flow_id);
            }
        }

        if interrupt {
            for flow_id in touched {
                interrupt_one(&mut tx, flow_id, now).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_messages(
        &self,
        flow_id: &FlowId,
        skip: i64,
    ) -> Result<Vec<StoredMessage>, CoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT position, content, message_type, idempotency_key
            FROM messages
            WHERE flow_type = ? AND instance = ? AND position >= ?
            ORDER BY position
            "#,
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredMessage::from).collect())
    }

    async fn replace_message(
        &self,
        flow_id: &FlowId,
        position: i64,
        message: &NewMessage,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = ?, message_type = ?, idempotency_key = ?
            WHERE flow_type = ? AND instance = ? AND position = ?
            "#,
        )
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(message.idempotency_key.as_deref())
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(position)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn truncate(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM messages WHERE flow_type = ? AND instance = ?")
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TimeoutStore for SqliteStore {
    async fn upsert_timeout(
        &self,
        timeout: &StoredTimeout,
        overwrite: bool,
    ) -> Result<(), CoreError> {
        let on_conflict = if overwrite {
            "DO UPDATE SET expiry = excluded.expiry"
        } else {
            "DO NOTHING"
        };

        sqlx::query(&format!(
            r#"
            INSERT INTO timeouts (flow_type, instance, timeout_id, expiry)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (flow_type, instance, timeout_id) {}
            "#,
            on_conflict
        ))
        .bind(timeout.flow_id.flow_type.as_str())
        .bind(&timeout.flow_id.instance)
        .bind(&timeout.timeout_id)
        .bind(to_millis(timeout.expiry))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_timeout(&self, flow_id: &FlowId, timeout_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM timeouts WHERE flow_type = ? AND instance = ? AND timeout_id = ?")
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .bind(timeout_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_timeouts(
        &self,
        flow_type: &FlowType,
        expires_before: DateTime<Utc>,
    ) -> Result<Vec<StoredTimeout>, CoreError> {
        let rows = sqlx::query_as::<_, TimeoutRow>(
            r#"
            SELECT flow_type, instance, timeout_id, expiry
            FROM timeouts
            WHERE flow_type = ? AND expiry <= ?
            ORDER BY expiry
            "#,
        )
        .bind(flow_type.as_str())
        .bind(to_millis(expires_before))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredTimeout::try_from).collect()
    }

    async fn get_timeouts_for(&self, flow_id: &FlowId) -> Result<Vec<StoredTimeout>, CoreError> {
        let rows = sqlx::query_as::<_, TimeoutRow>(
            r#"
            SELECT flow_type, instance, timeout_id, expiry
            FROM timeouts
            WHERE flow_type = ? AND instance = ?
            ORDER BY timeout_id
            "#,
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredTimeout::try_from).collect()
    }

    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM timeouts WHERE flow_type = ? AND instance = ?")
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SemaphoreStore for SqliteStore {
    #[instrument(skip(self), fields(holder = %holder))]
    async fn acquire(
        &self,
        group: &str,
        instance: &str,
        holder: &FlowId,
        maximum_count: usize,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO semaphores (group_id, instance, holder_type, holder_instance)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (group_id, instance, holder_type, holder_instance) DO NOTHING
            "#,
        )
        .bind(group)
        .bind(instance)
        .bind(holder.flow_type.as_str())
        .bind(&holder.instance)
        .execute(&mut *tx)
        .await?;

        let window = semaphore_window(&mut tx, group, instance, maximum_count).await?;
        tx.commit().await?;

        Ok(window.contains(holder))
    }

    #[instrument(skip(self), fields(holder = %holder))]
    async fn release(
        &self,
        group: &str,
        instance: &str,
        holder: &FlowId,
        maximum_count: usize,
    ) -> Result<Vec<FlowId>, CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM semaphores
            WHERE group_id = ? AND instance = ? AND holder_type = ? AND holder_instance = ?
            "#,
        )
        .bind(group)
        .bind(instance)
        .bind(holder.flow_type.as_str())
        .bind(&holder.instance)
        .execute(&mut *tx)
        .await?;

        let window = semaphore_window(&mut tx, group, instance, maximum_count).await?;
        tx.commit().await?;
        Ok(window)
    }

    async fn get_queued(
        &self,
        group: &str,
        instance: &str,
        count: usize,
    ) -> Result<Vec<FlowId>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        semaphore_window(&mut conn, group, instance, count).await
    }
}

#[async_trait]
impl CorrelationStore for SqliteStore {
    async fn set_correlation(&self, flow_id: &FlowId, correlation: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO correlations (flow_type, instance, correlation)
            VALUES (?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(correlation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_correlations(&self, flow_id: &FlowId) -> Result<Vec<String>, CoreError> {
        let correlations = sqlx::query_scalar::<_, String>(
            r#"
            SELECT correlation FROM correlations
            WHERE flow_type = ? AND instance = ?
            ORDER BY correlation
            "#,
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .fetch_all(&self.pool)
        .await?;
        Ok(correlations)
    }

    async fn get_flows_with_correlation(
        &self,
        flow_type: Option<&FlowType>,
        correlation: &str,
    ) -> Result<Vec<FlowId>, CoreError> {
        let flow_type = flow_type.map(FlowType::as_str);
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT flow_type, instance FROM correlations
            WHERE correlation = ? AND (? IS NULL OR flow_type = ?)
            ORDER BY flow_type, instance
            "#,
        )
        .bind(correlation)
        .bind(flow_type)
        .bind(flow_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(flow_ids(rows))
    }

    async fn remove_correlation(
        &self,
        flow_id: &FlowId,
        correlation: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "DELETE FROM correlations WHERE flow_type = ? AND instance = ? AND correlation = ?",
        )
        .bind(flow_id.flow_type.as_str())
        .bind(&flow_id.instance)
        .bind(correlation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM correlations WHERE flow_type = ? AND instance = ?")
            .bind(flow_id.flow_type.as_str())
            .bind(&flow_id.instance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
