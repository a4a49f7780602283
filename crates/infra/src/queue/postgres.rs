//! PostgreSQL-backed work-item store.
//!
//! Every operation that changes lease state runs as one short transaction on
//! its own pooled connection: `SELECT ... FOR UPDATE` on the row, the same
//! `WorkItem` method the in-memory store uses, then a full-row `UPDATE`. The
//! row lock makes the check and the write a single atomic step across any
//! number of worker processes. `renew`, `mark_running` and `arm` are single
//! conditional `UPDATE`s.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` (`AlreadyExists` on insert) |
//! | Database (check constraint violation) | `23514` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};

use workforge_core::{
    Claimability, FailureClass, Parameter, Schedule, Transition, WorkItem, WorkItemId,
    WorkItemStatus, WorkItemUpdate, WorkerId,
};

use super::store::{ClaimedRow, StoreError, WorkItemFilter, WorkItemStats, WorkItemStore};

const SELECT_COLUMNS: &str = r#"
    SELECT
        id, work_type, status, payload, step, attempts, max_attempts, priority,
        lock_owner, lock_acquired_at, next_execution_at, last_executed_at,
        enabled, parameters, schedule, last_error, failure_class,
        created_at, updated_at
    FROM work_items
"#;

const CANDIDATE_ORDER: &str =
    "ORDER BY priority DESC, next_execution_at ASC NULLS LAST, id ASC";

/// PostgreSQL work-item store.
///
/// `Send + Sync`; clone freely, the pool is shared.
#[derive(Debug, Clone)]
pub struct PostgresWorkItemStore {
    pool: Arc<PgPool>,
}

impl PostgresWorkItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `work_items` table and its candidate index if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                id UUID PRIMARY KEY,
                work_type TEXT NOT NULL,
                status TEXT NOT NULL,
                payload JSONB NOT NULL,
                step TEXT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                lock_owner TEXT NULL,
                lock_acquired_at TIMESTAMPTZ NULL,
                next_execution_at TIMESTAMPTZ NULL,
                last_executed_at TIMESTAMPTZ NULL,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                parameters JSONB NOT NULL DEFAULT '[]'::jsonb,
                schedule JSONB NULL,
                last_error TEXT NULL,
                failure_class TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT work_items_attempts_within_budget
                    CHECK (attempts >= 0 AND attempts <= max_attempts)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_work_items", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS work_items_candidates_idx
                ON work_items (enabled, status, priority DESC, next_execution_at)
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_work_items_index", e))?;

        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    /// Lock one row, run `f` on it and write it back, all in one transaction.
    ///
    /// `f` returning `Ok(None)` means "nothing to change": the transaction is
    /// rolled back and `Ok(None)` returned. A missing row is `NotFound`.
    /// With `skip_locked`, a row held by a concurrent transaction reads as
    /// `Ok(None)` instead of waiting.
    async fn with_locked_row<R, F>(
        &self,
        operation: &str,
        id: WorkItemId,
        skip_locked: bool,
        f: F,
    ) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&mut WorkItem) -> Result<Option<R>, StoreError> + Send,
        R: Send,
    {
        let mut tx = self.begin(operation).await?;

        let lock = if skip_locked {
            "WHERE id = $1 FOR UPDATE SKIP LOCKED"
        } else {
            "WHERE id = $1 FOR UPDATE"
        };
        let row = sqlx::query(&format!("{SELECT_COLUMNS} {lock}"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return if skip_locked {
                Ok(None)
            } else {
                Err(StoreError::NotFound(id))
            };
        };

        let mut item = decode_row(&row)?;
        let result = match f(&mut item) {
            Ok(Some(result)) => result,
            Ok(None) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Ok(None);
            }
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        };

        write_row(&mut tx, &item, operation).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(result))
    }

    async fn fetch_items(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl WorkItemStore for PostgresWorkItemStore {
    #[instrument(
        skip(self, item),
        fields(work_item_id = %item.id, work_type = %item.work_type),
        err
    )]
    async fn insert(&self, item: WorkItem) -> Result<WorkItemId, StoreError> {
        item.validate()?;
        let parameters = serde_json::to_value(&item.parameters)?;
        let schedule = item.schedule.as_ref().map(serde_json::to_value).transpose()?;
        let (attempts, max_attempts) = attempt_columns(&item)?;

        sqlx::query(
            r#"
            INSERT INTO work_items (
                id, work_type, status, payload, step, attempts, max_attempts, priority,
                lock_owner, lock_acquired_at, next_execution_at, last_executed_at,
                enabled, parameters, schedule, last_error, failure_class,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(&item.work_type)
        .bind(item.status.as_str())
        .bind(&item.payload)
        .bind(&item.step)
        .bind(attempts)
        .bind(max_attempts)
        .bind(item.priority)
        .bind(item.lock_owner.as_ref().map(WorkerId::as_str))
        .bind(item.lock_acquired_at)
        .bind(item.next_execution_at)
        .bind(item.last_executed_at)
        .bind(item.enabled)
        .bind(&parameters)
        .bind(&schedule)
        .bind(&item.last_error)
        .bind(item.failure_class.map(|c| c.as_str()))
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(item.id)
            } else {
                map_sqlx_error("insert_work_item", e)
            }
        })?;

        Ok(item.id)
    }

    #[instrument(skip(self), fields(work_item_id = %id), err)]
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_work_item", e))?;
        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self, update), fields(work_item_id = %id), err)]
    async fn update_definition(
        &self,
        id: WorkItemId,
        update: &WorkItemUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, StoreError> {
        self.with_locked_row("update_definition", id, false, |item| {
            item.apply_update(update, now)?;
            Ok(Some(item.clone()))
        })
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self), fields(work_item_id = %id), err)]
    async fn delete(&self, id: WorkItemId) -> Result<(), StoreError> {
        let mut tx = self.begin("delete_work_item").await?;

        let owner: Option<Option<String>> =
            sqlx::query_scalar("SELECT lock_owner FROM work_items WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_work_item", e))?;

        match owner {
            None => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                Err(StoreError::NotFound(id))
            }
            Some(Some(owner)) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                Err(StoreError::Conflict(format!(
                    "work item {id} is leased by {owner}"
                )))
            }
            Some(None) => {
                sqlx::query("DELETE FROM work_items WHERE id = $1")
                    .bind(id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("delete_work_item", e))?;
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(())
            }
        }
    }

    #[instrument(skip(self), fields(work_item_id = %id), err)]
    async fn set_enabled(
        &self,
        id: WorkItemId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, StoreError> {
        self.with_locked_row("set_enabled", id, false, |item| {
            item.set_enabled(enabled, now);
            Ok(Some(item.clone()))
        })
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self), fields(work_item_id = %id), err)]
    async fn force_run(&self, id: WorkItemId, now: DateTime<Utc>) -> Result<WorkItem, StoreError> {
        self.with_locked_row("force_run", id, false, |item| {
            item.force_run(now)?;
            Ok(Some(item.clone()))
        })
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self, lease_duration), fields(candidate_count = tracing::field::Empty), err)]
    async fn find_candidates(
        &self,
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let stale_before = now - to_chrono(lease_duration);
        let sql = format!(
            r#"{SELECT_COLUMNS}
            WHERE enabled
              AND (
                (lock_owner IS NULL
                    AND status IN ('pending', 'retry_wait')
                    AND next_execution_at <= $1)
                OR
                (lock_owner IS NOT NULL
                    AND status IN ('leased', 'running')
                    AND (lock_acquired_at IS NULL OR lock_acquired_at < $2))
              )
            {CANDIDATE_ORDER}
            LIMIT $3
            "#
        );
        let items = self
            .fetch_items(
                "find_candidates",
                sqlx::query(&sql)
                    .bind(now)
                    .bind(stale_before)
                    .bind(limit as i64),
            )
            .await?;

        Span::current().record("candidate_count", items.len());
        Ok(items)
    }

    #[instrument(
        skip(self, lease_duration),
        fields(work_item_id = %id, worker_id = %worker),
        err
    )]
    async fn try_claim(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRow>, StoreError> {
        self.with_locked_row("try_claim", id, true, |item| {
            match item.claimability(now, lease_duration) {
                Claimability::NotClaimable => Ok(None),
                claimability => {
                    let reclaimed_from = item.lease_to(worker, now, claimability)?;
                    Ok(Some(ClaimedRow {
                        item: item.clone(),
                        reclaimed_from,
                    }))
                }
            }
        })
        .await
    }

    #[instrument(skip(self), fields(work_item_id = %id, worker_id = %worker), err)]
    async fn mark_running(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'running', updated_at = $3
            WHERE id = $1 AND lock_owner = $2 AND status = 'leased'
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_running", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(work_item_id = %id, worker_id = %worker), err)]
    async fn renew(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET lock_acquired_at = $3, updated_at = $3
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lease", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self, transition),
        fields(work_item_id = %id, worker_id = %worker, status = %transition.status),
        err
    )]
    async fn release(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        let released = self
            .with_locked_row("release", id, false, |item| {
                if !item.is_locked_by(worker) {
                    return Ok(None);
                }
                item.release(transition);
                Ok(Some(()))
            })
            .await;

        match released {
            Ok(outcome) => Ok(outcome.is_some()),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), err)]
    async fn find_unarmed(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            r#"{SELECT_COLUMNS}
            WHERE schedule IS NOT NULL
              AND enabled
              AND status = 'pending'
              AND lock_owner IS NULL
              AND next_execution_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#
        );
        self.fetch_items("find_unarmed", sqlx::query(&sql).bind(limit as i64))
            .await
    }

    #[instrument(skip(self), fields(work_item_id = %id), err)]
    async fn arm(
        &self,
        id: WorkItemId,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET next_execution_at = $2, updated_at = $3
            WHERE id = $1
              AND schedule IS NOT NULL
              AND enabled
              AND status = 'pending'
              AND lock_owner IS NULL
              AND next_execution_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("arm_work_item", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(work_item_id = %id), err)]
    async fn fail_unarmed(
        &self,
        id: WorkItemId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'failed', failure_class = $2, last_error = $3, updated_at = $4
            WHERE id = $1
              AND schedule IS NOT NULL
              AND enabled
              AND status = 'pending'
              AND lock_owner IS NULL
              AND next_execution_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(FailureClass::Fatal.as_str())
        .bind(reason)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_unarmed_work_item", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(reset_count = tracing::field::Empty), err)]
    async fn reset_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin("reset_stale_locks").await?;

        let sql = format!(
            r#"{SELECT_COLUMNS}
            WHERE lock_owner IS NOT NULL
              AND (lock_acquired_at IS NULL OR lock_acquired_at < $1)
            FOR UPDATE
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(stale_before)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reset_stale_locks", e))?;

        let mut reset = 0u64;
        for row in &rows {
            let mut item = decode_row(row)?;
            item.reset_lock(now);
            write_row(&mut tx, &item, "reset_stale_locks").await?;
            reset += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("reset_count", reset);
        Ok(reset)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            r#"{SELECT_COLUMNS}
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR work_type = $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        );
        self.fetch_items(
            "list_work_items",
            sqlx::query(&sql)
                .bind(filter.status.map(|s| s.as_str()))
                .bind(filter.work_type.as_deref())
                .bind(filter.limit as i64),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            r#"{SELECT_COLUMNS}
            WHERE enabled
              AND lock_owner IS NULL
              AND status IN ('pending', 'retry_wait')
              AND next_execution_at <= $1
            {CANDIDATE_ORDER}
            LIMIT $2
            "#
        );
        self.fetch_items(
            "list_due",
            sqlx::query(&sql).bind(now).bind(limit as i64),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<WorkItemStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM work_items GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("work_item_stats", e))?;

        let mut stats = WorkItemStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::Serialization(format!("failed to read status: {e}")))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::Serialization(format!("failed to read count: {e}")))?;
            stats.record(WorkItemStatus::parse(&status)?, count as usize);
        }
        Ok(stats)
    }
}

/// `attempts`/`max_attempts` as `INTEGER` columns.
fn attempt_columns(item: &WorkItem) -> Result<(i32, i32), StoreError> {
    let column = |name: &str, value: u32| {
        i32::try_from(value).map_err(|_| {
            StoreError::Serialization(format!("{name} {value} does not fit an INTEGER column"))
        })
    };
    Ok((
        column("attempts", item.attempts)?,
        column("max_attempts", item.max_attempts)?,
    ))
}

/// Write every mutable column of `item` back to its row.
async fn write_row(
    tx: &mut Transaction<'_, Postgres>,
    item: &WorkItem,
    operation: &str,
) -> Result<(), StoreError> {
    let schedule = item.schedule.as_ref().map(serde_json::to_value).transpose()?;
    let (attempts, max_attempts) = attempt_columns(item)?;

    sqlx::query(
        r#"
        UPDATE work_items SET
            status = $2,
            payload = $3,
            step = $4,
            attempts = $5,
            max_attempts = $6,
            priority = $7,
            lock_owner = $8,
            lock_acquired_at = $9,
            next_execution_at = $10,
            last_executed_at = $11,
            enabled = $12,
            schedule = $13,
            last_error = $14,
            failure_class = $15,
            updated_at = $16
        WHERE id = $1
        "#,
    )
    .bind(item.id.as_uuid())
    .bind(item.status.as_str())
    .bind(&item.payload)
    .bind(&item.step)
    .bind(attempts)
    .bind(max_attempts)
    .bind(item.priority)
    .bind(item.lock_owner.as_ref().map(WorkerId::as_str))
    .bind(item.lock_acquired_at)
    .bind(item.next_execution_at)
    .bind(item.last_executed_at)
    .bind(item.enabled)
    .bind(&schedule)
    .bind(&item.last_error)
    .bind(item.failure_class.map(|c| c.as_str()))
    .bind(item.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;

    Ok(())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<WorkItem, StoreError> {
    WorkItemRow::from_row(row)
        .map_err(|e| StoreError::Serialization(format!("failed to read work item row: {e}")))?
        .try_into()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row type

#[derive(Debug)]
struct WorkItemRow {
    id: uuid::Uuid,
    work_type: String,
    status: String,
    payload: serde_json::Value,
    step: Option<String>,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    lock_owner: Option<String>,
    lock_acquired_at: Option<DateTime<Utc>>,
    next_execution_at: Option<DateTime<Utc>>,
    last_executed_at: Option<DateTime<Utc>>,
    enabled: bool,
    parameters: serde_json::Value,
    schedule: Option<serde_json::Value>,
    last_error: Option<String>,
    failure_class: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WorkItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(WorkItemRow {
            id: row.try_get("id")?,
            work_type: row.try_get("work_type")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            step: row.try_get("step")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_acquired_at: row.try_get("lock_acquired_at")?,
            next_execution_at: row.try_get("next_execution_at")?,
            last_executed_at: row.try_get("last_executed_at")?,
            enabled: row.try_get("enabled")?,
            parameters: row.try_get("parameters")?,
            schedule: row.try_get("schedule")?,
            last_error: row.try_get("last_error")?,
            failure_class: row.try_get("failure_class")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let parameters: Vec<Parameter> = serde_json::from_value(row.parameters)?;
        let schedule: Option<Schedule> = row.schedule.map(serde_json::from_value).transpose()?;
        let failure_class = row
            .failure_class
            .as_deref()
            .map(|c| {
                FailureClass::parse(c)
                    .ok_or_else(|| StoreError::Serialization(format!("unknown failure class '{c}'")))
            })
            .transpose()?;

        Ok(WorkItem {
            id: WorkItemId::from_uuid(row.id),
            work_type: row.work_type,
            status: WorkItemStatus::parse(&row.status)?,
            payload: row.payload,
            step: row.step,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            priority: row.priority,
            lock_owner: row.lock_owner.map(WorkerId::new).transpose()?,
            lock_acquired_at: row.lock_acquired_at,
            next_execution_at: row.next_execution_at,
            last_executed_at: row.last_executed_at,
            enabled: row.enabled,
            parameters,
            schedule,
            last_error: row.last_error,
            failure_class,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workforge_core::TaskType;

    #[test]
    fn attempt_counters_outside_integer_range_are_rejected() {
        let mut item = WorkItem::new(&TaskType::new("sms.send").with_max_attempts(3), serde_json::json!({}));
        item.attempts = 2;
        assert_eq!(attempt_columns(&item).unwrap(), (2, 3));

        item.max_attempts = u32::MAX;
        assert!(matches!(attempt_columns(&item), Err(StoreError::Serialization(_))));
    }
}
