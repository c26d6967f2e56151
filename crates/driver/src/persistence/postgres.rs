//! PostgreSQL implementation of the store traits
//!
//! Production persistence shared by every driver process of a run:
//! - Atomic claiming with `FOR UPDATE SKIP LOCKED`
//! - Unique-violation mapping for idempotent inserts
//! - Conditional session updates instead of read-modify-write

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::event::EventSummary;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS benchrun_events (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        scheduled_at TIMESTAMPTZ NOT NULL,
        data JSONB NOT NULL DEFAULT 'null',
        data_owner TEXT,
        driver_id TEXT,
        session_id UUID,
        lock_owner TEXT,
        lock_time TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_benchrun_events_claim
        ON benchrun_events (scheduled_at, id)
        WHERE lock_time IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS benchrun_results (
        id UUID PRIMARY KEY,
        driver_id TEXT NOT NULL,
        event_name TEXT NOT NULL,
        event JSONB NOT NULL,
        success BOOLEAN NOT NULL,
        start_time TIMESTAMPTZ NOT NULL,
        duration_ms BIGINT NOT NULL,
        message JSONB NOT NULL,
        chart BOOLEAN NOT NULL,
        processed_by TEXT NOT NULL,
        warning TEXT,
        next_events JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_benchrun_results_name
        ON benchrun_results (event_name, start_time)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_benchrun_results_time
        ON benchrun_results (start_time)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS benchrun_sessions (
        id UUID PRIMARY KEY,
        started_at TIMESTAMPTZ NOT NULL,
        ended_at TIMESTAMPTZ,
        data JSONB
    )
    "#,
];

const EVENT_COLUMNS: &str =
    "id, name, scheduled_at, data, data_owner, driver_id, session_id, lock_owner, lock_time";

const RESULT_COLUMNS: &str = "id, driver_id, event, success, start_time, duration_ms, message, \
     chart, processed_by, warning, next_events";

/// PostgreSQL implementation of the event, result and session stores
///
/// # Example
///
/// ```ignore
/// use benchrun_driver::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/benchrun").await?;
/// let store = PostgresStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(database_error("ensure schema"))?;
        }
        debug!("Schema ready");
        Ok(())
    }

    /// Remove all results and sessions (for testing)
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        for table in ["benchrun_events", "benchrun_results", "benchrun_sessions"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await
                .map_err(database_error("clear"))?;
        }
        Ok(())
    }
}

fn database_error(operation: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!(operation, "Database operation failed: {}", e);
        StoreError::Database(e.to_string())
    }
}

fn event_from_row(row: &PgRow) -> EventDocument {
    EventDocument {
        id: row.get("id"),
        name: row.get("name"),
        scheduled_at: row.get("scheduled_at"),
        data: row.get("data"),
        data_owner: row.get("data_owner"),
        driver_id: row.get("driver_id"),
        session_id: row.get("session_id"),
        lock_owner: row.get("lock_owner"),
        lock_time: row.get("lock_time"),
    }
}

fn record_from_row(row: &PgRow) -> Result<EventRecord, StoreError> {
    let event: EventSummary = serde_json::from_value(row.get("event"))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let next_events: Vec<String> = serde_json::from_value(row.get("next_events"))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let duration_ms: i64 = row.get("duration_ms");

    Ok(EventRecord {
        id: row.get("id"),
        driver_id: row.get("driver_id"),
        event,
        success: row.get("success"),
        start_time: row.get("start_time"),
        duration_ms: duration_ms.max(0) as u64,
        message: row.get("message"),
        chart: row.get("chart"),
        processed_by: row.get("processed_by"),
        warning: row.get("warning"),
        next_events,
    })
}

#[async_trait]
impl EventStore for PostgresStore {
    #[instrument(skip(self, doc), fields(event_id = %doc.id, event_name = %doc.name))]
    async fn insert_event(&self, doc: EventDocument) -> Result<(), StoreError> {
        let id = doc.id;
        sqlx::query(
            r#"
            INSERT INTO benchrun_events
                (id, name, scheduled_at, data, data_owner, driver_id, session_id, lock_owner, lock_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(doc.id)
        .bind(&doc.name)
        .bind(doc.scheduled_at)
        .bind(&doc.data)
        .bind(&doc.data_owner)
        .bind(&doc.driver_id)
        .bind(doc.session_id)
        .bind(&doc.lock_owner)
        .bind(doc.lock_time)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return StoreError::DuplicateKey(id);
                }
            }
            database_error("insert event")(e)
        })?;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(claimant = %filter.claimant))]
    async fn claim_event(&self, filter: &ClaimFilter) -> Result<Option<EventDocument>, StoreError> {
        let (driver, stale_before) = match &filter.affinity {
            Affinity::Driver(id) => (Some(id.as_str()), None),
            Affinity::Unassigned { stale_before } => (None, *stale_before),
        };

        // Pick the earliest eligible row, skipping rows another claimer holds,
        // and stamp the lock in the same statement
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id
                FROM benchrun_events
                WHERE scheduled_at <= $1
                  AND (lock_time IS NULL OR ($2::timestamptz IS NOT NULL AND lock_time <= $2))
                  AND (data_owner IS NULL OR data_owner = $3)
                  AND (
                        ($4::text IS NOT NULL AND driver_id = $4)
                     OR ($4::text IS NULL AND (
                            driver_id IS NULL
                         OR ($5::timestamptz IS NOT NULL AND scheduled_at <= $5)))
                  )
                ORDER BY scheduled_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE benchrun_events e
            SET lock_owner = $6,
                lock_time = $1
            FROM next
            WHERE e.id = next.id
            RETURNING {}
            "#,
            EVENT_COLUMNS
                .split(", ")
                .map(|c| format!("e.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let row = sqlx::query(&sql)
            .bind(filter.as_of)
            .bind(filter.lock_expiry)
            .bind(&filter.data_owner)
            .bind(driver)
            .bind(stale_before)
            .bind(&filter.claimant)
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error("claim event"))?;

        Ok(row.as_ref().map(event_from_row))
    }

    async fn count_events(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM benchrun_events")
            .fetch_one(&self.pool)
            .await
            .map_err(database_error("count events"))?;
        Ok(count as u64)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<EventDocument>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM benchrun_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("get event"))?;

        Ok(row.as_ref().map(event_from_row))
    }

    async fn delete_event(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM benchrun_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(database_error("delete event"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_events(&self, skip: u64, limit: u64) -> Result<Vec<EventDocument>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM benchrun_events
            WHERE lock_time IS NULL
            ORDER BY scheduled_at, id
            OFFSET $1 LIMIT $2
            "#
        ))
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("list events"))?;

        Ok(rows.iter().map(event_from_row).collect())
    }

    async fn clear_events(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM benchrun_events")
            .execute(&self.pool)
            .await
            .map_err(database_error("clear events"))?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PostgresStore {
    #[instrument(skip(self, record), fields(event_name = %record.event.name, success = record.success))]
    async fn record_result(&self, record: EventRecord) -> Result<(), StoreError> {
        let event = serde_json::to_value(&record.event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let next_events = serde_json::to_value(&record.next_events)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO benchrun_results
                (id, driver_id, event_name, event, success, start_time, duration_ms,
                 message, chart, processed_by, warning, next_events)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(&record.driver_id)
        .bind(&record.event.name)
        .bind(&event)
        .bind(record.success)
        .bind(record.start_time)
        .bind(record.duration_ms as i64)
        .bind(&record.message)
        .bind(record.chart)
        .bind(&record.processed_by)
        .bind(&record.warning)
        .bind(&next_events)
        .execute(&self.pool)
        .await
        .map_err(database_error("record result"))?;
        Ok(())
    }

    async fn first_result(&self) -> Result<Option<EventRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM benchrun_results ORDER BY start_time ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("first result"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn last_result(&self) -> Result<Option<EventRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM benchrun_results ORDER BY start_time DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("last result"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn results_by_event_name(
        &self,
        event_name: &str,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
            FROM benchrun_results
            WHERE event_name = $1
            ORDER BY start_time
            OFFSET $2 LIMIT $3
            "#
        ))
        .bind(event_name)
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("results by event name"))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn results_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chart_only: bool,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
            FROM benchrun_results
            WHERE start_time >= $1 AND start_time < $2
              AND (NOT $3 OR chart)
            ORDER BY start_time
            OFFSET $4 LIMIT $5
            "#
        ))
        .bind(start)
        .bind(end)
        .bind(chart_only)
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("results in window"))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn event_names(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT DISTINCT event_name FROM benchrun_results ORDER BY event_name")
            .fetch_all(&self.pool)
            .await
            .map_err(database_error("event names"))
    }

    async fn count_results(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM benchrun_results")
            .fetch_one(&self.pool)
            .await
            .map_err(database_error("count results"))?;
        Ok(count as u64)
    }

    async fn count_results_by_event_name(&self, event_name: &str) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM benchrun_results WHERE event_name = $1")
                .bind(event_name)
                .fetch_one(&self.pool)
                .await
                .map_err(database_error("count results by event name"))?;
        Ok(count as u64)
    }

    async fn count_successes(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM benchrun_results WHERE success")
            .fetch_one(&self.pool)
            .await
            .map_err(database_error("count successes"))?;
        Ok(count as u64)
    }

    async fn count_failures(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM benchrun_results WHERE NOT success")
                .fetch_one(&self.pool)
                .await
                .map_err(database_error("count failures"))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn start_session(&self, data: Option<serde_json::Value>) -> Result<Uuid, SessionError> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO benchrun_sessions (id, started_at, data) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(Utc::now())
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(database_error("start session"))?;
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn end_session(&self, id: Uuid) -> Result<DateTime<Utc>, SessionError> {
        let ended_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE benchrun_sessions
            SET ended_at = GREATEST($2, started_at)
            WHERE id = $1 AND ended_at IS NULL
            RETURNING ended_at
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("end session"))?;

        if let Some(ended_at) = ended_at {
            return Ok(ended_at);
        }

        match self.session(id).await? {
            Some(_) => Err(SessionError::AlreadyEnded(id)),
            None => Err(SessionError::NotFound(id)),
        }
    }

    async fn session(&self, id: Uuid) -> Result<Option<Session>, SessionError> {
        let row =
            sqlx::query("SELECT id, started_at, ended_at, data FROM benchrun_sessions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(database_error("get session"))?;

        Ok(row.map(|row| Session {
            id: row.get("id"),
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            data: row.get("data"),
        }))
    }

    async fn set_session_data(
        &self,
        id: Uuid,
        data: serde_json::Value,
    ) -> Result<(), SessionError> {
        let result = sqlx::query("UPDATE benchrun_sessions SET data = $2 WHERE id = $1")
            .bind(id)
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(database_error("set session data"))?;

        if result.rows_affected() == 0 {
            return Err(SessionError::NotFound(id));
        }
        Ok(())
    }

    async fn active_sessions_count(&self) -> Result<u64, SessionError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM benchrun_sessions WHERE ended_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(database_error("active sessions"))?;
        Ok(count as u64)
    }

    async fn completed_sessions_count(&self) -> Result<u64, SessionError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM benchrun_sessions WHERE ended_at IS NOT NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(database_error("completed sessions"))?;
        Ok(count as u64)
    }
}
