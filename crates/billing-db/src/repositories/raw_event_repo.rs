//! Raw event repository implementation
//!
//! Append-only storage for upstream lifecycle events. Batches are written in
//! a single transaction so a reader never observes part of a batch.
//! Payloads travel as JSON text and are cast to `jsonb` in SQL.
//!
//! Writers are serialised on a transaction-scoped advisory lock, so ids
//! become visible in increasing order and `MAX(id)` is a safe watermark.

use billing_core::{
    models::{EventKind, RawEvent, RawEventFilter},
    traits::RawEventRepository,
    AppError, AppResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::{debug, error, info, instrument};

/// PostgreSQL implementation of RawEventRepository
pub struct PgRawEventRepository {
    pool: PgPool,
}

impl PgRawEventRepository {
    /// Create a new raw event repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Advisory lock key held by every raw event writer until commit
pub const RAW_EVENT_WRITE_LOCK: i64 = 0x7261_775f_6576_7473;

const RAW_EVENT_SELECT_COLUMNS: &str = "id, guid, kind, created_at, payload::text AS payload";

/// Validate a batch and reject duplicates inside it
pub(crate) fn check_batch(events: &[RawEvent]) -> AppResult<()> {
    let mut seen = HashSet::with_capacity(events.len());
    for event in events {
        event.validate()?;
        if !seen.insert((event.kind, event.guid.as_str())) {
            return Err(AppError::DuplicateEvent {
                kind: event.kind.to_string(),
                guid: event.guid.clone(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl RawEventRepository for PgRawEventRepository {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn store_events(&self, events: &[RawEvent]) -> AppResult<usize> {
        check_batch(events)?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(RAW_EVENT_WRITE_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to take raw event write lock: {}", e);
                AppError::Database(format!("Failed to take raw event write lock: {}", e))
            })?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO raw_events (kind, guid, created_at, payload)
                VALUES ($1, $2, $3, $4::jsonb)
                "#,
            )
            .bind(event.kind.as_str())
            .bind(&event.guid)
            .bind(event.created_at)
            .bind(event.payload.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                let unique = e
                    .as_database_error()
                    .map(|db| db.is_unique_violation())
                    .unwrap_or(false);
                if unique {
                    debug!("Duplicate raw event {} {}", event.kind, event.guid);
                    AppError::DuplicateEvent {
                        kind: event.kind.to_string(),
                        guid: event.guid.clone(),
                    }
                } else {
                    error!("Database error storing raw event {}: {}", event.guid, e);
                    AppError::Database(format!("Failed to store raw event: {}", e))
                }
            })?;
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        info!("Stored {} raw events", events.len());
        Ok(events.len())
    }

    #[instrument(skip(self))]
    async fn get_events(&self, filter: &RawEventFilter) -> AppResult<Vec<RawEvent>> {
        debug!("Reading raw events: {:?}", filter);

        let order = if filter.reverse { "DESC" } else { "ASC" };
        let query = format!(
            "SELECT {} FROM raw_events WHERE kind = $1 ORDER BY id {} LIMIT $2",
            RAW_EVENT_SELECT_COLUMNS, order
        );

        let rows = sqlx::query_as::<sqlx::Postgres, RawEventRow>(&query)
            .bind(filter.kind.as_str())
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error reading raw events: {}", e);
                AppError::Database(format!("Failed to read raw events: {}", e))
            })?;

        rows.into_iter().map(RawEventRow::into_event).collect()
    }

    #[instrument(skip(self))]
    async fn all_events(&self, max_id: i64) -> AppResult<Vec<RawEvent>> {
        let query = format!(
            "SELECT {} FROM raw_events WHERE id <= $1 ORDER BY id",
            RAW_EVENT_SELECT_COLUMNS
        );

        let rows = sqlx::query_as::<sqlx::Postgres, RawEventRow>(&query)
            .bind(max_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error reading raw events up to {}: {}", max_id, e);
                AppError::Database(format!("Failed to read raw events: {}", e))
            })?;

        debug!("Loaded {} raw events up to id {}", rows.len(), max_id);
        rows.into_iter().map(RawEventRow::into_event).collect()
    }

    #[instrument(skip(self))]
    async fn max_event_id(&self) -> AppResult<i64> {
        let result: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM raw_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error reading max raw event id: {}", e);
                AppError::Database(format!("Failed to read max event id: {}", e))
            })?;

        Ok(result.0)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Database health check failed: {}", e)))?;
        Ok(())
    }
}

/// Helper struct for mapping database rows to domain model
#[derive(Debug, sqlx::FromRow)]
struct RawEventRow {
    id: i64,
    guid: String,
    kind: String,
    created_at: DateTime<Utc>,
    payload: String,
}

impl RawEventRow {
    fn into_event(self) -> AppResult<RawEvent> {
        let kind: EventKind = self.kind.parse()?;
        let payload = serde_json::from_str(&self.payload)?;
        Ok(RawEvent {
            id: self.id,
            guid: self.guid,
            kind,
            created_at: self.created_at,
            payload,
        })
    }
}
