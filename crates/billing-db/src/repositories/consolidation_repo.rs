//! Consolidation repository implementation
//!
//! Frozen billable events are stored as JSON payloads next to the columns
//! needed for filtering and ordering. A month is written exactly once.

use billing_core::{
    models::{sort_billable_events, BillableEvent, ConsolidatedMonth},
    traits::ConsolidationRepository,
    AppError, AppResult,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::{debug, error, info, instrument};

/// PostgreSQL implementation of ConsolidationRepository
pub struct PgConsolidationRepository {
    pool: PgPool,
}

impl PgConsolidationRepository {
    /// Create a new consolidation repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConsolidationRepository for PgConsolidationRepository {
    #[instrument(skip(self))]
    async fn consolidated_months(&self) -> AppResult<Vec<ConsolidatedMonth>> {
        let rows = sqlx::query_as::<sqlx::Postgres, ConsolidatedMonthRow>(
            r#"
            SELECT month, raw_event_watermark, consolidated_at
            FROM consolidation_history
            ORDER BY month
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error reading consolidation history: {}", e);
            AppError::Database(format!("Failed to read consolidation history: {}", e))
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn is_month_consolidated(&self, month: NaiveDate) -> AppResult<bool> {
        let result: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM consolidation_history WHERE month = $1)",
        )
        .bind(month)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error checking month {}: {}", month, e);
            AppError::Database(format!("Failed to check consolidation: {}", e))
        })?;

        Ok(result.0)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn store_month(
        &self,
        month: NaiveDate,
        raw_event_watermark: i64,
        rows: &[BillableEvent],
    ) -> AppResult<usize> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO consolidation_history (month, raw_event_watermark)
            VALUES ($1, $2)
            ON CONFLICT (month) DO NOTHING
            "#,
        )
        .bind(month)
        .bind(raw_event_watermark)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Database error recording consolidation of {}: {}", month, e);
            AppError::Database(format!("Failed to record consolidation: {}", e))
        })?;

        if inserted.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "month {} is already consolidated",
                month
            )));
        }

        for row in rows {
            let payload = serde_json::to_string(row)?;
            sqlx::query(
                r#"
                INSERT INTO consolidated_billable_events (
                    month, event_guid, org_guid, resource_guid, event_start, sequence, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb)
                "#,
            )
            .bind(month)
            .bind(&row.event_guid)
            .bind(&row.org_guid)
            .bind(&row.resource_guid)
            .bind(row.event_start)
            .bind(row.sequence)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Database error freezing event {}: {}", row.event_guid, e);
                AppError::Database(format!("Failed to store consolidated event: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        info!("Consolidated {} billable events for {}", rows.len(), month);
        Ok(rows.len())
    }

    #[instrument(skip(self))]
    async fn get_month(&self, month: NaiveDate, org_guids: &[String]) -> AppResult<Vec<BillableEvent>> {
        debug!("Reading frozen rows for {}", month);

        let rows = sqlx::query_as::<sqlx::Postgres, ConsolidatedRow>(
            r#"
            SELECT sequence, payload::text AS payload
            FROM consolidated_billable_events
            WHERE month = $1
              AND (cardinality($2::text[]) = 0 OR org_guid = ANY($2))
            "#,
        )
        .bind(month)
        .bind(org_guids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error reading frozen rows for {}: {}", month, e);
            AppError::Database(format!("Failed to read consolidated events: {}", e))
        })?;

        let mut events = rows
            .into_iter()
            .map(ConsolidatedRow::into_event)
            .collect::<AppResult<Vec<_>>>()?;
        sort_billable_events(&mut events);
        Ok(events)
    }
}

/// Helper struct for mapping database rows to domain model
#[derive(Debug, sqlx::FromRow)]
struct ConsolidatedMonthRow {
    month: NaiveDate,
    raw_event_watermark: i64,
    consolidated_at: DateTime<Utc>,
}

impl From<ConsolidatedMonthRow> for ConsolidatedMonth {
    fn from(row: ConsolidatedMonthRow) -> Self {
        Self {
            month: row.month,
            raw_event_watermark: row.raw_event_watermark,
            consolidated_at: row.consolidated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConsolidatedRow {
    sequence: i64,
    payload: String,
}

impl ConsolidatedRow {
    fn into_event(self) -> AppResult<BillableEvent> {
        let mut event: BillableEvent = serde_json::from_str(&self.payload)?;
        event.sequence = self.sequence;
        Ok(event)
    }
}
