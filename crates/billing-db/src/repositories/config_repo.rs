//! Pricing configuration repository implementation
//!
//! The installed configuration is replaced wholesale: every install deletes
//! the previous plans and rates and records a new version, all inside one
//! transaction.

use billing_core::{
    models::{CurrencyRate, PricingConfig, PricingPlan, PricingPlanComponent, VatRate},
    traits::PricingConfigRepository,
    AppError, AppResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, info, instrument};

/// PostgreSQL implementation of PricingConfigRepository
pub struct PgPricingConfigRepository {
    pool: PgPool,
}

impl PgPricingConfigRepository {
    /// Create a new pricing configuration repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    error!("Database error {}: {}", context, e);
    AppError::Database(format!("Failed {}: {}", context, e))
}

#[async_trait]
impl PricingConfigRepository for PgPricingConfigRepository {
    #[instrument(skip(self, config), fields(plans = config.pricing_plans.len()))]
    async fn install(&self, config: &PricingConfig) -> AppResult<i64> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        // Components cascade with their plans
        for table in ["pricing_plans", "vat_rates", "currency_rates"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("clearing pricing configuration", e))?;
        }

        for rate in &config.vat_rates {
            sqlx::query("INSERT INTO vat_rates (code, valid_from, rate) VALUES ($1, $2, $3)")
                .bind(&rate.code)
                .bind(rate.valid_from)
                .bind(rate.rate)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("inserting vat rate", e))?;
        }

        for rate in &config.currency_rates {
            sqlx::query("INSERT INTO currency_rates (code, valid_from, rate) VALUES ($1, $2, $3)")
                .bind(&rate.code)
                .bind(rate.valid_from)
                .bind(rate.rate)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("inserting currency rate", e))?;
        }

        for plan in &config.pricing_plans {
            sqlx::query(
                r#"
                INSERT INTO pricing_plans (
                    plan_guid, valid_from, name, memory_in_mb, storage_in_mb, number_of_nodes
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&plan.plan_guid)
            .bind(plan.valid_from)
            .bind(&plan.name)
            .bind(plan.memory_in_mb)
            .bind(plan.storage_in_mb)
            .bind(plan.number_of_nodes)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("inserting pricing plan", e))?;

            for (position, component) in plan.components.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO pricing_plan_components (
                        plan_guid, valid_from, position, name, formula, vat_code, currency_code
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(&plan.plan_guid)
                .bind(plan.valid_from)
                .bind(position as i32)
                .bind(&component.name)
                .bind(&component.formula)
                .bind(&component.vat_code)
                .bind(&component.currency_code)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("inserting pricing plan component", e))?;
            }
        }

        let version: (i64,) = sqlx::query_as(
            "INSERT INTO config_versions (ignore_missing_plans) VALUES ($1) RETURNING version",
        )
        .bind(config.ignore_missing_plans)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("recording config version", e))?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        info!(
            "Installed pricing configuration version {} ({} plans, {} vat rates, {} currency rates)",
            version.0,
            config.pricing_plans.len(),
            config.vat_rates.len(),
            config.currency_rates.len()
        );
        Ok(version.0)
    }

    #[instrument(skip(self))]
    async fn load(&self) -> AppResult<Option<(i64, PricingConfig)>> {
        let version: Option<(i64, bool)> = sqlx::query_as(
            "SELECT version, ignore_missing_plans FROM config_versions ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("reading config version", e))?;

        let Some((version, ignore_missing_plans)) = version else {
            debug!("No pricing configuration installed");
            return Ok(None);
        };

        let vat_rates = sqlx::query_as::<sqlx::Postgres, RateRow>(
            "SELECT code, valid_from, rate FROM vat_rates ORDER BY valid_from, code",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("reading vat rates", e))?
        .into_iter()
        .map(|row| VatRate {
            code: row.code,
            valid_from: row.valid_from,
            rate: row.rate,
        })
        .collect();

        let currency_rates = sqlx::query_as::<sqlx::Postgres, RateRow>(
            "SELECT code, valid_from, rate FROM currency_rates ORDER BY valid_from, code",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("reading currency rates", e))?
        .into_iter()
        .map(|row| CurrencyRate {
            code: row.code,
            valid_from: row.valid_from,
            rate: row.rate,
        })
        .collect();

        let plan_rows = sqlx::query_as::<sqlx::Postgres, PlanRow>(
            r#"
            SELECT plan_guid, valid_from, name, memory_in_mb, storage_in_mb, number_of_nodes
            FROM pricing_plans
            ORDER BY valid_from, plan_guid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("reading pricing plans", e))?;

        let component_rows = sqlx::query_as::<sqlx::Postgres, ComponentRow>(
            r#"
            SELECT plan_guid, valid_from, name, formula, vat_code, currency_code
            FROM pricing_plan_components
            ORDER BY plan_guid, valid_from, position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("reading pricing plan components", e))?;

        let pricing_plans = plan_rows
            .into_iter()
            .map(|row| {
                let components = component_rows
                    .iter()
                    .filter(|c| c.plan_guid == row.plan_guid && c.valid_from == row.valid_from)
                    .map(|c| PricingPlanComponent {
                        name: c.name.clone(),
                        formula: c.formula.clone(),
                        vat_code: c.vat_code.clone(),
                        currency_code: c.currency_code.clone(),
                    })
                    .collect();
                PricingPlan {
                    plan_guid: row.plan_guid,
                    valid_from: row.valid_from,
                    name: row.name,
                    memory_in_mb: row.memory_in_mb,
                    storage_in_mb: row.storage_in_mb,
                    number_of_nodes: row.number_of_nodes,
                    components,
                }
            })
            .collect();

        Ok(Some((
            version,
            PricingConfig {
                vat_rates,
                currency_rates,
                pricing_plans,
                ignore_missing_plans,
            },
        )))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RateRow {
    code: String,
    valid_from: DateTime<Utc>,
    rate: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    plan_guid: String,
    valid_from: DateTime<Utc>,
    name: String,
    memory_in_mb: i64,
    storage_in_mb: i64,
    number_of_nodes: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ComponentRow {
    plan_guid: String,
    valid_from: DateTime<Utc>,
    name: String,
    formula: String,
    vat_code: String,
    currency_code: String,
}
