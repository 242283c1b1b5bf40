//! PaaS Billing Server
//!
//! Collects platform usage events, prices them against the versioned pricing
//! configuration and serves usage, billable and forecast queries over HTTP.

use actix_cors::Cors;
use actix_web::{http::header, web, App, HttpResponse, HttpServer};
use anyhow::Context;
use billing_api::configure;
use billing_auth::JwtService;
use billing_collector::{CfEventFetcher, Collector, CF_EVENT_KINDS};
use billing_core::{config::AppConfig, models::PricingConfig};
use billing_db::{
    create_pool, run_migrations, PgConsolidationRepository, PgPricingConfigRepository,
    PgRawEventRepository,
};
use billing_services::{BillingEngine, Consolidator, QueryService};
use chrono::NaiveDate;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Engine = BillingEngine<PgRawEventRepository, PgPricingConfigRepository, PgConsolidationRepository>;

/// Initialize tracing/logging
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "paas_billing={0},billing_api={0},billing_services={0},billing_collector={0},billing_db={0},actix_web=info,sqlx=warn",
            log_level
        ))
    });

    let json = env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

/// Install the pricing document from disk when it differs from the stored one
async fn install_pricing_config(engine: &Engine, path: &str) -> anyhow::Result<()> {
    let restored = engine.load_config().await?;

    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if restored {
                info!("No pricing file at {}, keeping stored configuration", path);
            } else {
                warn!("No pricing file at {} and no stored configuration", path);
            }
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path)),
    };

    let config = PricingConfig::from_json(&raw)
        .with_context(|| format!("invalid pricing configuration in {}", path))?;
    if restored && engine.active_config().source() == &config {
        info!(
            "Pricing configuration unchanged (version {})",
            engine.active_config().version()
        );
        return Ok(());
    }

    let version = engine
        .refresh_config(config)
        .await
        .with_context(|| format!("failed to install pricing configuration from {}", path))?;
    info!("Installed pricing configuration version {} from {}", version, path);
    Ok(())
}

/// Spawn one collector per Cloud Foundry event kind
fn spawn_collectors(
    config: &AppConfig,
    engine: &Engine,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();
    for kind in CF_EVENT_KINDS {
        let fetcher = CfEventFetcher::from_config(kind, &config.upstream, &config.collector)?;
        let collector = Collector::new(
            Arc::clone(engine.events()),
            Arc::new(fetcher),
            config.collector.clone(),
        )?;
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { collector.run(cancel).await }));
    }
    Ok(handles)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting PaaS Billing v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().context("failed to load configuration")?;

    info!("Connecting to database...");
    let pool = create_pool(&config.database.url, Some(config.database.max_connections)).await?;
    if config.database.run_migrations {
        run_migrations(&pool).await?;
    }

    let engine = Arc::new(BillingEngine::new(
        Arc::new(PgRawEventRepository::new(pool.clone())),
        Arc::new(PgPricingConfigRepository::new(pool.clone())),
        Arc::new(PgConsolidationRepository::new(pool)),
        config.billing.view_cache_capacity,
    ));
    install_pricing_config(&engine, &config.billing.pricing_config_path).await?;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if config.collector.enabled {
        tasks.extend(spawn_collectors(&config, &engine, &cancel)?);
    } else {
        info!("Event collectors disabled");
    }

    if config.billing.consolidate_enabled {
        let start_date =
            NaiveDate::parse_from_str(&config.billing.consolidation_start_date, "%Y-%m-%d")
                .with_context(|| {
                    format!(
                        "invalid consolidation start date '{}'",
                        config.billing.consolidation_start_date
                    )
                })?;
        let consolidator = Consolidator::new(Arc::clone(&engine), start_date);
        let interval = Duration::from_secs(config.billing.consolidation_interval_secs);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            consolidator.run(interval, cancel).await
        }));
    }

    let query_service = web::Data::new(QueryService::new(Arc::clone(&engine)));
    let jwt_service = web::Data::new(Arc::new(JwtService::new(
        &config.auth.jwt_secret,
        config.auth.jwt_expiration_minutes * 60,
    )));

    let cors_origins = env::var("CORS_ORIGINS").unwrap_or_default();
    let bind_addr = config.server_addr();
    info!(
        "Starting HTTP server on {} with {} workers",
        bind_addr, config.server.workers
    );

    let server = HttpServer::new(move || {
        let origins = cors_origins.clone();
        let cors = Cors::default()
            .allowed_origin_fn(move |origin, _req_head| {
                origin
                    .to_str()
                    .map(|o| origins.split(',').any(|allowed| allowed.trim() == o))
                    .unwrap_or(false)
            })
            .allowed_methods(vec!["GET", "OPTIONS"])
            .allowed_headers(vec![header::AUTHORIZATION, header::ACCEPT, header::COOKIE])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .app_data(query_service.clone())
            .app_data(jwt_service.clone())
            .app_data(web::QueryConfig::default().error_handler(|err, _req| {
                let message = err.to_string();
                actix_web::error::InternalError::from_response(
                    err,
                    HttpResponse::BadRequest().json(serde_json::json!({
                        "error": "invalid_query",
                        "message": message,
                        "status": 400,
                    })),
                )
                .into()
            }))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(
                configure::<
                    PgRawEventRepository,
                    PgPricingConfigRepository,
                    PgConsolidationRepository,
                >,
            )
    })
    .workers(config.server.workers)
    .client_request_timeout(Duration::from_secs(config.server.timeout_secs))
    .bind(&bind_addr)?
    .run();

    let result = server.await;

    info!("HTTP server stopped, shutting down background tasks");
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    result.context("HTTP server failed")
}
