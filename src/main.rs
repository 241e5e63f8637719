//! Recap Server
//!
//! Serves precomputed user recaps over HTTP from a read-through cache in
//! front of PostgreSQL.

use actix_cors::Cors;
use actix_web::{http::header, middleware, web, App, HttpServer};
use recap_api::{configure, AdminToken, SignatureVerifier};
use recap_cache::{MemoryCache, RedisCache};
use recap_core::config::CacheBackend;
use recap_core::traits::{CacheStore, RecapRepository};
use recap_core::AppConfig;
use recap_db::{ManagedPool, PgRecapRepository};
use recap_services::{
    CacheCounters, DynRecapOrchestrator, FanoutMetrics, PrometheusMetrics, ReadPolicy,
    RecapOrchestrator, TracingMetrics,
};
use std::env;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long in-flight primary operations may run after the server stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Initialize tracing/logging
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "recap_server={lvl},recap_api={lvl},recap_services={lvl},recap_db={lvl},recap_cache={lvl},actix_web=info,sqlx=warn",
            lvl = log_level
        ))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

fn startup_error(e: impl std::fmt::Display) -> io::Error {
    error!("Startup failed: {}", e);
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    init_tracing();

    info!("Starting Recap Server v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().map_err(startup_error)?;

    info!("Connecting to database...");
    let db = ManagedPool::connect(&config.database)
        .await
        .map_err(startup_error)?;
    info!(
        max_connections = config.database.max_connections,
        max_queued = config.database.max_queued,
        overflow = ?config.database.overflow,
        "Database ready"
    );

    let cache: Arc<dyn CacheStore> = match config.redis.backend {
        CacheBackend::Redis => {
            let redis = RedisCache::connect(&config.redis.url, config.redis.op_timeout()).await;
            if !redis.is_available() {
                warn!("Serving without cache: every read goes to the database");
            }
            Arc::new(redis)
        }
        CacheBackend::Memory => {
            info!(
                max_entries = config.redis.memory_max_entries,
                "Using in-process cache"
            );
            Arc::new(MemoryCache::with_capacity(config.redis.memory_max_entries))
        }
    };

    let primary: Arc<dyn RecapRepository> = Arc::new(PgRecapRepository::new(
        db.clone(),
        config.database.query_timeout(),
    ));

    let counters = Arc::new(CacheCounters::new());
    let prometheus = Arc::new(PrometheusMetrics::new().map_err(startup_error)?);
    let metrics = FanoutMetrics::new()
        .with(Arc::new(TracingMetrics))
        .with(counters.clone())
        .with(prometheus.clone());

    let policy = ReadPolicy::from_app_config(&config);
    info!(
        prefix = policy.keys.prefix(),
        ttl_secs = policy.entry_ttl.as_secs(),
        lock_ttl_secs = policy.lock_ttl.as_secs(),
        strategy = ?policy.strategy,
        "Read policy configured"
    );

    let orchestrator: DynRecapOrchestrator =
        RecapOrchestrator::new(primary, cache, Arc::new(metrics), policy);
    let orchestrator = web::Data::new(orchestrator);
    let counters = web::Data::from(counters);
    let prometheus = web::Data::from(prometheus);
    let verifier = web::Data::new(SignatureVerifier::from_config(&config.auth));
    let admin_token = web::Data::new(AdminToken::from_config(&config.auth));

    if config.auth.signature_secret.is_none() {
        warn!("No signature secret configured; requests are signed without one");
    }

    let cors_origins = config.server.cors_origins.clone();
    let bind_addr = config.server_addr();
    info!(
        "Starting HTTP server on {} with {} workers",
        bind_addr, config.server.workers
    );

    HttpServer::new(move || {
        // Configure CORS - clone cors_origins for each worker
        let cors_origins_inner = cors_origins.clone();
        let cors = Cors::default()
            .allowed_origin_fn(move |origin, _req_head| {
                let origins: Vec<&str> = cors_origins_inner.split(',').collect();
                if let Ok(origin_str) = origin.to_str() {
                    origins.iter().any(|o| o.trim() == origin_str)
                } else {
                    false
                }
            })
            .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                header::ACCEPT,
                header::CONTENT_TYPE,
                header::HeaderName::from_static("timestamp"),
                header::HeaderName::from_static("user_id"),
                header::HeaderName::from_static("sign"),
                header::HeaderName::from_static("x-admin-token"),
            ])
            .max_age(3600);

        App::new()
            .app_data(orchestrator.clone())
            .app_data(counters.clone())
            .app_data(prometheus.clone())
            .app_data(verifier.clone())
            .app_data(admin_token.clone())
            // Middleware
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::Compress::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(configure)
    })
    .workers(config.server.workers)
    .bind(&bind_addr)?
    .run()
    .await?;

    info!("HTTP server stopped, draining database pool");
    db.close(SHUTDOWN_GRACE).await;

    info!("Recap Server shut down");
    Ok(())
}
