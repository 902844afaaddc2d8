mod db;
mod domain;
mod middleware;
mod services;
mod state;
mod sync;
mod web;

use crate::services::classroom::{ClassroomClient, ClassroomSource};
use crate::state::{AppState, QueryLimits, SharedState};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL missing");
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
        tracing::error!("Failed to run database migrations: {}", e);
        e
    })?;
    tracing::info!("Database migrations completed");

    let ai = Arc::new(services::ai::AiService::new(
        std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY missing"),
        std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
    ));

    let classroom: Arc<dyn ClassroomSource> = Arc::new(ClassroomClient::from_env()?);

    let shared: SharedState = Arc::new(AppState {
        pool,
        ai,
        classroom,
        sync_lock: tokio::sync::Mutex::new(()),
        query: QueryLimits::from_env(),
    });

    let scheduler = JobScheduler::new().await?;

    // Unattended warehouse refresh, only when an operator opted in.
    if let Ok(schedule) = std::env::var("SYNC_SCHEDULE") {
        let shared_for_sync = shared.clone();
        scheduler
            .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
                let state = shared_for_sync.clone();
                Box::pin(async move {
                    tracing::info!("Starting scheduled sync...");
                    let report = sync::run_sync(&state, web::DEFAULT_APP).await;
                    if report.all_ok() {
                        tracing::info!(run_id = %report.run_id, "Scheduled sync completed");
                    } else {
                        tracing::error!(run_id = %report.run_id, "Scheduled sync finished with failed steps");
                    }
                })
            })?)
            .await?;
        tracing::info!("Scheduled sync registered: {}", schedule);
    }

    // Hourly rate limiter cleanup so idle client windows don't pile up.
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            Box::pin(async move {
                web::query::QUERY_RATE_LIMITER.prune().await;
            })
        })?)
        .await?;

    scheduler.start().await?;

    let app = web::routes(shared.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| {
        let port = std::env::var("PORT").unwrap_or_else(|_| "8000".to_string());
        format!("0.0.0.0:{}", port)
    });
    tracing::info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
