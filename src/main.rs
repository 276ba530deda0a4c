use axum::http::{header, Method};
use live_quiz::config::AppConfig;
use live_quiz::db::{MemoryStore, ParticipantRoster, PgStore, QuestionSource, SessionStore};
use live_quiz::live::{ChannelHub, EngineDeps, LiveQuizEngine, SystemClock};
use live_quiz::state::{AppState, SharedState};
use live_quiz::web;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Stores = (Arc<dyn SessionStore>, Arc<dyn QuestionSource>, Arc<dyn ParticipantRoster>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let (store, questions, roster) = connect_stores(&config).await?;

    let hub = ChannelHub::new(config.event_channel_capacity);
    let engine = LiveQuizEngine::new(
        config.live.clone(),
        EngineDeps {
            store,
            questions,
            roster: roster.clone(),
            broadcaster: Arc::new(hub.clone()),
            clock: Arc::new(SystemClock),
        },
    );
    tracing::info!(
        "Live rounds: {} questions, {}s each, {}s buffer, {}s countdown, early advance {}",
        config.live.question_count,
        config.live.question_duration.as_secs(),
        config.live.buffer_duration.as_secs(),
        config.live.countdown.as_secs(),
        config.live.early_advance
    );

    // Sessions left open by a previous process have no timers here.
    match engine.reap_stale_sessions().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Aborted {} sessions left over from a previous run", n),
        Err(e) => tracing::error!("Startup reap failed: {}", e),
    }

    let shared: SharedState = Arc::new(AppState {
        engine,
        hub,
        roster,
        session_key: config.session_key.clone(),
    });

    let scheduler = JobScheduler::new().await?;

    // Stale sessions and abandoned lobby channels - every minute
    let shared_for_reaper = shared.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let state = shared_for_reaper.clone();
            Box::pin(async move {
                if let Err(e) = state.engine.reap_stale_sessions().await {
                    tracing::error!("Failed to reap stale sessions: {}", e);
                }
                let pruned = state.hub.prune();
                if pruned > 0 {
                    tracing::debug!("Pruned {} idle lobby channels", pruned);
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!("Scheduler started: stale session reaper every minute");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let app = web::routes(shared).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    tracing::info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn connect_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using the in-memory store");
        let store = MemoryStore::new();
        return Ok((Arc::new(store.clone()), Arc::new(store.clone()), Arc::new(store)));
    };

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to run database migrations: {}", e);
            e
        })?;
    tracing::info!("Database migrations completed");

    let store = PgStore::new(pool);
    Ok((Arc::new(store.clone()), Arc::new(store.clone()), Arc::new(store)))
}
