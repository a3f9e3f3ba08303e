use anyhow::Context;
use event_bus::{
    ConsumerGroupRuntime, EventLog, InMemoryLog, JetStreamConfig, JetStreamLog, Producer,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use starter_sync::{
    config::{BusType, Config, StoreType},
    metrics::SyncMetrics,
    repos::{
        memory::{InMemoryNotificationStore, InMemoryStarterSource},
        notification_repo::PgNotificationStore,
        starter_repo::PgStarterSource,
        NotificationStore, StarterSource,
    },
    routes::{router, AppState},
    search::{ElasticsearchIndex, InMemorySearchIndex, SearchIndex},
    catch_up_then_consume, ReindexService, SyncHandler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting starter sync service...");

    let config = Config::from_env()
        .map_err(anyhow::Error::msg)
        .context("Failed to load configuration from environment")?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        bus_type = ?config.bus_type,
        store_type = ?config.store_type,
        group = %config.consumer_group,
        "Configuration loaded"
    );

    let log: Arc<dyn EventLog> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using in-memory event log");
            Arc::new(InMemoryLog::with_partitions(config.topic_partitions))
        }
        BusType::Nats => {
            tracing::info!(servers = ?config.brokers, "Connecting to NATS JetStream");
            let jetstream = JetStreamLog::connect(&JetStreamConfig {
                servers: config.brokers.clone(),
                partitions: config.topic_partitions,
                ..JetStreamConfig::default()
            })
            .await
            .context("Failed to connect to NATS")?;
            Arc::new(jetstream)
        }
    };

    let (source, notifications): (Arc<dyn StarterSource>, Arc<dyn NotificationStore>) =
        match config.store_type {
            StoreType::InMemory => {
                tracing::warn!("Using in-memory stores; data is lost on restart");
                (
                    Arc::new(InMemoryStarterSource::new()),
                    Arc::new(InMemoryNotificationStore::new()),
                )
            }
            StoreType::Postgres => {
                let database_url = config
                    .database_url
                    .as_deref()
                    .context("DATABASE_URL must be set when STORE_TYPE=postgres")?;

                tracing::info!("Connecting to database...");
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(database_url)
                    .await
                    .context("Failed to connect to database")?;

                tracing::info!("Running migrations...");
                sqlx::migrate!("./db/migrations")
                    .run(&pool)
                    .await
                    .context("Failed to run migrations")?;

                (
                    Arc::new(PgStarterSource::new(pool.clone())),
                    Arc::new(PgNotificationStore::new(pool)),
                )
            }
        };

    let index: Arc<dyn SearchIndex> = match &config.elasticsearch_url {
        Some(url) => {
            tracing::info!(url = %url, index = %config.elasticsearch_index, "Using Elasticsearch");
            Arc::new(ElasticsearchIndex::new(url, config.elasticsearch_index.clone())?)
        }
        None => {
            tracing::warn!("ELASTICSEARCH_URL not set; using in-memory search index");
            Arc::new(InMemorySearchIndex::new())
        }
    };

    let metrics = SyncMetrics::new().context("Failed to register metrics")?;

    let reindex = ReindexService::new(source.clone(), index.clone(), config.reindex_batch_size);
    let handler = Arc::new(SyncHandler::new(source, index, notifications));
    let runtime = ConsumerGroupRuntime::new(config.consumer_config(), log.clone(), handler)
        .await
        .context("Failed to create consumer group runtime")?
        .with_observer(Arc::new(metrics.clone()));

    // Serve health and readiness while catching up; /api/ready stays 503 until Running
    let state = Arc::new(AppState {
        metrics: metrics.clone(),
        producer: Producer::new(log).with_default_topic(config.starter_topic.clone()),
        starter_topic: config.starter_topic.clone(),
        notification_topic: config.notification_topic.clone(),
        consumer_state: runtime.subscribe_state(),
    });
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Starter sync service listening on {}", addr);

    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let server_shutdown = server_shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    // Queued events are applied only after the reindex snapshot is written
    let consumed = catch_up_then_consume(&reindex, &runtime, &metrics, &shutdown).await;
    if let Ok(true) = consumed {
        shutdown.cancelled().await;
    }

    // Stop consuming first so no in-flight message is half applied
    if let Err(e) = runtime.stop().await {
        tracing::error!(error = %e, "Consumer runtime did not stop cleanly");
    }
    server_shutdown.cancel();

    server
        .await
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;
    consumed.context("Failed to start consumer group runtime")?;

    tracing::info!("Starter sync service stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
