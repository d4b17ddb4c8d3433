use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use chatflow_core::adapters::{AdapterFactory, HttpAdapterFactory};
use chatflow_core::cache::RedisCache;
use chatflow_core::composer::SuccessStatusPolicy;
use chatflow_core::config::Config;
use chatflow_core::executor::ReqwestClient;
use chatflow_core::queue::RedisStreamQueue;
use chatflow_core::storage::PgStorage;
use chatflow_core::template::Renderer;
use chatflow_core::{AppState, processors, webhook};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if it exists
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting chatflow engine...");

    let config = Config::from_env().context("Invalid configuration")?;

    let storage = PgStorage::connect(&config.database_url, 20)
        .await
        .context("Failed to connect to Postgres")?;
    storage.migrate().await.context("Failed to run migrations")?;
    info!("Connected to Postgres.");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis_client.get_multiplexed_async_connection().await?;
    info!("Connected to Redis.");

    let queue = RedisStreamQueue::new(
        redis_conn.clone(),
        &config.stream_key,
        &config.consumer_group,
        &config.consumer_name,
    );
    queue.ensure_group().await.context("Failed to create consumer group")?;

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let adapters: Arc<dyn AdapterFactory> = Arc::new(
        HttpAdapterFactory::new(http.clone(), config.endpoints.clone())
            .with_identity_override(config.chat_identity)
            .with_messenger_app_secret(config.messenger_app_secret.clone()),
    );

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState {
        config,
        storage: Arc::new(storage),
        cache: Arc::new(RedisCache::new(redis_conn)),
        queue: Arc::new(queue),
        http: Arc::new(ReqwestClient::from_client(http)),
        adapters,
        policy: Arc::new(SuccessStatusPolicy),
        renderer: Renderer::new(),
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!(addr = bind_addr, "Webhook server listening");
    let app = webhook::router(state.clone());
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Webhook server stopped");
        }
    });

    tokio::select! {
        result = processors::run_worker(state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    server.abort();
    Ok(())
}
