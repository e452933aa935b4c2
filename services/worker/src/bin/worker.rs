//! services/worker/src/bin/worker.rs

use async_openai::{config::OpenAIConfig, Client};
use likeshelf_core::{CategorizeSettings, Categorizer, SyncEngine, SyncSettings};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_lib::{
    adapters::{
        classifier::OpenAiClassifierAdapter, db::DbAdapter, youtube::YoutubeLikesAdapter,
    },
    config::Config,
    error::WorkerError,
    runner::Runner,
};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting worker...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool.clone(), config.quota_policy));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| WorkerError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    let openai_client = Client::with_config(openai_config);
    let classifier = Arc::new(OpenAiClassifierAdapter::new(
        openai_client,
        config.classifier_model.clone(),
    )?);
    let source = Arc::new(YoutubeLikesAdapter::new(
        config.youtube_api_base.clone(),
        config.source_timeout,
        db_adapter.clone(),
    )?);

    // --- 4. Build the Engines ---
    let sync_engine = Arc::new(SyncEngine::new(
        db_adapter.clone(),
        source,
        SyncSettings {
            full_sync_cooldown: config.full_sync_cooldown,
            ..SyncSettings::default()
        },
    ));
    let categorizer = Arc::new(Categorizer::new(
        db_adapter.clone(),
        classifier,
        CategorizeSettings {
            concurrency: config.classifier_concurrency,
            ..CategorizeSettings::default()
        },
    ));
    let runner = Runner::new(db_adapter, sync_engine, categorizer, config.user_concurrency);

    // --- 5. Run Until Interrupted ---
    if config.run_once {
        runner.run_cycle().await?;
        info!("Single cycle complete, exiting.");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received."),
            Err(e) => error!("Failed to listen for the shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    info!(interval_secs = config.sync_interval.as_secs(), "Worker loop started");
    let mut ticker = tokio::time::interval(config.sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = runner.run_cycle().await {
                    error!(error = %e, "Cycle aborted");
                }
            }
        }
    }

    db_pool.close().await;
    info!("Worker stopped.");
    Ok(())
}
