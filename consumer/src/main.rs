//! user-sync: mirror Debezium change events for the MongoDB `users` collection into
//! `PostgreSQL`.
//!
//! Run with: `cargo run --bin user-sync`
//!
//! Configuration comes from the environment (see `.env.example`). The process runs until
//! Ctrl-C or SIGTERM, finishes the in-flight message, then exits 0. Bootstrap failures
//! (configuration, database, broker) exit non-zero.

mod config;

use anyhow::Context;
use config::Config;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use user_sync_postgres::{DeadLetterQueue, PostgresUserStore};
use user_sync_projections::{ChangeProcessor, RetryPolicy, retry_with_backoff};
use user_sync_redpanda::RedpandaConsumer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();

    init_tracing()?;

    let config = Config::from_env().context("Invalid configuration")?;

    info!(
        brokers = %config.kafka.bootstrap_servers,
        topic = %config.kafka.topic,
        consumer_group = %config.kafka.group_id,
        "Starting user-sync"
    );

    // The database may still be starting when the consumer is deployed alongside it
    let connect_policy = RetryPolicy::builder()
        .max_retries(10)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(10))
        .build();
    let store = retry_with_backoff(&connect_policy, || {
        PostgresUserStore::connect(&config.postgres.url, config.postgres.max_connections)
    })
    .await
    .context("Failed to connect to PostgreSQL")?;
    info!("PostgreSQL connected");

    if config.postgres.run_migrations {
        store.migrate().await.context("Failed to run migrations")?;
        info!("Migrations complete");
    }

    match DeadLetterQueue::new(store.pool().clone()).count_pending().await {
        Ok(0) => {}
        Ok(pending) => warn!(pending, "Dead-letter queue has unresolved entries"),
        Err(e) => warn!(error = %e, "Failed to inspect dead-letter queue"),
    }

    let consumer = RedpandaConsumer::builder()
        .brokers(&config.kafka.bootstrap_servers)
        .topic(&config.kafka.topic)
        .consumer_group(&config.kafka.group_id)
        .auto_offset_reset(&config.kafka.auto_offset_reset)
        .build()
        .context("Failed to create Kafka consumer")?;

    let (mut processor, shutdown) =
        ChangeProcessor::new(consumer, store, config.processor_config());

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, finishing in-flight message");
        let _ = shutdown.send(true);
    });

    processor.run().await;

    info!("user-sync stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "user_sync=info,user_sync_projections=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}
