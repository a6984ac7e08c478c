//! Mod subscription service binary.
//!
//! Wires the command surface and the durable projection consumer to
//! `PostgreSQL` and exposes the commands over HTTP. The consumer runs as
//! a supervised background task: a dropped subscription or a fatal
//! transport error restarts it from the durable cursor after a short
//! backoff, and shutdown (ctrl-c) cancels it cleanly.

mod config;
mod http;

use anyhow::Context;
use modsub::command::SubscriptionCommands;
use modsub::consumer::{ConsumerExit, SubscriptionConsumer};
use modsub::dispatch::EventDispatcher;
use modsub::log::EventLog;
use modsub::store::ProjectionStore;
use modsub_postgres::{PostgresConfig, PostgresEventLog, PostgresProjectionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::http::AppState;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    info!(listen = %config.listen_addr, cursor = %config.cursor_name, "starting modsub-server");

    let pool = modsub_postgres::connect(&config.postgres_uri, &PostgresConfig::default())
        .await
        .context("failed to connect to postgres")?;

    let log = Arc::new(PostgresEventLog::new(
        pool.clone(),
        PostgresConfig::default(),
    ));
    let store = Arc::new(PostgresProjectionStore::new(pool));

    log.ensure_schema()
        .await
        .context("event log schema setup failed")?;
    store
        .ensure_schema()
        .await
        .context("projection schema setup failed")?;

    let log: Arc<dyn EventLog> = log;
    let store: Arc<dyn ProjectionStore> = store;

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let consumer = SubscriptionConsumer::new(
        Arc::clone(&log),
        EventDispatcher::new(Arc::clone(&store)),
        config.cursor_name.clone(),
    );
    let consumer_task = tokio::spawn(supervise_consumer(consumer, shutdown_rx));

    let commands = Arc::new(SubscriptionCommands::new(log, store));
    let router = http::router(AppState::new(commands));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "http listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    // The listener is down; stop the consumer and wait for it to settle
    // any in-flight event.
    drop(shutdown_tx);
    consumer_task.await.context("consumer task panicked")?;
    info!("shutdown complete");

    Ok(())
}

/// Keeps the consumer running until shutdown.
///
/// Dropped subscriptions and fatal transport errors both restart the
/// receive loop from the durable cursor; at-least-once delivery and
/// idempotent application make the replay safe.
async fn supervise_consumer(consumer: SubscriptionConsumer, shutdown: watch::Receiver<()>) {
    loop {
        match consumer.run(shutdown.clone()).await {
            Ok(ConsumerExit::Cancelled) => {
                info!("consumer cancelled, exiting supervisor");
                return;
            }
            Ok(ConsumerExit::Dropped { reason }) => {
                warn!(%reason, "subscription dropped, reconnecting");
            }
            Err(err) => {
                error!(error = %err, "consumer failed, restarting");
            }
        }

        // Back off before reconnecting, but leave immediately if
        // shutdown arrives in the meantime.
        let mut shutdown = shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => return,
            () = tokio::time::sleep(RESTART_BACKOFF) => {}
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
