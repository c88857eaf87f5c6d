//! CDC delivery agent binary.
//!
//! Drains the trigger-populated event log, transforms row mutations into
//! analytics events per the tracking configuration, and fans them out to the
//! configured destinations. Exits non-zero on any startup failure; once the
//! engine loop is running only a signal stops the process.

mod registry;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use rowcast::concurrency::shutdown::create_shutdown;
use rowcast::engine::DeliveryEngine;
use rowcast::rules::{RuleSet, apply_ignores};
use rowcast::store::postgres::PostgresLogStore;
use rowcast::transform::EventTransformer;
use rowcast_config::{AgentConfig, TrackingDocument};
use rowcast_postgres::introspect::introspect_schema;

use crate::registry::{LoopbackChannels, build_registry};

/// Connections for the claim transaction plus introspection at startup.
const DB_POOL_SIZE: u32 = 4;

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let config = AgentConfig::from_env().context("failed to load agent configuration")?;
    let document = TrackingDocument::from_path(&config.events_config_path)
        .context("failed to load tracking configuration")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(run_agent(config, document))
}

async fn run_agent(config: AgentConfig, document: TrackingDocument) -> anyhow::Result<()> {
    info!(
        batch_size = config.batch_size,
        interval_ms = config.fetch_interval.as_millis() as u64,
        internal_schema = config.internal_schema,
        event_log_table = config.event_log_table,
        "starting rowcast agent"
    );

    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_SIZE)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the source database")?;

    let mut descriptor = introspect_schema(&pool, &config.default_schema)
        .await
        .context("schema introspection failed")?;
    info!(tables = descriptor.len(), "loaded schema descriptor");

    apply_ignores(&mut descriptor, &document.ignore);
    info!(tables = descriptor.len(), "applied ignore rules to schema");

    let rules = RuleSet::compile(&document, Some(Arc::new(descriptor)))
        .context("failed to compile tracking rules against the schema")?;
    info!(rules = rules.len(), "compiled tracking rules");

    let (shutdown_tx, shutdown_rx) = create_shutdown();

    let (registry, flushers) =
        build_registry(&document, shutdown_rx.clone(), LoopbackChannels::default())
            .await
            .context("failed to initialize destinations")?;

    let store = PostgresLogStore::new(
        pool.clone(),
        &config.internal_schema,
        &config.event_log_table,
    );
    let transformer = EventTransformer::new(Arc::new(rules), config.default_schema.as_str());
    let engine = DeliveryEngine::new(
        store,
        transformer,
        registry,
        config.batch_size,
        config.fetch_interval,
        shutdown_rx,
    );

    // Flip the shutdown signal on SIGINT or SIGTERM; the engine finishes its
    // current transaction before exiting.
    let signal_task = tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint received, shutting down");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    engine.run().await?;

    // The buffered-sink flushers observe the same signal and flush on exit.
    for flusher in flushers {
        let _ = flusher.await;
    }

    signal_task.abort();
    let _ = signal_task.await;

    info!("agent stopped cleanly");
    Ok(())
}
