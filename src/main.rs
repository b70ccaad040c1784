mod adapter;
mod aggregator;
mod bus;
mod config;
mod crc16;
mod davis;
mod entity;
mod error;
mod events;
mod health;
mod persister;
mod repo;

use crate::adapter::Adapter;
use crate::aggregator::Aggregator;
use crate::bus::EventBus;
use crate::config::Config;
use crate::davis::adapter::DavisConfig;
use crate::davis::DavisAdapter;
use crate::entity::EntityRegistry;
use crate::repo::postgres::{
    PostgresEntityRepo, PostgresEventRepo, PostgresLongTermStatRepo, PostgresShortTermStatRepo,
};
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,weather_ingestd=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.database_url)
        .await?;

    let entity_repo = Arc::new(PostgresEntityRepo::new(pool.clone()));
    let event_repo = Arc::new(PostgresEventRepo::new(pool.clone()));
    let short_term_repo = Arc::new(PostgresShortTermStatRepo::new(pool.clone()));
    let long_term_repo = Arc::new(PostgresLongTermStatRepo::new(pool.clone()));

    let davis_config = DavisConfig {
        baud_rate: config.davis.baud_rate,
        loop_count: config.davis.loop_count,
        wakeup_timeout_ms: config.davis.wakeup_timeout_ms,
        reconnect_delay_ms: config.davis.reconnect_delay_ms,
        latitude: config.davis.latitude,
        longitude: config.davis.longitude,
        altitude: config.davis.altitude,
    };

    let bus_handle = EventBus::start(config.bus_buffer_size);

    let davis_adapter = Arc::new(DavisAdapter::new(
        bus_handle.bus(),
        config.davis.serial_port.clone(),
        davis_config,
    ));

    // Entity registry is built once at startup from every adapter's
    // catalog and is never mutated thereafter (spec.md §9 "global state").
    let adapters: Vec<Arc<dyn Adapter>> = vec![davis_adapter.clone()];
    let registry = Arc::new(EntityRegistry::build(
        adapters.iter().map(|a| a.provided_entities()),
    ));
    for entity in registry.iter() {
        if let Err(err) = entity_repo.upsert(entity).await {
            tracing::warn!(entity_id = %entity.entity_id, error = %err, "failed to upsert entity catalog");
        }
    }

    let _persister_handle = persister::spawn(&bus_handle, event_repo.clone(), registry.clone());

    let aggregator = Aggregator::new(
        registry.clone(),
        event_repo,
        short_term_repo,
        long_term_repo,
        bus_handle.bus(),
    );
    let _aggregator_handle = aggregator.spawn(&bus_handle);

    for adapter in &adapters {
        adapter.start().await?;
    }

    let health_state = Arc::new(health::HealthState {
        adapters: adapters.clone(),
        bus_stats: bus_handle.bus().stats(),
    });
    let health_bind_addr = config.health_bind_addr.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(err) = health::serve(&health_bind_addr, health_state).await {
            tracing::error!(error = %err, "health server exited");
        }
    });

    tokio::select! {
        res = health_handle => {
            if let Err(err) = res {
                tracing::error!(error = %err, "health task failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    for adapter in &adapters {
        adapter.stop().await;
    }
    bus_handle.shutdown().await;

    Ok(())
}
