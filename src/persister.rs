//! Subscribes to persistent `SensorReading` events and writes one row per
//! event (spec.md §4.8). Per-event, not batched, to keep latency low;
//! individual event loss is preferable to stalling the pipeline, so
//! failures are logged and swallowed rather than propagated.

use crate::bus::{EventBusHandle, EventFilter};
use crate::entity::EntityRegistry;
use crate::events::Event;
use crate::repo::{EventRepo, EventRow};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Subscribes to persistent readings and saves one row each. Readings whose
/// `entity_id` isn't in the registry are logged and dropped rather than
/// persisted (spec.md §3 invariant: every reading either has a registered
/// entity or is ignored downstream).
pub fn spawn(bus: &EventBusHandle, repo: Arc<dyn EventRepo>, registry: Arc<EntityRegistry>) -> JoinHandle<()> {
    bus.subscribe(EventFilter::SensorReadings, move |event| {
        let repo = repo.clone();
        let registry = registry.clone();
        Box::pin(async move {
            let Event::SensorReading(reading) = event else {
                return;
            };
            if !reading.persistent {
                return;
            }
            if !registry.contains(&reading.entity_id) {
                tracing::warn!(entity_id = %reading.entity_id, "dropping reading for unregistered entity");
                return;
            }
            let row = EventRow {
                timestamp: reading.timestamp,
                entity_id: reading.entity_id.clone(),
                value: reading.value,
                attributes: reading.attributes.clone(),
            };
            if let Err(err) = repo.save(row).await {
                tracing::warn!(
                    entity_id = %reading.entity_id,
                    error = %err,
                    "failed to persist sensor reading"
                );
            }
        })
    })
}
