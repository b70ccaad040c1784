//! The event types carried on the bus: `SensorReading` (spec.md §3) and the
//! `StatisticsComputed` completion event (spec.md §6).

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

#[derive(Clone, Debug)]
pub struct SensorReading {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub entity_id: String,
    pub value: Option<f64>,
    pub attributes: Option<JsonValue>,
    pub persistent: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct StatisticsComputed {
    pub window_end: DateTime<Utc>,
}

/// The typed envelope carried by the bus. New event kinds are added here as
/// variants rather than via a generic `Box<dyn Any>`, keeping `subscribe_all`
/// exhaustive-matchable.
#[derive(Clone, Debug)]
pub enum Event {
    SensorReading(SensorReading),
    StatisticsComputed(StatisticsComputed),
}

impl From<SensorReading> for Event {
    fn from(value: SensorReading) -> Self {
        Event::SensorReading(value)
    }
}

impl From<StatisticsComputed> for Event {
    fn from(value: StatisticsComputed) -> Self {
        Event::StatisticsComputed(value)
    }
}
