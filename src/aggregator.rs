//! Trigger-driven statistics aggregator (spec.md §4.9): collapses raw
//! per-entity events into 5-minute short-term rows and, on the hour, rolls
//! those up into hourly long-term rows. The Davis archive record closing
//! each 5-minute interval is the only wall-clock heartbeat in the system;
//! HTTP-poll adapters have no equivalent tick, so only `davis-serial`
//! persistent readings trigger aggregation (spec.md §4.9 "Trigger").

use crate::bus::{EventBus, EventBusHandle, EventFilter};
use crate::entity::{AggregationMethod, EntityRegistry};
use crate::events::{Event, StatisticsComputed};
use crate::repo::{EventRepo, EventRow, LongTermStat, LongTermStatRepo, ShortTermStat, ShortTermStatRepo};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

const WINDOW_SECS: i64 = 300;
const HOUR_SECS: i64 = 3600;
const TRIGGER_SOURCE: &str = "davis-serial";

fn align(t: DateTime<Utc>, period_secs: i64) -> DateTime<Utc> {
    let epoch = t.timestamp();
    let aligned = (epoch.div_euclid(period_secs)) * period_secs;
    DateTime::<Utc>::from_timestamp(aligned, 0).unwrap()
}

/// Per-entity last observed value, advanced only when a window's count > 0
/// (spec.md §3 invariant). Grows monotonically; entries are never removed.
#[derive(Default)]
struct LastValueCache {
    values: Mutex<HashMap<String, f64>>,
}

impl LastValueCache {
    fn get(&self, entity_id: &str) -> Option<f64> {
        self.values.lock().unwrap().get(entity_id).copied()
    }

    fn set(&self, entity_id: &str, value: f64) {
        self.values.lock().unwrap().insert(entity_id.to_string(), value);
    }
}

pub struct Aggregator {
    registry: Arc<EntityRegistry>,
    event_repo: Arc<dyn EventRepo>,
    short_term: Arc<dyn ShortTermStatRepo>,
    long_term: Arc<dyn LongTermStatRepo>,
    bus: EventBus,
    cache: LastValueCache,
    last_processed_window: Mutex<Option<DateTime<Utc>>>,
}

impl Aggregator {
    pub fn new(
        registry: Arc<EntityRegistry>,
        event_repo: Arc<dyn EventRepo>,
        short_term: Arc<dyn ShortTermStatRepo>,
        long_term: Arc<dyn LongTermStatRepo>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            event_repo,
            short_term,
            long_term,
            bus,
            cache: LastValueCache::default(),
            last_processed_window: Mutex::new(None),
        })
    }

    /// Subscribes to the bus and returns the subscriber task handle. The
    /// aggregator owns `last_value_cache` and `last_processed_window`
    /// exclusively (spec.md §3 "Ownership").
    pub fn spawn(self: &Arc<Self>, bus: &EventBusHandle) -> JoinHandle<()> {
        let this = self.clone();
        bus.subscribe(EventFilter::SensorReadings, move |event| {
            let this = this.clone();
            Box::pin(async move {
                let Event::SensorReading(reading) = event else { return };
                if reading.source != TRIGGER_SOURCE || !reading.persistent {
                    return;
                }
                this.on_trigger(reading.timestamp).await;
            })
        })
    }

    async fn on_trigger(&self, t: DateTime<Utc>) {
        let t_aligned = align(t, WINDOW_SECS);

        {
            let mut last = self.last_processed_window.lock().unwrap();
            if *last == Some(t_aligned) {
                return;
            }
            *last = Some(t_aligned);
        }

        let window_start = t_aligned - ChronoDuration::seconds(WINDOW_SECS);
        let window_end = t_aligned;

        for entity in self.registry.iter() {
            if let Err(err) = self
                .process_entity_window(&entity.entity_id, entity.aggregation_method, window_start, window_end)
                .await
            {
                tracing::warn!(
                    entity_id = %entity.entity_id,
                    window_start = %window_start,
                    error = %err,
                    "short-term aggregation failed for entity"
                );
            }
        }

        let hour_rollup_due = t_aligned.timestamp().rem_euclid(HOUR_SECS) == 0;
        if hour_rollup_due {
            let hour_start = t_aligned - ChronoDuration::seconds(HOUR_SECS);
            let hour_end = t_aligned;
            if let Err(err) = self.rollup_hour(hour_start, hour_end).await {
                tracing::warn!(
                    hour_start = %hour_start,
                    error = %err,
                    "hourly rollup failed"
                );
            }
        }

        let _ = self.bus.publish(StatisticsComputed { window_end });
    }

    async fn process_entity_window(
        &self,
        entity_id: &str,
        aggregation: AggregationMethod,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if self.short_term.exists(window_start, entity_id).await? {
            return Ok(());
        }

        let events = self
            .event_repo
            .in_window_for_stats(entity_id, window_start, window_end)
            .await?;

        if aggregation == AggregationMethod::None {
            if events.is_empty() {
                return Ok(());
            }
            let last_attributes = events.last().and_then(|e| e.attributes.clone());
            self.short_term
                .save(ShortTermStat {
                    window_start,
                    entity_id: entity_id.to_string(),
                    mean: None,
                    min: None,
                    max: None,
                    last: None,
                    sum: None,
                    count: events.len() as i64,
                    attributes: last_attributes,
                })
                .await?;
            return Ok(());
        }

        if events.is_empty() {
            let last_value = match self.cache.get(entity_id) {
                Some(v) => Some(v),
                None => self
                    .short_term
                    .latest(entity_id)
                    .await?
                    .and_then(|row| row.last),
            };
            let Some(last_value) = last_value else {
                return Ok(());
            };
            self.short_term
                .save(ShortTermStat {
                    window_start,
                    entity_id: entity_id.to_string(),
                    mean: Some(last_value),
                    min: Some(last_value),
                    max: Some(last_value),
                    last: Some(last_value),
                    sum: Some(last_value),
                    count: 0,
                    attributes: None,
                })
                .await?;
            return Ok(());
        }

        let numeric: Vec<f64> = events.iter().filter_map(|e| e.value).collect();
        if numeric.is_empty() {
            return Ok(());
        }
        let count = events.len() as i64;
        let sum: f64 = numeric.iter().sum();
        let mean = sum / numeric.len() as f64;
        let min = numeric.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = numeric.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let last = events
            .last()
            .and_then(|e| e.value)
            .unwrap_or(*numeric.last().unwrap());
        let last_attributes = events.last().and_then(|e| e.attributes.clone());

        self.cache.set(entity_id, last);

        self.short_term
            .save(ShortTermStat {
                window_start,
                entity_id: entity_id.to_string(),
                mean: Some(mean),
                min: Some(min),
                max: Some(max),
                last: Some(last),
                sum: Some(sum),
                count,
                attributes: last_attributes,
            })
            .await?;
        Ok(())
    }

    async fn rollup_hour(&self, hour_start: DateTime<Utc>, hour_end: DateTime<Utc>) -> anyhow::Result<()> {
        let rows = self.short_term.in_range(hour_start, hour_end).await?;

        let mut by_entity: HashMap<String, Vec<ShortTermStat>> = HashMap::new();
        for row in rows {
            by_entity.entry(row.entity_id.clone()).or_default().push(row);
        }

        for (entity_id, mut group) in by_entity {
            let Some(entity) = self.registry.get(&entity_id) else { continue };
            group.sort_by_key(|r| r.window_start);

            if self.long_term.exists(hour_start, &entity_id).await? {
                continue;
            }

            let last_row = match group.last() {
                Some(row) => row,
                None => continue,
            };

            if entity.aggregation_method == AggregationMethod::None {
                let count: i64 = group.iter().map(|r| r.count).sum();
                self.long_term
                    .save(LongTermStat {
                        window_start: hour_start,
                        entity_id: entity_id.clone(),
                        mean: None,
                        min: None,
                        max: None,
                        last: None,
                        sum: None,
                        count,
                        state: None,
                        attributes: last_row.attributes.clone(),
                    })
                    .await?;
                continue;
            }

            let weighted: Vec<&ShortTermStat> = group
                .iter()
                .filter(|r| r.count > 0 && r.mean.is_some())
                .collect();
            let total_count: i64 = weighted.iter().map(|r| r.count).sum();
            let weighted_sum: f64 = weighted.iter().map(|r| r.mean.unwrap() * r.count as f64).sum();
            let mean = if total_count > 0 {
                weighted_sum / total_count as f64
            } else {
                let means: Vec<f64> = group.iter().filter_map(|r| r.mean).collect();
                if means.is_empty() {
                    0.0
                } else {
                    means.iter().sum::<f64>() / means.len() as f64
                }
            };
            let min = group.iter().filter_map(|r| r.min).fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.min(v)))
            });
            let max = group.iter().filter_map(|r| r.max).fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            });
            let sum: f64 = group.iter().filter_map(|r| r.sum).sum();
            let last = last_row.last;
            let count: i64 = group.iter().map(|r| r.count).sum();

            let state = match entity.aggregation_method {
                AggregationMethod::Mean => Some(mean),
                AggregationMethod::Sum => Some(sum),
                AggregationMethod::Max => max,
                AggregationMethod::Min => min,
                AggregationMethod::Last => last,
                AggregationMethod::None => None,
            };

            self.long_term
                .save(LongTermStat {
                    window_start: hour_start,
                    entity_id: entity_id.clone(),
                    mean: Some(mean),
                    min,
                    max,
                    last,
                    sum: Some(sum),
                    count,
                    state,
                    attributes: last_row.attributes.clone(),
                })
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::entity::Entity;
    use crate::events::SensorReading;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, Duration};

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn entity(id: &str, method: AggregationMethod) -> Entity {
        Entity {
            entity_id: id.to_string(),
            friendly_name: id.to_string(),
            source: TRIGGER_SOURCE.to_string(),
            unit: "unit".to_string(),
            device_class: None,
            state_class: None,
            aggregation_method: method,
        }
    }

    #[derive(Default)]
    struct FakeEventRepo {
        rows: StdMutex<Vec<EventRow>>,
    }

    impl FakeEventRepo {
        fn insert(&self, row: EventRow) {
            self.rows.lock().unwrap().push(row);
        }
    }

    #[async_trait]
    impl EventRepo for FakeEventRepo {
        async fn save(&self, row: EventRow) -> anyhow::Result<()> {
            self.insert(row);
            Ok(())
        }
        async fn in_window_for_stats(
            &self,
            entity_id: &str,
            window_start: DateTime<Utc>,
            window_end: DateTime<Utc>,
        ) -> anyhow::Result<Vec<EventRow>> {
            let mut rows: Vec<EventRow> = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.entity_id == entity_id && r.timestamp > window_start && r.timestamp <= window_end)
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.timestamp);
            Ok(rows)
        }
    }

    #[derive(Default)]
    struct FakeShortTermRepo {
        rows: StdMutex<Vec<ShortTermStat>>,
    }

    #[async_trait]
    impl ShortTermStatRepo for FakeShortTermRepo {
        async fn exists(&self, window_start: DateTime<Utc>, entity_id: &str) -> anyhow::Result<bool> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.window_start == window_start && r.entity_id == entity_id))
        }
        async fn save(&self, row: ShortTermStat) -> anyhow::Result<()> {
            self.rows.lock().unwrap().push(row);
            Ok(())
        }
        async fn latest(&self, entity_id: &str) -> anyhow::Result<Option<ShortTermStat>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.entity_id == entity_id)
                .max_by_key(|r| r.window_start)
                .cloned())
        }
        async fn in_range(
            &self,
            range_start: DateTime<Utc>,
            range_end: DateTime<Utc>,
        ) -> anyhow::Result<Vec<ShortTermStat>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.window_start >= range_start && r.window_start < range_end)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeLongTermRepo {
        rows: StdMutex<Vec<LongTermStat>>,
    }

    #[async_trait]
    impl LongTermStatRepo for FakeLongTermRepo {
        async fn exists(&self, window_start: DateTime<Utc>, entity_id: &str) -> anyhow::Result<bool> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.window_start == window_start && r.entity_id == entity_id))
        }
        async fn save(&self, row: LongTermStat) -> anyhow::Result<()> {
            self.rows.lock().unwrap().push(row);
            Ok(())
        }
    }

    fn make_aggregator(
        entities: Vec<Entity>,
        event_repo: Arc<FakeEventRepo>,
        short_term: Arc<FakeShortTermRepo>,
        long_term: Arc<FakeLongTermRepo>,
    ) -> (Arc<Aggregator>, EventBusHandle) {
        let registry = Arc::new(EntityRegistry::build([entities]));
        let handle = EventBus::start(64);
        let aggregator = Aggregator::new(registry, event_repo, short_term, long_term, handle.bus());
        (aggregator, handle)
    }

    fn trigger_reading(t: DateTime<Utc>) -> SensorReading {
        SensorReading {
            timestamp: t,
            source: TRIGGER_SOURCE.to_string(),
            entity_id: "sensor.davis_archive_tick".to_string(),
            value: None,
            attributes: None,
            persistent: true,
        }
    }

    #[test]
    fn align_rounds_down_to_window_boundary() {
        assert_eq!(align(dt(2026, 1, 1, 12, 3, 23), WINDOW_SECS), dt(2026, 1, 1, 12, 0, 0));
        assert_eq!(align(dt(2026, 1, 1, 12, 5, 0), WINDOW_SECS), dt(2026, 1, 1, 12, 5, 0));
    }

    #[tokio::test]
    async fn four_samples_produce_mean_min_max_sum() {
        let event_repo = Arc::new(FakeEventRepo::default());
        let short_term = Arc::new(FakeShortTermRepo::default());
        let long_term = Arc::new(FakeLongTermRepo::default());
        for (sec, value) in [(1, 20.0), (2, 21.0), (3, 22.0), (4, 21.0)] {
            event_repo.insert(EventRow {
                timestamp: dt(2026, 1, 1, 12, 0, sec),
                entity_id: "sensor.davis_temp_out".to_string(),
                value: Some(value),
                attributes: None,
            });
        }

        let (aggregator, handle) = make_aggregator(
            vec![entity("sensor.davis_temp_out", AggregationMethod::Mean)],
            event_repo,
            short_term.clone(),
            long_term,
        );
        let _sub = aggregator.spawn(&handle);

        handle.bus().publish(trigger_reading(dt(2026, 1, 1, 12, 5, 0))).unwrap();
        sleep(Duration::from_millis(50)).await;

        let rows = short_term.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.window_start, dt(2026, 1, 1, 12, 0, 0));
        assert_eq!(row.mean, Some(21.0));
        assert_eq!(row.min, Some(20.0));
        assert_eq!(row.max, Some(22.0));
        assert_eq!(row.last, Some(21.0));
        assert_eq!(row.sum, Some(84.0));
        assert_eq!(row.count, 4);
    }

    #[tokio::test]
    async fn duplicate_trigger_is_idempotent() {
        let event_repo = Arc::new(FakeEventRepo::default());
        let short_term = Arc::new(FakeShortTermRepo::default());
        let long_term = Arc::new(FakeLongTermRepo::default());
        event_repo.insert(EventRow {
            timestamp: dt(2026, 1, 1, 12, 0, 1),
            entity_id: "sensor.davis_temp_out".to_string(),
            value: Some(20.0),
            attributes: None,
        });

        let (aggregator, handle) = make_aggregator(
            vec![entity("sensor.davis_temp_out", AggregationMethod::Mean)],
            event_repo,
            short_term.clone(),
            long_term,
        );
        let _sub = aggregator.spawn(&handle);

        handle.bus().publish(trigger_reading(dt(2026, 1, 1, 12, 5, 0))).unwrap();
        sleep(Duration::from_millis(50)).await;
        handle.bus().publish(trigger_reading(dt(2026, 1, 1, 12, 5, 0))).unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(short_term.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gap_fill_uses_cached_last_value() {
        let event_repo = Arc::new(FakeEventRepo::default());
        let short_term = Arc::new(FakeShortTermRepo::default());
        let long_term = Arc::new(FakeLongTermRepo::default());
        for (sec, value) in [(1, 20.0), (2, 21.0), (3, 22.0), (4, 21.0)] {
            event_repo.insert(EventRow {
                timestamp: dt(2026, 1, 1, 12, 0, sec),
                entity_id: "sensor.davis_temp_out".to_string(),
                value: Some(value),
                attributes: None,
            });
        }

        let (aggregator, handle) = make_aggregator(
            vec![entity("sensor.davis_temp_out", AggregationMethod::Mean)],
            event_repo,
            short_term.clone(),
            long_term,
        );
        let _sub = aggregator.spawn(&handle);

        handle.bus().publish(trigger_reading(dt(2026, 1, 1, 12, 5, 0))).unwrap();
        sleep(Duration::from_millis(50)).await;
        handle.bus().publish(trigger_reading(dt(2026, 1, 1, 12, 10, 0))).unwrap();
        sleep(Duration::from_millis(50)).await;

        let rows = short_term.rows.lock().unwrap();
        assert_eq!(rows.len(), 2);
        let gap_row = rows.iter().find(|r| r.window_start == dt(2026, 1, 1, 12, 5, 0)).unwrap();
        assert_eq!(gap_row.count, 0);
        assert_eq!(gap_row.mean, Some(21.0));
        assert_eq!(gap_row.min, Some(21.0));
        assert_eq!(gap_row.max, Some(21.0));
        assert_eq!(gap_row.last, Some(21.0));
    }

    #[tokio::test]
    async fn hourly_rollup_sums_rain_and_counts() {
        let event_repo = Arc::new(FakeEventRepo::default());
        let short_term = Arc::new(FakeShortTermRepo::default());
        let long_term = Arc::new(FakeLongTermRepo::default());

        for i in 0..12 {
            let window_start = dt(2026, 1, 1, 12, 0, 0) + ChronoDuration::seconds(i * 300);
            short_term.rows.lock().unwrap().push(ShortTermStat {
                window_start,
                entity_id: "sensor.davis_rain".to_string(),
                mean: Some((5 + i) as f64 / 5.0),
                min: Some(0.0),
                max: Some(2.0),
                last: Some(1.0),
                sum: Some((5 + i) as f64),
                count: 5,
                attributes: None,
            });
        }

        let (aggregator, handle) = make_aggregator(
            vec![entity("sensor.davis_rain", AggregationMethod::Sum)],
            event_repo,
            short_term,
            long_term.clone(),
        );
        let _sub = aggregator.spawn(&handle);

        handle.bus().publish(trigger_reading(dt(2026, 1, 1, 13, 0, 0))).unwrap();
        sleep(Duration::from_millis(50)).await;

        let rows = long_term.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.window_start, dt(2026, 1, 1, 12, 0, 0));
        assert_eq!(row.sum, Some(126.0));
        assert_eq!(row.state, Some(126.0));
        assert_eq!(row.count, 60);
    }
}
