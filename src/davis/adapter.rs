//! The Davis adapter: owns a protocol engine, turns parsed records into
//! `SensorReading` events, and issues archive-download requests when the
//! console's archive pointer advances (spec.md §4.5).

use crate::adapter::{Adapter, Health, HealthStatus, RecoveryHandle};
use crate::bus::EventBus;
use crate::davis::protocol::{Callbacks, EngineError, EngineState, ProtocolEngine};
use crate::davis::record::{ArchiveRecord, LoopRecord};
use crate::davis::transport::{is_simulated_port_name, RealSerialTransport, SerialTransport, SimulatedTransport};
use crate::entity::{AggregationMethod, Entity};
use crate::events::SensorReading;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SOURCE: &str = "davis-serial";
/// The archive pointer change handler rewinds by this much to cover the
/// closing window (spec.md §4.5 / §9 open question — the source does not
/// explain why 360 rather than 300; preserved as-is rather than "corrected"
/// to the window length, since doing so would be guessing past the note).
const ARCHIVE_REWIND_SECONDS: i64 = 360;
const UNHEALTHY_AFTER_SECS: i64 = 30;
const LOOP_NOMINAL_INTERVAL_SECS: i64 = 3;

#[derive(Clone, Copy, Debug)]
pub struct DavisConfig {
    pub baud_rate: u32,
    pub loop_count: u16,
    pub wakeup_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
}

fn entity_catalog() -> Vec<Entity> {
    let spec = [
        ("sensor.davis_temp_out", "Outdoor Temperature", "°C", AggregationMethod::Mean),
        ("sensor.davis_temp_in", "Indoor Temperature", "°C", AggregationMethod::Mean),
        ("sensor.davis_humidity_out", "Outdoor Humidity", "%", AggregationMethod::Mean),
        ("sensor.davis_humidity_in", "Indoor Humidity", "%", AggregationMethod::Mean),
        ("sensor.davis_pressure", "Barometric Pressure", "hPa", AggregationMethod::Mean),
        ("sensor.davis_wind_speed", "Wind Speed", "km/h", AggregationMethod::Mean),
        ("sensor.davis_wind_gust", "Wind Gust", "km/h", AggregationMethod::Max),
        ("sensor.davis_wind_direction", "Wind Direction", "deg", AggregationMethod::Last),
        ("sensor.davis_rain_rate", "Rain Rate", "mm/h", AggregationMethod::Mean),
        ("sensor.davis_rain", "Rain", "mm", AggregationMethod::Sum),
        ("sensor.davis_uv", "UV Index", "index", AggregationMethod::Max),
        ("sensor.davis_solar_radiation", "Solar Radiation", "W/m²", AggregationMethod::Mean),
        ("sensor.davis_console_battery", "Console Battery", "V", AggregationMethod::Last),
    ];
    spec.into_iter()
        .map(|(entity_id, friendly_name, unit, aggregation_method)| Entity {
            entity_id: entity_id.to_string(),
            friendly_name: friendly_name.to_string(),
            source: SOURCE.to_string(),
            unit: unit.to_string(),
            device_class: None,
            state_class: None,
            aggregation_method,
        })
        .collect()
}

fn loop_readings(record: LoopRecord, now: DateTime<Utc>) -> Vec<SensorReading> {
    let mut readings = Vec::new();
    let mut push = |entity_id: &str, value: Option<f64>| {
        if let Some(value) = value {
            readings.push(SensorReading {
                timestamp: now,
                source: SOURCE.to_string(),
                entity_id: entity_id.to_string(),
                value: Some(value),
                attributes: None,
                persistent: false,
            });
        }
    };

    push("sensor.davis_temp_out", record.temp_out_c);
    push("sensor.davis_temp_in", record.temp_in_c);
    push(
        "sensor.davis_humidity_out",
        record
            .humidity_out_pct
            .filter(|&h| h > 0 && h <= 100)
            .map(|h| h as f64),
    );
    push(
        "sensor.davis_humidity_in",
        record.humidity_in_pct.map(|h| h as f64),
    );
    push("sensor.davis_pressure", record.pressure_hpa);
    push("sensor.davis_wind_speed", record.wind_speed_kph);
    push("sensor.davis_wind_gust", record.wind_gust_10min_kph);
    push(
        "sensor.davis_wind_direction",
        record
            .wind_direction_deg
            .filter(|&d| d <= 360)
            .map(|d| d as f64),
    );
    push("sensor.davis_rain_rate", record.rain_rate_mm_per_h);
    push("sensor.davis_rain", record.rain_daily_mm);
    push(
        "sensor.davis_uv",
        record.uv_index.filter(|&uv| uv > 0.0),
    );
    push(
        "sensor.davis_solar_radiation",
        record.solar_radiation_wm2.filter(|&w| w > 0.0),
    );
    push("sensor.davis_console_battery", record.console_battery_v);
    readings
}

fn archive_readings(record: ArchiveRecord) -> Vec<SensorReading> {
    let ts = record.timestamp;
    let mut readings = Vec::new();
    let mut push = |entity_id: &str, value: Option<f64>| {
        if let Some(value) = value {
            readings.push(SensorReading {
                timestamp: ts,
                source: SOURCE.to_string(),
                entity_id: entity_id.to_string(),
                value: Some(value),
                attributes: None,
                persistent: true,
            });
        }
    };

    push("sensor.davis_temp_out", record.temp_out_avg_c);
    push("sensor.davis_temp_in", record.temp_in_c);
    push(
        "sensor.davis_humidity_out",
        record.humidity_out_pct.filter(|&h| h > 0 && h <= 100).map(|h| h as f64),
    );
    push(
        "sensor.davis_humidity_in",
        record.humidity_in_pct.map(|h| h as f64),
    );
    push("sensor.davis_pressure", record.pressure_hpa);
    push("sensor.davis_wind_speed", record.wind_avg_kph);
    push("sensor.davis_wind_gust", record.wind_peak_kph);
    push(
        "sensor.davis_wind_direction",
        record.wind_avg_direction_deg.filter(|&d| (0.0..=360.0).contains(&d)),
    );
    push("sensor.davis_rain_rate", record.rain_peak_rate_mm_per_h);
    push("sensor.davis_rain", record.rain_total_mm);
    push("sensor.davis_uv", record.uv_index.filter(|&uv| uv > 0.0));
    push(
        "sensor.davis_solar_radiation",
        record.solar_radiation_wm2.filter(|&w| w > 0.0),
    );
    readings
}

struct SharedState {
    last_successful_read: Mutex<Option<DateTime<Utc>>>,
    last_next_archive_record: AtomicI64,
    last_archive_boundary: Mutex<Option<DateTime<Utc>>>,
    /// Cleared by `stop()` before the engine is torn down, so the reconnect
    /// supervisor can tell an adapter-initiated shutdown apart from a hard
    /// transport error that also leaves the engine `Disconnected`.
    running: AtomicBool,
}

/// Owns a protocol engine over either a real serial port or the in-process
/// simulator, selected by `serial_port` (spec.md §6).
pub struct DavisAdapter {
    engine: Mutex<Option<Arc<ProtocolEngine<DynTransport>>>>,
    bus: EventBus,
    config: DavisConfig,
    serial_port: String,
    shared: Arc<SharedState>,
}

/// Both transport implementations are type-erased behind this so the engine
/// doesn't need to be generic over which one is active.
pub enum DynTransport {
    Real(RealSerialTransport),
    Simulated(SimulatedTransport),
}

impl SerialTransport for DynTransport {
    fn open(&self) -> Result<(), crate::davis::transport::TransportError> {
        match self {
            DynTransport::Real(t) => t.open(),
            DynTransport::Simulated(t) => t.open(),
        }
    }
    fn close(&self) {
        match self {
            DynTransport::Real(t) => t.close(),
            DynTransport::Simulated(t) => t.close(),
        }
    }
    fn write(&self, bytes: &[u8]) -> Result<(), crate::davis::transport::TransportError> {
        match self {
            DynTransport::Real(t) => t.write(bytes),
            DynTransport::Simulated(t) => t.write(bytes),
        }
    }
    fn set_data_callback(&self, callback: crate::davis::transport::DataCallback) {
        match self {
            DynTransport::Real(t) => t.set_data_callback(callback),
            DynTransport::Simulated(t) => t.set_data_callback(callback),
        }
    }
    fn clear_data_callback(&self) {
        match self {
            DynTransport::Real(t) => t.clear_data_callback(),
            DynTransport::Simulated(t) => t.clear_data_callback(),
        }
    }
    fn read_exact(
        &self,
        n: usize,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>, crate::davis::transport::TransportError> {
        match self {
            DynTransport::Real(t) => t.read_exact(n, timeout),
            DynTransport::Simulated(t) => t.read_exact(n, timeout),
        }
    }
    fn suspend_listener(&self) {
        match self {
            DynTransport::Real(t) => t.suspend_listener(),
            DynTransport::Simulated(t) => t.suspend_listener(),
        }
    }
    fn resume_listener(&self) {
        match self {
            DynTransport::Real(t) => t.resume_listener(),
            DynTransport::Simulated(t) => t.resume_listener(),
        }
    }
    fn is_connected(&self) -> bool {
        match self {
            DynTransport::Real(t) => t.is_connected(),
            DynTransport::Simulated(t) => t.is_connected(),
        }
    }
}

impl DavisAdapter {
    pub fn new(bus: EventBus, serial_port: String, config: DavisConfig) -> Self {
        Self {
            engine: Mutex::new(None),
            bus,
            config,
            serial_port,
            shared: Arc::new(SharedState {
                last_successful_read: Mutex::new(None),
                last_next_archive_record: AtomicI64::new(-1),
                last_archive_boundary: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    fn build_transport(&self) -> DynTransport {
        if is_simulated_port_name(&self.serial_port) {
            DynTransport::Simulated(SimulatedTransport::new())
        } else {
            DynTransport::Real(RealSerialTransport::new(&self.serial_port, self.config.baud_rate))
        }
    }

    /// Watches for a hard transport disconnect and re-enters `Waking` after
    /// `reconnect_delay_ms` (spec.md §7: "the adapter waits `reconnect_delay_ms`
    /// then re-enters `Waking`"). Exits as soon as `stop()` clears `running`,
    /// so an adapter-initiated shutdown (which also leaves the engine
    /// `Disconnected`) is never mistaken for a failure to recover from.
    async fn run_reconnect_supervisor(
        engine: Arc<ProtocolEngine<DynTransport>>,
        shared: Arc<SharedState>,
        reconnect_delay: Duration,
    ) {
        const POLL_INTERVAL: Duration = Duration::from_millis(250);
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
            if engine.state() != EngineState::Disconnected {
                continue;
            }
            tokio::time::sleep(reconnect_delay).await;
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = engine.start() {
                tracing::warn!(error = %err, "reconnect attempt failed, will retry");
            }
        }
    }
}

#[async_trait::async_trait]
impl Adapter for DavisAdapter {
    fn name(&self) -> &str {
        SOURCE
    }

    fn display_name(&self) -> &str {
        "Davis Vantage Pro"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn provided_entities(&self) -> Vec<Entity> {
        entity_catalog()
    }

    async fn health(&self) -> Health {
        let last_read = *self.shared.last_successful_read.lock().unwrap();
        match last_read {
            None => Health {
                status: HealthStatus::Degraded,
                message: "no LOOP packet parsed yet".to_string(),
                last_successful_read: None,
            },
            Some(ts) => {
                let age = (Utc::now() - ts).num_seconds();
                let status = if age > UNHEALTHY_AFTER_SECS * 3 {
                    HealthStatus::Unhealthy
                } else if age > LOOP_NOMINAL_INTERVAL_SECS * 2 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                Health {
                    status,
                    message: format!("last LOOP parsed {age}s ago"),
                    last_successful_read: Some(ts),
                }
            }
        }
    }

    fn supports_recovery(&self) -> bool {
        true
    }

    /// `to` is accepted for API symmetry but unused: DMPAFT returns
    /// everything strictly after `from` (spec.md §4.5, §9).
    fn request_recovery(&self, from: DateTime<Utc>, _to: Option<DateTime<Utc>>) -> Option<RecoveryHandle> {
        let engine = self.engine.lock().unwrap().clone()?;
        let handle = tokio::spawn(async move {
            if let Err(err) = engine.download_archive(from).await {
                tracing::warn!(error = %err, "recovery download_archive failed");
            }
        });
        Some(RecoveryHandle::new(handle))
    }

    async fn start(&self) -> anyhow::Result<()> {
        let transport = Arc::new(self.build_transport());
        let bus = self.bus.clone();
        let shared_loop = self.shared.clone();

        let engine_slot: Arc<Mutex<Option<Arc<ProtocolEngine<DynTransport>>>>> = Arc::new(Mutex::new(None));
        let engine_slot_for_loop = engine_slot.clone();
        let rewind_shared = self.shared.clone();

        let on_loop = Arc::new(move |record: LoopRecord| {
            let now = Utc::now();
            *shared_loop.last_successful_read.lock().unwrap() = Some(now);

            let prev = rewind_shared
                .last_next_archive_record
                .swap(record.next_archive_record as i64, Ordering::SeqCst);
            if prev >= 0 && prev != record.next_archive_record as i64 {
                if let Some(prev_archive_time) = *rewind_shared.last_archive_boundary.lock().unwrap() {
                    if let Some(engine) = engine_slot_for_loop.lock().unwrap().clone() {
                        let from = prev_archive_time - chrono::Duration::seconds(ARCHIVE_REWIND_SECONDS);
                        tokio::spawn(async move {
                            if let Err(err) = engine.download_archive(from).await {
                                tracing::warn!(error = %err, "archive-pointer-triggered download failed");
                            }
                        });
                    }
                }
            }

            for reading in loop_readings(record, now) {
                if let Err(err) = bus.publish(reading) {
                    tracing::warn!(error = %err, "failed to publish LOOP reading");
                }
            }
        });

        let bus = self.bus.clone();
        let archive_shared = self.shared.clone();
        let on_archive = Arc::new(move |record: ArchiveRecord| {
            *archive_shared.last_archive_boundary.lock().unwrap() = Some(record.timestamp);
            for reading in archive_readings(record) {
                if let Err(err) = bus.publish(reading) {
                    tracing::warn!(error = %err, "failed to publish archive reading");
                }
            }
        });

        let on_state_change = Arc::new(|state: EngineState| {
            tracing::debug!(?state, "davis protocol engine state changed");
        });
        let on_error = Arc::new(|msg: String| {
            tracing::warn!(message = %msg, "davis protocol engine error");
        });

        let callbacks = Callbacks {
            on_loop,
            on_archive,
            on_state_change,
            on_error,
        };

        let engine = ProtocolEngine::new(transport, callbacks, self.config.wakeup_timeout_ms);
        *engine_slot.lock().unwrap() = Some(engine.clone());
        *self.engine.lock().unwrap() = Some(engine.clone());

        self.shared.running.store(true, Ordering::SeqCst);
        engine.start().map_err(|err: EngineError| anyhow::anyhow!(err))?;

        let supervisor_engine = engine.clone();
        let supervisor_shared = self.shared.clone();
        let reconnect_delay = Duration::from_millis(self.config.reconnect_delay_ms);
        tokio::spawn(async move {
            Self::run_reconnect_supervisor(supervisor_engine, supervisor_shared, reconnect_delay).await;
        });

        Ok(())
    }

    async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(engine) = self.engine.lock().unwrap().take() {
            engine.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humidity_sentinel_is_suppressed_not_zeroed() {
        let record = LoopRecord {
            humidity_out_pct: None,
            temp_out_c: Some(22.2),
            ..Default::default()
        };
        let readings = loop_readings(record, Utc::now());
        assert!(readings.iter().all(|r| r.entity_id != "sensor.davis_humidity_out"));
        assert!(readings.iter().any(|r| r.entity_id == "sensor.davis_temp_out" && r.value == Some(22.2)));
    }

    #[test]
    fn out_of_range_wind_direction_is_suppressed() {
        let record = LoopRecord {
            wind_direction_deg: Some(400),
            ..Default::default()
        };
        let readings = loop_readings(record, Utc::now());
        assert!(readings.iter().all(|r| r.entity_id != "sensor.davis_wind_direction"));
    }

    #[test]
    fn entity_catalog_covers_every_published_entity_id() {
        let catalog = entity_catalog();
        let ids: std::collections::HashSet<_> = catalog.iter().map(|e| e.entity_id.as_str()).collect();
        assert!(ids.contains("sensor.davis_temp_out"));
        assert!(ids.contains("sensor.davis_rain"));
        assert_eq!(catalog.len(), ids.len());
    }

    #[tokio::test]
    async fn reconnect_supervisor_re_enters_waking_after_hard_disconnect() {
        let transport = Arc::new(SimulatedTransport::new());
        let callbacks = Callbacks {
            on_loop: Arc::new(|_| {}),
            on_archive: Arc::new(|_| {}),
            on_state_change: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
        };
        let engine = ProtocolEngine::new(transport, callbacks, 3000);
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.state(), EngineState::Looping);

        let shared = Arc::new(SharedState {
            last_successful_read: Mutex::new(None),
            last_next_archive_record: AtomicI64::new(-1),
            last_archive_boundary: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        let supervisor = tokio::spawn(DavisAdapter::run_reconnect_supervisor(
            engine.clone(),
            shared.clone(),
            Duration::from_millis(100),
        ));

        // Simulate a hard transport error: the engine itself transitions to
        // Disconnected without the adapter having called stop().
        engine.stop();
        assert_eq!(engine.state(), EngineState::Disconnected);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_ne!(engine.state(), EngineState::Disconnected);

        shared.running.store(false, Ordering::SeqCst);
        supervisor.abort();
    }

    #[tokio::test]
    async fn reconnect_supervisor_does_not_restart_after_deliberate_stop() {
        let transport = Arc::new(SimulatedTransport::new());
        let callbacks = Callbacks {
            on_loop: Arc::new(|_| {}),
            on_archive: Arc::new(|_| {}),
            on_state_change: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
        };
        let engine = ProtocolEngine::new(transport, callbacks, 3000);
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let shared = Arc::new(SharedState {
            last_successful_read: Mutex::new(None),
            last_next_archive_record: AtomicI64::new(-1),
            last_archive_boundary: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        let supervisor = tokio::spawn(DavisAdapter::run_reconnect_supervisor(
            engine.clone(),
            shared.clone(),
            Duration::from_millis(100),
        ));

        shared.running.store(false, Ordering::SeqCst);
        engine.stop();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.state(), EngineState::Disconnected);
        let _ = supervisor.await;
    }
}
