//! In-process multi-producer/multi-subscriber event bus (spec.md §4.7).
//!
//! `publish` enqueues onto a single bounded ingress channel (`buffer_size`,
//! default 10 000) and is non-blocking under nominal load: a full buffer
//! returns `BackpressureError` rather than dropping the event silently. A
//! dispatcher task drains the ingress queue and fans each event out to every
//! matching subscriber's own unbounded channel, so a slow subscriber never
//! backs up another subscriber or the publishing thread — only the shared
//! ingress buffer is a real backpressure point, matching spec.md §5's "bus
//! dispatcher: a bounded-elastic worker pool; subscribers run here."

use crate::error::IngestError;
use crate::events::Event;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Selects which events a subscriber receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventFilter {
    SensorReadings,
    StatisticsComputed,
    All,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::SensorReadings, Event::SensorReading(_)) => true,
            (EventFilter::StatisticsComputed, Event::StatisticsComputed(_)) => true,
            _ => false,
        }
    }
}

struct Subscription {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
pub struct BusStats {
    pub published: AtomicU64,
    pub dropped_backpressure: AtomicU64,
    pub dispatched: AtomicU64,
}

struct Inner {
    ingress_tx: mpsc::Sender<Event>,
    capacity: usize,
    stats: Arc<BusStats>,
}

/// Handle used to publish events and register subscribers. Cheap to clone;
/// every clone shares the same ingress channel and dispatcher task.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

pub struct EventBusHandle {
    pub bus: EventBus,
    dispatcher: JoinHandle<()>,
    subscribe_tx: mpsc::UnboundedSender<Subscription>,
}

impl EventBus {
    /// Builds the bus and spawns its dispatcher. Returns a handle bundling
    /// the publishable `EventBus` with the dispatcher's join handle for
    /// orderly shutdown.
    pub fn start(buffer_size: usize) -> EventBusHandle {
        let (ingress_tx, mut ingress_rx) = mpsc::channel(buffer_size.max(1));
        let (subscribe_tx, mut subscribe_rx) = mpsc::unbounded_channel::<Subscription>();
        let stats = Arc::new(BusStats::default());

        let dispatcher_stats = stats.clone();
        let dispatcher = tokio::spawn(async move {
            let mut subscriptions: Vec<Subscription> = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    sub = subscribe_rx.recv() => {
                        match sub {
                            Some(sub) => subscriptions.push(sub),
                            None => {}
                        }
                    }
                    event = ingress_rx.recv() => {
                        let Some(event) = event else { break };
                        subscriptions.retain(|sub| {
                            if !sub.filter.matches(&event) {
                                return true;
                            }
                            match sub.tx.send(event.clone()) {
                                Ok(()) => {
                                    dispatcher_stats.dispatched.fetch_add(1, Ordering::Relaxed);
                                    true
                                }
                                Err(_) => false,
                            }
                        });
                    }
                }
            }
            // Drain remaining subscription registrations so late subscribers
            // observe a closed bus rather than hanging forever.
            while subscribe_rx.recv().await.is_some() {}
        });

        let inner = Arc::new(Inner {
            ingress_tx,
            capacity: buffer_size.max(1),
            stats,
        });

        EventBusHandle {
            bus: EventBus { inner },
            dispatcher,
            subscribe_tx,
        }
    }
}

impl EventBus {
    pub fn publish(&self, event: impl Into<Event>) -> Result<(), IngestError> {
        let event = event.into();
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
        match self.inner.ingress_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner
                    .stats
                    .dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                Err(IngestError::Backpressure {
                    queue_depth: self.inner.capacity,
                    capacity: self.inner.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(IngestError::Protocol("event bus dispatcher has shut down".to_string()))
            }
        }
    }

    pub fn publish_batch(&self, events: impl IntoIterator<Item = Event>) -> Result<(), IngestError> {
        for event in events {
            self.publish(event)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Arc<BusStats> {
        self.inner.stats.clone()
    }
}

impl EventBusHandle {
    /// Registers a subscriber whose handler runs on a dedicated task, fed by
    /// its own unbounded channel in dispatch order (FIFO per publisher).
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> JoinHandle<()>
    where
        F: Fn(Event) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let _ = self.subscribe_tx.send(Subscription { filter, tx });
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event).await;
            }
        })
    }

    pub fn subscribe_all<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Event) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::All, handler)
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Drops the ingress side so the dispatcher drains and exits, then waits
    /// for it to finish (scoped shutdown per spec.md §9).
    pub async fn shutdown(self) {
        drop(self.bus);
        let _ = self.dispatcher.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SensorReading, StatisticsComputed};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    fn reading(entity_id: &str) -> SensorReading {
        SensorReading {
            timestamp: Utc::now(),
            source: "davis-serial".to_string(),
            entity_id: entity_id.to_string(),
            value: Some(1.0),
            attributes: None,
            persistent: true,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_publish_order() {
        let handle = EventBus::start(16);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = handle.subscribe_all(move |event| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                if let Event::SensorReading(r) = event {
                    seen.lock().unwrap().push(r.entity_id);
                }
            })
        });

        for i in 0..5 {
            handle
                .bus()
                .publish(reading(&format!("sensor.{i}")))
                .unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec!["sensor.0", "sensor.1", "sensor.2", "sensor.3", "sensor.4"]
        );
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_events() {
        let handle = EventBus::start(16);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = handle.subscribe(EventFilter::StatisticsComputed, move |_event| {
            let count = count_clone.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::Relaxed);
            })
        });

        handle.bus().publish(reading("sensor.a")).unwrap();
        handle
            .bus()
            .publish(StatisticsComputed {
                window_end: Utc::now(),
            })
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn publish_fails_with_backpressure_when_buffer_full() {
        let handle = EventBus::start(1);
        // No subscriber drains the dispatcher's ingress fast enough when we
        // publish faster than it can be read; a full channel surfaces as an
        // explicit error rather than a silent drop.
        let mut saw_backpressure = false;
        for i in 0..200 {
            if handle.bus().publish(reading(&format!("sensor.{i}"))).is_err() {
                saw_backpressure = true;
                break;
            }
        }
        assert!(saw_backpressure);
    }
}
