//! # Trip Service
//!
//! Async runtime around [`TripEngine`]. Position samples, operator commands,
//! stop-timer fires, address lookups and the periodic tick all pass through
//! one loop, so the engine only ever sees one event at a time.
//!
//! Recovery runs before the first command is read. Samples that arrive
//! early wait in the queue until the recovered trip has been adopted.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::display::{display_for, TrackerDisplay};
use crate::engine::{Effect, EngineEvent, TripEngine};
use crate::error::{Result, TripError};
use crate::geocode::{resolve_or_fallback, CoordinateGeocoder, Geocoder};
use crate::snapshot::{KeyValueSlot, Recovery, SnapshotStore};
use crate::timer::StopTimer;
use crate::{GpsSample, TrackerConfig, Trip, TripLocation, TripType};

// ============================================================================
// Collaborators
// ============================================================================

/// Receives saved trips. No acknowledgement is awaited.
pub trait TripSink: Send {
    fn append(&mut self, trip: Trip);
}

/// Keeps saved trips in memory. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    trips: Arc<Mutex<Vec<Trip>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trips(&self) -> Vec<Trip> {
        match self.trips.lock() {
            Ok(trips) => trips.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TripSink for MemorySink {
    fn append(&mut self, trip: Trip) {
        match self.trips.lock() {
            Ok(mut trips) => trips.push(trip),
            Err(poisoned) => poisoned.into_inner().push(trip),
        }
    }
}

impl TripSink for mpsc::UnboundedSender<Trip> {
    fn append(&mut self, trip: Trip) {
        if self.send(trip).is_err() {
            warn!("[TripService] Trip sink receiver dropped");
        }
    }
}

/// Produces a unique id per saved trip.
pub trait IdGenerator: Send {
    fn next_id(&mut self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&mut self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Wall-clock source in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock set by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Externally visible trip outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum TripNotice {
    Started { manual: bool },
    PendingSave { distance_km: f64 },
    Discarded { distance_km: f64 },
    Completed(Trip),
}

enum Command {
    /// Fire-and-forget event (samples, availability)
    Event(EngineEvent),
    /// Operation whose outcome is reported back
    Operation {
        event: EngineEvent,
        reply: oneshot::Sender<Result<()>>,
    },
    ConfirmSave {
        trip_type: TripType,
        notes: String,
        reply: oneshot::Sender<Result<Trip>>,
    },
    Shutdown,
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap, cloneable handle for talking to a running [`TripService`].
#[derive(Clone)]
pub struct TripServiceHandle {
    commands: mpsc::UnboundedSender<Command>,
    display: watch::Receiver<TrackerDisplay>,
    notices: broadcast::Sender<TripNotice>,
}

impl TripServiceHandle {
    /// Queue a position sample.
    pub fn submit_sample(&self, sample: GpsSample) -> Result<()> {
        self.send(Command::Event(EngineEvent::Sample(sample)))
    }

    /// Report whether a position source is present.
    pub fn set_source_available(&self, available: bool) -> Result<()> {
        self.send(Command::Event(EngineEvent::SourceAvailability { available }))
    }

    pub async fn force_start(&self, location: TripLocation) -> Result<()> {
        self.operation(EngineEvent::ForceStart { location }).await
    }

    /// Finalize now. `None` ends at the last known position.
    pub async fn force_stop(&self, location: Option<TripLocation>) -> Result<()> {
        self.operation(EngineEvent::ForceStop { location }).await
    }

    /// Save the pending trip and return the record handed to the sink.
    pub async fn confirm_save(&self, trip_type: TripType, notes: impl Into<String>) -> Result<Trip> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConfirmSave {
            trip_type,
            notes: notes.into(),
            reply,
        })?;
        rx.await.map_err(|_| TripError::ChannelClosed)?
    }

    pub async fn discard(&self) -> Result<()> {
        self.operation(EngineEvent::Discard).await
    }

    /// Latest published display values.
    pub fn display(&self) -> TrackerDisplay {
        self.display.borrow().clone()
    }

    pub fn watch_display(&self) -> watch::Receiver<TrackerDisplay> {
        self.display.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<TripNotice> {
        self.notices.subscribe()
    }

    /// Stop the service loop. Pending trip state stays in the snapshot slot.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    async fn operation(&self, event: EngineEvent) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Operation { event, reply })?;
        rx.await.map_err(|_| TripError::ChannelClosed)?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TripError::ChannelClosed)
    }
}

// ============================================================================
// Service
// ============================================================================

/// Owns the engine and executes its effects.
pub struct TripService<S> {
    engine: TripEngine,
    store: SnapshotStore<S>,
    geocoder: Arc<dyn Geocoder>,
    sink: Box<dyn TripSink>,
    ids: Box<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    timer: StopTimer,

    commands: mpsc::UnboundedReceiver<Command>,
    /// Timer fires and address lookups re-enter the loop here
    internal_tx: mpsc::UnboundedSender<EngineEvent>,
    internal_rx: mpsc::UnboundedReceiver<EngineEvent>,

    display_tx: watch::Sender<TrackerDisplay>,
    notices: broadcast::Sender<TripNotice>,
}

impl<S: KeyValueSlot + 'static> TripService<S> {
    /// Create a service and its handle.
    ///
    /// Defaults: coordinate-only geocoder, in-memory sink, v4 UUIDs and the
    /// system clock.
    pub fn new(config: TrackerConfig, slot: S) -> Result<(Self, TripServiceHandle)> {
        config.validate()?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (display_tx, display_rx) = watch::channel(TrackerDisplay {
            unit: config.preferred_unit,
            ..TrackerDisplay::default()
        });
        let (notices, _) = broadcast::channel(32);

        let handle = TripServiceHandle {
            commands: commands_tx,
            display: display_rx,
            notices: notices.clone(),
        };

        let service = Self {
            engine: TripEngine::new(config),
            store: SnapshotStore::new(slot),
            geocoder: Arc::new(CoordinateGeocoder),
            sink: Box::new(MemorySink::new()),
            ids: Box::new(UuidGenerator),
            clock: Arc::new(SystemClock),
            timer: StopTimer::new(),
            commands,
            internal_tx,
            internal_rx,
            display_tx,
            notices,
        };
        Ok((service, handle))
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn with_sink(mut self, sink: impl TripSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run until shutdown or until every handle is dropped.
    ///
    /// Returns the slot so callers can inspect what was left persisted.
    pub async fn run(mut self) -> S {
        self.recover();

        let period = Duration::from_secs(self.engine.config().persist_interval_seconds);
        let now = tokio::time::Instant::now();
        let mut tick = tokio::time::interval_at(now.checked_add(period).unwrap_or(now), period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("[TripService] Running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(event) = self.internal_rx.recv() => {
                    if let Err(e) = self.dispatch(event) {
                        warn!("[TripService] Internal event failed: {}", e);
                    }
                }
                _ = tick.tick() => self.on_tick(),
            }
        }

        info!("[TripService] Stopped while {}", self.engine.status());
        self.timer = StopTimer::new();
        self.store.into_inner()
    }

    fn recover(&mut self) {
        let now = self.clock.now_ms();
        let window = self.engine.config().recovery_window_ms();
        match self.store.try_recover(window, now) {
            Recovery::Restored(state) => {
                if let Err(e) = self.dispatch(EngineEvent::Restore(state)) {
                    warn!("[TripService] Could not adopt recovered trip: {}", e);
                }
            }
            other => debug!("[TripService] No recovery: {:?}", other),
        }
        self.publish(now);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Event(event) => {
                if let Err(e) = self.dispatch(event) {
                    warn!("[TripService] Event failed: {}", e);
                }
            }
            Command::Operation { event, reply } => {
                let result = self.dispatch(event).map(|_| ());
                let _ = reply.send(result);
            }
            Command::ConfirmSave {
                trip_type,
                notes,
                reply,
            } => {
                let trip_id = self.ids.next_id();
                let result = self
                    .dispatch(EngineEvent::ConfirmSave {
                        trip_id,
                        trip_type,
                        notes,
                    })
                    .and_then(|trip| {
                        trip.ok_or(TripError::MissingState {
                            field: "completed trip",
                        })
                    });
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    fn on_tick(&mut self) {
        let now = self.clock.now_ms();
        if !self.engine.state().is_idle() {
            if let Err(e) = self.store.save(self.engine.state(), now) {
                warn!("[TripService] Periodic snapshot failed: {}", e);
            }
        }
        self.publish(now);
    }

    /// Feed one event to the engine and carry out its effects.
    /// Returns the trip if this event completed one.
    fn dispatch(&mut self, event: EngineEvent) -> Result<Option<Trip>> {
        let now = self.clock.now_ms();
        let effects = self.engine.handle(event, now)?;

        let mut completed = None;
        for effect in effects {
            if let Some(trip) = self.execute(effect, now) {
                completed = Some(trip);
            }
        }
        self.publish(now);
        Ok(completed)
    }

    fn execute(&mut self, effect: Effect, now: i64) -> Option<Trip> {
        match effect {
            Effect::ScheduleStopTimer {
                generation,
                delay_ms,
            } => {
                let tx = self.internal_tx.clone();
                self.timer
                    .schedule(generation, Duration::from_millis(delay_ms), move |generation| async move {
                        let _ = tx.send(EngineEvent::TimerFired { generation });
                    });
            }
            Effect::CancelStopTimer { generation } => {
                self.timer.cancel(generation);
            }
            Effect::ResolveAddress {
                target,
                trip_generation,
                latitude,
                longitude,
            } => {
                let geocoder = Arc::clone(&self.geocoder);
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let address = resolve_or_fallback(geocoder.as_ref(), latitude, longitude).await;
                    let _ = tx.send(EngineEvent::AddressResolved {
                        target,
                        trip_generation,
                        address,
                    });
                });
            }
            Effect::PersistSnapshot => {
                if let Err(e) = self.store.save(self.engine.state(), now) {
                    warn!("[TripService] Snapshot write failed: {}", e);
                }
            }
            Effect::ClearSnapshot => {
                if let Err(e) = self.store.clear() {
                    warn!("[TripService] Snapshot clear failed: {}", e);
                }
            }
            Effect::TripStarted { manual } => self.notify(TripNotice::Started { manual }),
            Effect::TripPendingSave { distance_km } => {
                self.notify(TripNotice::PendingSave { distance_km })
            }
            Effect::TripDiscarded { distance_km } => {
                self.notify(TripNotice::Discarded { distance_km })
            }
            Effect::TripCompleted(trip) => {
                self.sink.append(trip.clone());
                self.notify(TripNotice::Completed(trip.clone()));
                return Some(trip);
            }
        }
        None
    }

    fn notify(&self, notice: TripNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn publish(&self, now: i64) {
        self.display_tx.send_replace(display_for(&self.engine, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySlot;
    use crate::TripStatus;

    const T0: i64 = 1_700_000_000_000;

    struct SequentialIds(u32);

    impl IdGenerator for SequentialIds {
        fn next_id(&mut self) -> String {
            self.0 += 1;
            format!("trip-{}", self.0)
        }
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(T0);
        let shared = clock.clone();
        shared.advance(1500);
        assert_eq!(clock.now_ms(), T0 + 1500);
        clock.set(5);
        assert_eq!(shared.now_ms(), 5);
    }

    #[test]
    fn test_uuid_ids_unique() {
        let mut ids = UuidGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
    }

    #[test]
    fn test_memory_sink_shared() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.append(Trip {
            id: "a".to_string(),
            start_time: 0,
            end_time: 0,
            start_location: TripLocation::new(0.0, 0.0),
            end_location: TripLocation::new(0.0, 0.0),
            distance_km: 0.0,
            unit: crate::DistanceUnit::Km,
            trip_type: TripType::Private,
            notes: String::new(),
            duration_seconds: 0,
        });
        assert_eq!(sink.trips().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrackerConfig {
            stop_speed_threshold_kmh: 10.0,
            ..TrackerConfig::default()
        };
        assert!(TripService::new(config, MemorySlot::new()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trip_round_trip() {
        let clock = ManualClock::new(T0);
        let sink = MemorySink::new();
        let (service, handle) = TripService::new(TrackerConfig::default(), MemorySlot::new()).unwrap();
        let service = service
            .with_clock(Arc::new(clock.clone()))
            .with_sink(sink.clone())
            .with_id_generator(SequentialIds(0));
        let task = tokio::spawn(service.run());

        handle
            .force_start(TripLocation::new(25.0330, 121.5654))
            .await
            .unwrap();
        assert_eq!(handle.display().status, TripStatus::Moving);

        clock.advance(42_000);
        handle.force_stop(None).await.unwrap();
        assert_eq!(handle.display().status, TripStatus::PendingSave);

        let trip = handle.confirm_save(TripType::Business, "").await.unwrap();
        assert_eq!(trip.id, "trip-1");
        assert_eq!(trip.duration_seconds, 42);
        assert_eq!(sink.trips(), vec![trip]);
        assert_eq!(handle.display().status, TripStatus::Idle);

        // Nothing left to save
        assert!(matches!(
            handle.confirm_save(TripType::Business, "").await,
            Err(TripError::InvalidTransition { .. })
        ));

        handle.shutdown().unwrap();
        let slot = task.await.unwrap();
        assert!(slot.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_reports_closed_service() {
        let (service, handle) = TripService::new(TrackerConfig::default(), MemorySlot::new()).unwrap();
        drop(service);
        assert!(matches!(
            handle.submit_sample(GpsSample::new(25.0, 121.5, 10.0, T0)),
            Err(TripError::ChannelClosed)
        ));
        assert!(matches!(handle.discard().await, Err(TripError::ChannelClosed)));
    }
}
