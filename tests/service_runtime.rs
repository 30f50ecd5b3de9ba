//! Service runtime tests on a paused tokio clock.
//!
//! The service reads wall-clock time through `Clock`; here it is tied to
//! tokio's virtual time so the 120 s stop debounce runs instantly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::time::Instant;

use drivelog::{
    ActiveTripSnapshot, Clock, EngineState, GpsSample, Geocoder, KeyValueSlot, MemorySink,
    MemorySlot, ResolvedAddress, SnapshotStore, TrackerConfig, TripLocation, TripNotice,
    TripService, TripServiceHandle, TripStatus, TripType, ACTIVE_TRIP_KEY,
};

const T0: i64 = 1_700_000_000_000;
const LAT: f64 = 25.0330;
const LNG: f64 = 121.5654;
const DEG_PER_KM: f64 = 1.0 / 111.195;

// ============================================================================
// Test collaborators
// ============================================================================

/// Epoch clock that follows tokio's (paused) time.
struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    fn shared() -> Arc<dyn Clock> {
        Arc::new(Self {
            origin: Instant::now(),
        })
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        T0 + self.origin.elapsed().as_millis() as i64
    }
}

/// Slot the test can inspect while the service owns it.
#[derive(Clone, Default)]
struct SharedSlot(Arc<Mutex<MemorySlot>>);

impl SharedSlot {
    fn snapshot(&self) -> Option<ActiveTripSnapshot> {
        let raw = self.0.lock().unwrap().get(ACTIVE_TRIP_KEY).unwrap()?;
        Some(serde_json::from_str(&raw).unwrap())
    }
}

impl KeyValueSlot for SharedSlot {
    fn get(&self, key: &str) -> drivelog::Result<Option<String>> {
        self.0.lock().unwrap().get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> drivelog::Result<()> {
        self.0.lock().unwrap().set(key, value)
    }

    fn delete(&mut self, key: &str) -> drivelog::Result<()> {
        self.0.lock().unwrap().delete(key)
    }
}

/// Geocoder answering with a fixed address after `delay`.
struct FixedGeocoder {
    address: &'static str,
    delay: Duration,
}

impl Geocoder for FixedGeocoder {
    fn reverse(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, drivelog::Result<ResolvedAddress>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(ResolvedAddress {
                address: self.address.to_string(),
                maps_url: Some(format!("https://maps.example/?q={},{}", latitude, longitude)),
            })
        })
    }
}

fn start_service<S>(slot: S, geocoder: Option<Arc<dyn Geocoder>>) -> (TripServiceHandle, MemorySink)
where
    S: KeyValueSlot + 'static,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let sink = MemorySink::new();
    let (service, handle) = TripService::new(TrackerConfig::default(), slot).unwrap();
    let mut service = service.with_clock(TokioClock::shared()).with_sink(sink.clone());
    if let Some(geocoder) = geocoder {
        service = service.with_geocoder(geocoder);
    }
    tokio::spawn(service.run());
    (handle, sink)
}

async fn wait_for_pending(notices: &mut broadcast::Receiver<TripNotice>) -> f64 {
    loop {
        let notice = tokio::time::timeout(Duration::from_secs(600), notices.recv())
            .await
            .expect("no pending-save notice")
            .expect("notice channel closed");
        if let TripNotice::PendingSave { distance_km } = notice {
            return distance_km;
        }
    }
}

fn sample(lat: f64, speed_kmh: f64) -> GpsSample {
    GpsSample::new(lat, LNG, speed_kmh, 0)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_auto_stop_then_save() {
    let (handle, sink) = start_service(MemorySlot::new(), None);
    let mut notices = handle.notices();

    handle.submit_sample(sample(LAT, 30.0)).unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.submit_sample(sample(LAT + 0.5 * DEG_PER_KM, 45.0)).unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.submit_sample(sample(LAT + 0.5 * DEG_PER_KM, 0.0)).unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(handle.display().status, TripStatus::StoppedWaiting);

    let distance = wait_for_pending(&mut notices).await;
    assert!((distance - 0.5).abs() < 0.01, "got {}", distance);
    assert_eq!(handle.display().status, TripStatus::PendingSave);

    let trip = handle.confirm_save(TripType::Business, "site visit").await.unwrap();
    // Ends when the vehicle stopped, not when the debounce elapsed
    assert_eq!(trip.duration_seconds, 20);
    assert_eq!(trip.start_time, T0);
    assert_eq!(trip.notes, "site visit");
    assert!(uuid::Uuid::parse_str(&trip.id).is_ok());
    assert_eq!(sink.trips().len(), 1);
    assert_eq!(handle.display().status, TripStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_short_stop_discarded() {
    let (handle, sink) = start_service(MemorySlot::new(), None);
    let mut notices = handle.notices();

    handle.submit_sample(sample(LAT, 9.0)).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.submit_sample(sample(LAT + 0.02 * DEG_PER_KM, 0.0)).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.submit_sample(sample(LAT + 0.02 * DEG_PER_KM, 0.0)).unwrap();

    let discarded = loop {
        match tokio::time::timeout(Duration::from_secs(600), notices.recv())
            .await
            .unwrap()
            .unwrap()
        {
            TripNotice::Discarded { distance_km } => break distance_km,
            TripNotice::PendingSave { .. } => panic!("short trip should not await save"),
            _ => {}
        }
    };
    assert!(discarded < 0.05);
    assert!(sink.trips().is_empty());
    assert_eq!(handle.display().status, TripStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_applied_before_queued_samples() {
    let slot = SharedSlot::default();
    {
        let mut store = SnapshotStore::new(slot.clone());
        let state = EngineState {
            status: TripStatus::Moving,
            start_location: Some(TripLocation::new(LAT, LNG)),
            last_tracked_location: Some(TripLocation::new(LAT, LNG)),
            accumulated_distance_km: 2.0,
            start_timestamp: Some(T0 - 30 * 60 * 1000),
            ..EngineState::default()
        };
        store.save(&state, T0 - 60_000).unwrap();
    }

    let _ = env_logger::builder().is_test(true).try_init();
    let (service, handle) = TripService::new(TrackerConfig::default(), slot.clone()).unwrap();
    let service = service.with_clock(TokioClock::shared());

    // Queued before the loop starts
    handle.submit_sample(sample(LAT + 0.2 * DEG_PER_KM, 30.0)).unwrap();
    tokio::spawn(service.run());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let display = handle.display();
    assert_eq!(display.status, TripStatus::Moving);
    assert!((display.distance - 2.2).abs() < 0.01, "got {}", display.distance);
    assert_eq!(display.elapsed_seconds, 30 * 60);

    let snapshot = slot.snapshot().expect("snapshot kept while moving");
    assert_eq!(snapshot.start_timestamp, T0 - 30 * 60 * 1000);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_snapshot_refresh() {
    let slot = SharedSlot::default();
    let (handle, _sink) = start_service(slot.clone(), None);

    handle.force_start(TripLocation::new(LAT, LNG)).await.unwrap();
    let first = slot.snapshot().unwrap().last_updated;

    tokio::time::sleep(Duration::from_secs(31)).await;
    let refreshed = slot.snapshot().unwrap().last_updated;
    assert!(refreshed >= first + 30_000, "{} vs {}", refreshed, first);

    // Shutdown leaves the active trip in the slot for the next launch
    handle.shutdown().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(slot.snapshot().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_resolved_addresses_patch_trip() {
    let geocoder: Arc<dyn Geocoder> = Arc::new(FixedGeocoder {
        address: "Taipei 101",
        delay: Duration::from_millis(200),
    });
    let (handle, _sink) = start_service(MemorySlot::new(), Some(geocoder));

    handle.force_start(TripLocation::new(LAT, LNG)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.display().start_address.as_deref(), Some("Taipei 101"));

    handle
        .force_stop(Some(TripLocation::new(LAT + 0.01, LNG)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let trip = handle.confirm_save(TripType::Private, "").await.unwrap();
    assert_eq!(trip.start_location.address.as_deref(), Some("Taipei 101"));
    assert_eq!(trip.end_location.address.as_deref(), Some("Taipei 101"));
    assert!(trip.end_location.maps_url.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_slow_geocoder_never_blocks_save() {
    let geocoder: Arc<dyn Geocoder> = Arc::new(FixedGeocoder {
        address: "Too late",
        delay: Duration::from_secs(3600),
    });
    let (handle, sink) = start_service(MemorySlot::new(), Some(geocoder));

    handle.force_start(TripLocation::new(LAT, LNG)).await.unwrap();
    handle.force_stop(None).await.unwrap();
    let trip = handle.confirm_save(TripType::Business, "").await.unwrap();
    assert_eq!(trip.start_location.address.as_deref(), Some("25.03300, 121.56540"));

    // Late lookups are dropped once the trip is saved
    tokio::time::sleep(Duration::from_secs(3601)).await;
    let display = handle.display();
    assert_eq!(display.status, TripStatus::Idle);
    assert!(display.start_address.is_none());
    assert_eq!(sink.trips(), vec![trip]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_operations_rejected() {
    let (handle, _sink) = start_service(MemorySlot::new(), None);

    assert!(handle.discard().await.is_err());
    assert!(handle.force_stop(None).await.is_err());
    assert!(handle.confirm_save(TripType::Business, "").await.is_err());

    handle.force_start(TripLocation::new(LAT, LNG)).await.unwrap();
    assert!(handle.force_start(TripLocation::new(LAT, LNG)).await.is_err());
    assert_eq!(handle.display().status, TripStatus::Moving);
}

#[tokio::test(start_paused = true)]
async fn test_source_unavailable_stays_idle() {
    let (handle, _sink) = start_service(MemorySlot::new(), None);

    handle.set_source_available(false).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let display = handle.display();
    assert!(!display.source_available);
    assert_eq!(display.status, TripStatus::Idle);
}
