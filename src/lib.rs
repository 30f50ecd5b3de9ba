//! # drivelog
//!
//! Automatic vehicle trip detection from a noisy GPS stream.
//!
//! This library provides:
//! - A trip detection state machine that infers trip start and end from
//!   speed and displacement, filtering GPS jitter
//! - Crash/suspend recovery of an in-progress trip through a single durable
//!   snapshot slot
//! - Assembly of immutable [`Trip`] records once the user confirms a save
//! - An async service that serializes samples, timers and address lookups
//!   through one event queue
//!
//! ## Features
//!
//! - **`persistence`** - SQLite-backed durable slot for the active trip
//! - **`http`** - OpenStreetMap reverse geocoder
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use drivelog::{EngineEvent, GpsSample, TrackerConfig, TripEngine, TripStatus};
//!
//! let mut engine = TripEngine::new(TrackerConfig::default());
//! let t0 = 1_700_000_000_000;
//!
//! // 10 km/h is above the start threshold
//! let sample = GpsSample::new(25.0330, 121.5654, 10.0, t0);
//! engine.handle(EngineEvent::Sample(sample), t0).unwrap();
//!
//! assert_eq!(engine.status(), TripStatus::Moving);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TripError};

// Detection policy and runtime configuration
pub mod config;
pub use config::TrackerConfig;

// Geographic utilities (distance, unit conversion, coordinate formatting)
pub mod geo_utils;

// Trip detection state machine
pub mod engine;
pub use engine::{AddressTarget, Effect, EngineEvent, EngineState, TripEngine, TripStatus};

// Durable snapshot of the active trip
pub mod snapshot;
pub use snapshot::{
    ActiveTripSnapshot, KeyValueSlot, MemorySlot, Recovery, SnapshotStore, ACTIVE_TRIP_KEY,
};

// SQLite-backed durable slot
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteSlot;

// Trip record assembly
pub mod assembler;
pub use assembler::assemble_trip;

// Live display values
pub mod display;
pub use display::{display_for, format_duration, TrackerDisplay};

// Stop-debounce timer
pub mod timer;
pub use timer::StopTimer;

// Reverse geocoding collaborator
pub mod geocode;
pub use geocode::{CoordinateGeocoder, Geocoder, ResolvedAddress};

// HTTP reverse geocoder
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::NominatimGeocoder;

// Async event loop around the engine
pub mod service;
pub use service::{
    Clock, IdGenerator, ManualClock, MemorySink, SystemClock, TripNotice, TripService,
    TripServiceHandle, TripSink, UuidGenerator,
};

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("DriveLogRust"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// One position and speed reading from the device's location sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed in km/h
    pub speed_kmh: f64,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl GpsSample {
    /// Create a new sample.
    pub fn new(latitude: f64, longitude: f64, speed_kmh: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            speed_kmh,
            timestamp,
        }
    }

    /// Create a sample from a platform reading in m/s.
    ///
    /// Platforms report a missing speed when they have no fix velocity;
    /// that reads as stationary.
    pub fn from_speed_mps(
        latitude: f64,
        longitude: f64,
        speed_mps: Option<f64>,
        timestamp: i64,
    ) -> Self {
        let speed_kmh = speed_mps
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(|s| s * 3.6)
            .unwrap_or(0.0);
        Self::new(latitude, longitude, speed_kmh, timestamp)
    }

    /// Check if the sample has usable coordinates and speed.
    pub fn is_valid(&self) -> bool {
        geo_utils::is_valid_coordinate(self.latitude, self.longitude)
            && self.speed_kmh.is_finite()
    }

    /// Location of this sample, without an address.
    pub fn location(&self) -> TripLocation {
        TripLocation::new(self.latitude, self.longitude)
    }
}

impl geo_utils::Located for GpsSample {
    fn coordinates(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }
}

/// A trip endpoint. Address fields are filled in asynchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maps_url: Option<String>,
}

impl TripLocation {
    /// Create a location with no resolved address.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            address: None,
            maps_url: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        geo_utils::is_valid_coordinate(self.latitude, self.longitude)
    }

    /// Resolved address, or the coordinate string when none is available.
    pub fn display_address(&self) -> String {
        match &self.address {
            Some(address) if !address.trim().is_empty() => address.clone(),
            _ => geo_utils::format_coordinates(self.latitude, self.longitude),
        }
    }

    /// Patch in a resolved address. Idempotent.
    pub fn apply_address(&mut self, resolved: &ResolvedAddress) {
        self.address = Some(resolved.address.clone());
        if resolved.maps_url.is_some() {
            self.maps_url = resolved.maps_url.clone();
        }
    }

    /// Copy with the address filled from coordinates if it never resolved.
    pub fn with_fallback_address(&self) -> Self {
        let mut location = self.clone();
        location.address = Some(self.display_address());
        location
    }
}

impl geo_utils::Located for TripLocation {
    fn coordinates(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }
}

/// Purpose of a trip, chosen by the user at save time.
/// Serialized as its label; the English names are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripType {
    #[serde(rename = "商業用途", alias = "business")]
    Business,
    #[serde(rename = "私人用途", alias = "private")]
    Private,
}

impl TripType {
    /// Label shown to users.
    pub fn label(&self) -> &'static str {
        match self {
            TripType::Business => "商業用途",
            TripType::Private => "私人用途",
        }
    }
}

impl fmt::Display for TripType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TripType {
    type Err = TripError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "商業用途" => Ok(TripType::Business),
            "私人用途" => Ok(TripType::Private),
            other => match other.to_ascii_lowercase().as_str() {
                "business" => Ok(TripType::Business),
                "private" => Ok(TripType::Private),
                _ => Err(TripError::config(format!("unknown trip type {:?}", other))),
            },
        }
    }
}

/// Distance unit preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    Km,
    Miles,
}

impl DistanceUnit {
    /// Convert a kilometer value into this unit.
    pub fn from_km(&self, km: f64) -> f64 {
        match self {
            DistanceUnit::Km => km,
            DistanceUnit::Miles => geo_utils::km_to_miles(km),
        }
    }

    /// Short suffix for display ("km" / "mi").
    pub fn suffix(&self) -> &'static str {
        match self {
            DistanceUnit::Km => "km",
            DistanceUnit::Miles => "mi",
        }
    }
}

impl FromStr for DistanceUnit {
    type Err = TripError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "km" | "kilometers" | "kilometres" => Ok(DistanceUnit::Km),
            "mi" | "mile" | "miles" => Ok(DistanceUnit::Miles),
            other => Err(TripError::config(format!("unknown distance unit {:?}", other))),
        }
    }
}

/// A finalized trip. Never mutated by the engine after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    /// Epoch milliseconds
    pub start_time: i64,
    /// Epoch milliseconds
    pub end_time: i64,
    pub start_location: TripLocation,
    pub end_location: TripLocation,
    /// Always stored in kilometers
    pub distance_km: f64,
    /// Unit preference at save time
    pub unit: DistanceUnit,
    #[serde(rename = "type")]
    pub trip_type: TripType,
    pub notes: String,
    pub duration_seconds: u64,
}

// ============================================================================
// Tests
// ============================================================================
