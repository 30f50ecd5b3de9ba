//! Detection policy and runtime configuration.
//!
//! Threshold values differ noticeably between deployments (start speed
//! 5–8 km/h, noise floor 1–5 m, minimum trip 20–200 m), so none of them are
//! hard-coded in the engine.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TripError};
use crate::DistanceUnit;

/// Longest accepted stop debounce (1 hour).
pub const MAX_STOP_DEBOUNCE_SECONDS: u64 = 60 * 60;

/// Longest accepted recovery window (7 days).
pub const MAX_RECOVERY_WINDOW_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted persistence tick (1 hour).
pub const MAX_PERSIST_INTERVAL_SECONDS: u64 = 60 * 60;

/// Configuration for trip detection, recovery and the service loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    /// Speed above which an idle vehicle is considered to have started a trip.
    /// Default: 5.0 km/h
    pub start_speed_threshold_kmh: f64,

    /// Speed below which a stationary vehicle arms the stop timer.
    /// Must be lower than the start threshold. Default: 2.0 km/h
    pub stop_speed_threshold_kmh: f64,

    /// How long the vehicle must stay put before the trip auto-stops.
    /// Default: 120 seconds
    pub stop_debounce_seconds: u64,

    /// Minimum displacement between tracked points that counts as travel.
    /// Anything smaller is GPS jitter. Default: 0.005 km (~5 m)
    pub displacement_noise_floor_km: f64,

    /// Trips shorter than this are discarded on auto-stop unless started manually.
    /// Default: 0.05 km
    pub min_trip_distance_km: f64,

    /// Maximum age of a persisted in-progress trip that is still resumable.
    /// Default: 4 hours
    pub recovery_window_seconds: u64,

    /// Interval of the periodic persistence/display tick.
    /// Default: 5 seconds
    pub persist_interval_seconds: u64,

    /// Unit used for display and recorded on saved trips.
    /// Default: kilometers
    pub preferred_unit: DistanceUnit,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            start_speed_threshold_kmh: 5.0,
            stop_speed_threshold_kmh: 2.0,
            stop_debounce_seconds: 120,
            displacement_noise_floor_km: 0.005,
            min_trip_distance_km: 0.05,
            recovery_window_seconds: 4 * 60 * 60,
            persist_interval_seconds: 5,
            preferred_unit: DistanceUnit::Km,
        }
    }
}

impl TrackerConfig {
    /// Stop debounce window in milliseconds.
    pub fn stop_debounce_ms(&self) -> u64 {
        self.stop_debounce_seconds.saturating_mul(1000)
    }

    /// Recovery window in milliseconds.
    pub fn recovery_window_ms(&self) -> i64 {
        i64::try_from(self.recovery_window_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    /// Check that thresholds are usable.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("start_speed_threshold_kmh", self.start_speed_threshold_kmh),
            ("stop_speed_threshold_kmh", self.stop_speed_threshold_kmh),
            ("displacement_noise_floor_km", self.displacement_noise_floor_km),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(TripError::config(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !self.min_trip_distance_km.is_finite() || self.min_trip_distance_km < 0.0 {
            return Err(TripError::config(format!(
                "min_trip_distance_km must be non-negative, got {}",
                self.min_trip_distance_km
            )));
        }
        if self.stop_speed_threshold_kmh >= self.start_speed_threshold_kmh {
            return Err(TripError::config(format!(
                "stop threshold ({} km/h) must be below start threshold ({} km/h)",
                self.stop_speed_threshold_kmh, self.start_speed_threshold_kmh
            )));
        }
        let durations = [
            ("stop_debounce_seconds", self.stop_debounce_seconds, MAX_STOP_DEBOUNCE_SECONDS),
            ("recovery_window_seconds", self.recovery_window_seconds, MAX_RECOVERY_WINDOW_SECONDS),
            ("persist_interval_seconds", self.persist_interval_seconds, MAX_PERSIST_INTERVAL_SECONDS),
        ];
        for (name, value, max) in durations {
            if value == 0 || value > max {
                return Err(TripError::config(format!(
                    "{} must be between 1 and {}, got {}",
                    name, max, value
                )));
            }
        }
        Ok(())
    }

    /// Load a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `DRIVELOG_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay variables from an arbitrary lookup on the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "DRIVELOG_START_SPEED_KMH")? {
            config.start_speed_threshold_kmh = v;
        }
        if let Some(v) = parse_var(&lookup, "DRIVELOG_STOP_SPEED_KMH")? {
            config.stop_speed_threshold_kmh = v;
        }
        if let Some(v) = parse_var(&lookup, "DRIVELOG_STOP_DEBOUNCE_SECS")? {
            config.stop_debounce_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "DRIVELOG_NOISE_FLOOR_KM")? {
            config.displacement_noise_floor_km = v;
        }
        if let Some(v) = parse_var(&lookup, "DRIVELOG_MIN_TRIP_KM")? {
            config.min_trip_distance_km = v;
        }
        if let Some(v) = parse_var(&lookup, "DRIVELOG_RECOVERY_WINDOW_SECS")? {
            config.recovery_window_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "DRIVELOG_PERSIST_INTERVAL_SECS")? {
            config.persist_interval_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "DRIVELOG_UNIT")? {
            config.preferred_unit = v;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| TripError::config(format!("{}={:?}: {}", key, raw, e))),
    }
}
