//! Live display values derived from the engine.

use serde::{Deserialize, Serialize};

use crate::engine::{TripEngine, TripStatus};
use crate::DistanceUnit;

/// What a UI shows while tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerDisplay {
    pub status: TripStatus,
    /// Accumulated distance in `unit`
    pub distance: f64,
    pub unit: DistanceUnit,
    pub elapsed_seconds: u64,
    /// `HH:MM:SS`
    pub elapsed_label: String,
    /// Most recent sample speed
    pub speed_kmh: f64,
    pub source_available: bool,
    pub start_address: Option<String>,
    pub end_address: Option<String>,
}

impl Default for TrackerDisplay {
    fn default() -> Self {
        Self {
            status: TripStatus::Idle,
            distance: 0.0,
            unit: DistanceUnit::Km,
            elapsed_seconds: 0,
            elapsed_label: format_duration(0),
            speed_kmh: 0.0,
            source_available: true,
            start_address: None,
            end_address: None,
        }
    }
}

/// Compute the display for `engine` at `now` (epoch ms).
///
/// Elapsed time is wall-clock based and stops at the end instant once the
/// trip is finalized.
pub fn display_for(engine: &TripEngine, now: i64) -> TrackerDisplay {
    let state = engine.state();
    let unit = engine.config().preferred_unit;

    let elapsed_seconds = match state.start_timestamp {
        Some(start) => {
            let end = state.end_timestamp.unwrap_or(now);
            ((end - start).max(0) / 1000) as u64
        }
        None => 0,
    };

    let speed_kmh = if state.status == TripStatus::PendingSave {
        0.0
    } else {
        engine.last_speed_kmh().max(0.0)
    };

    TrackerDisplay {
        status: state.status,
        distance: unit.from_km(state.accumulated_distance_km),
        unit,
        elapsed_seconds,
        elapsed_label: format_duration(elapsed_seconds),
        speed_kmh,
        source_available: engine.source_available(),
        start_address: state.start_location.as_ref().map(|l| l.display_address()),
        end_address: state
            .pending_end_location
            .as_ref()
            .map(|l| l.display_address()),
    }
}

/// Format seconds as `HH:MM:SS`. Hours are not capped at 24.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
