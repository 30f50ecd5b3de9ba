//! Trip record assembly.
//!
//! Turns the pending engine state plus the user's save decision into an
//! immutable [`Trip`]. Every field is filled: endpoints whose address never
//! resolved get the coordinate string instead.

use crate::engine::{EngineState, TripStatus};
use crate::error::{OptionExt, Result, TripError};
use crate::{DistanceUnit, Trip, TripType};

/// Build a [`Trip`] from a state in `PendingSave`.
///
/// Duration is the difference of the wall-clock start and end instants,
/// so it stays correct across suspension.
pub fn assemble_trip(
    state: &EngineState,
    trip_id: String,
    trip_type: TripType,
    notes: String,
    unit: DistanceUnit,
) -> Result<Trip> {
    if state.status != TripStatus::PendingSave {
        return Err(TripError::InvalidTransition {
            operation: "assemble trip",
            status: state.status,
        });
    }

    let start_location = state.start_location.as_ref().ok_or_missing("start location")?;
    let end_location = state
        .pending_end_location
        .as_ref()
        .ok_or_missing("pending end location")?;
    let start_time = state.start_timestamp.ok_or_missing("start timestamp")?;
    let end_time = state.end_timestamp.ok_or_missing("end timestamp")?.max(start_time);

    let duration_seconds = ((end_time - start_time) / 1000) as u64;

    Ok(Trip {
        id: trip_id,
        start_time,
        end_time,
        start_location: start_location.with_fallback_address(),
        end_location: end_location.with_fallback_address(),
        distance_km: state.accumulated_distance_km,
        unit,
        trip_type,
        notes: notes.trim().to_string(),
        duration_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TripLocation;

    const T: i64 = 1_700_000_000_000;

    fn pending_state() -> EngineState {
        let mut start = TripLocation::new(25.0330, 121.5654);
        start.address = Some("Taipei 101".to_string());
        EngineState {
            status: TripStatus::PendingSave,
            start_location: Some(start),
            last_tracked_location: None,
            accumulated_distance_km: 3.2,
            start_timestamp: Some(T),
            is_manual_start: false,
            pending_end_location: Some(TripLocation::new(25.0478, 121.5319)),
            stopped_since: None,
            end_timestamp: Some(T + 301_000),
        }
    }

    #[test]
    fn test_duration_from_wall_clock() {
        let trip = assemble_trip(
            &pending_state(),
            "id-1".to_string(),
            TripType::Business,
            String::new(),
            DistanceUnit::Km,
        )
        .unwrap();
        assert_eq!(trip.duration_seconds, 301);
        assert_eq!(trip.start_time, T);
        assert_eq!(trip.end_time, T + 301_000);
        assert_eq!(trip.distance_km, 3.2);
    }

    #[test]
    fn test_unresolved_address_uses_coordinates() {
        let trip = assemble_trip(
            &pending_state(),
            "id-2".to_string(),
            TripType::Private,
            "  client visit ".to_string(),
            DistanceUnit::Miles,
        )
        .unwrap();
        assert_eq!(trip.start_location.address.as_deref(), Some("Taipei 101"));
        assert_eq!(
            trip.end_location.address.as_deref(),
            Some("25.04780, 121.53190")
        );
        assert_eq!(trip.notes, "client visit");
        assert_eq!(trip.unit, DistanceUnit::Miles);
    }

    #[test]
    fn test_requires_pending_save() {
        let state = EngineState {
            status: TripStatus::Moving,
            ..pending_state()
        };
        let result = assemble_trip(
            &state,
            "id".to_string(),
            TripType::Business,
            String::new(),
            DistanceUnit::Km,
        );
        assert!(matches!(result, Err(TripError::InvalidTransition { .. })));
    }

    #[test]
    fn test_missing_end_location() {
        let state = EngineState {
            pending_end_location: None,
            ..pending_state()
        };
        let result = assemble_trip(
            &state,
            "id".to_string(),
            TripType::Business,
            String::new(),
            DistanceUnit::Km,
        );
        assert!(matches!(result, Err(TripError::MissingState { .. })));
    }
}
