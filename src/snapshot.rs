//! # Snapshot Store
//!
//! Crash/suspend recovery for the trip in progress. A single durable slot
//! holds an [`ActiveTripSnapshot`] while the engine is not idle; the slot is
//! deleted as soon as the engine returns to idle.
//!
//! The store never touches the engine. `save` serializes a copy of the
//! state, and `try_recover` hands back a candidate state for the engine to
//! adopt through `EngineEvent::Restore`.

use std::collections::HashMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineState, TripStatus};
use crate::error::Result;
use crate::TripLocation;

/// Key of the one slot entry this crate writes.
pub const ACTIVE_TRIP_KEY: &str = "drive_log_active_trip_state";

// ============================================================================
// Durable slot
// ============================================================================

/// Durable key-value storage. Each `set` replaces the previous value atomically.
pub trait KeyValueSlot: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
}

/// In-memory slot, for tests and hosts without durable storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySlot {
    entries: HashMap<String, String>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueSlot for MemorySlot {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

impl<S: KeyValueSlot + ?Sized> KeyValueSlot for Box<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
}

// ============================================================================
// Snapshot payload
// ============================================================================

/// Serialized subset of the engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTripSnapshot {
    pub status: TripStatus,
    pub start_location: TripLocation,
    pub accumulated_distance_km: f64,
    pub start_timestamp: i64,
    pub is_manual_start: bool,
    /// Epoch ms of the write
    pub last_updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_end_location: Option<TripLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
}

impl ActiveTripSnapshot {
    /// Capture `state` at `now`. `None` when there is no trip to capture.
    pub fn capture(state: &EngineState, now: i64) -> Option<Self> {
        if state.is_idle() {
            return None;
        }
        let start_location = state.start_location.clone()?;
        Some(Self {
            status: state.status,
            start_location,
            accumulated_distance_km: state.accumulated_distance_km,
            start_timestamp: state.start_timestamp.unwrap_or(now),
            is_manual_start: state.is_manual_start,
            last_updated: now,
            pending_end_location: state.pending_end_location.clone(),
            end_timestamp: state.end_timestamp,
        })
    }

    /// Candidate engine state. The last tracked point is not preserved, so
    /// tracking resumes from the start location.
    pub fn into_state(self) -> EngineState {
        let (pending_end_location, end_timestamp) = if self.status == TripStatus::PendingSave {
            (
                Some(
                    self.pending_end_location
                        .unwrap_or_else(|| self.start_location.clone()),
                ),
                Some(self.end_timestamp.unwrap_or(self.last_updated)),
            )
        } else {
            (None, None)
        };

        EngineState {
            status: self.status,
            last_tracked_location: Some(self.start_location.clone()),
            start_location: Some(self.start_location),
            accumulated_distance_km: self.accumulated_distance_km,
            start_timestamp: Some(self.start_timestamp),
            is_manual_start: self.is_manual_start,
            pending_end_location,
            stopped_since: None,
            end_timestamp,
        }
    }

    fn is_usable(&self) -> bool {
        self.status != TripStatus::Idle
            && self.start_location.is_valid()
            && self.accumulated_distance_km.is_finite()
            && self.accumulated_distance_km >= 0.0
    }
}

/// Outcome of a recovery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Nothing stored
    Absent,
    /// Stored data could not be used; the slot was cleared
    Corrupt,
    /// Snapshot older than the recovery window; the slot was cleared
    Stale { age_ms: i64 },
    /// A candidate state for the engine to adopt
    Restored(EngineState),
}

impl Recovery {
    pub fn into_state(self) -> Option<EngineState> {
        match self {
            Recovery::Restored(state) => Some(state),
            _ => None,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Reads and writes the active trip snapshot in a [`KeyValueSlot`].
#[derive(Debug)]
pub struct SnapshotStore<S> {
    slot: S,
}

impl<S: KeyValueSlot> SnapshotStore<S> {
    pub fn new(slot: S) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &S {
        &self.slot
    }

    pub fn into_inner(self) -> S {
        self.slot
    }

    /// Persist `state`, or delete the slot when the engine is idle.
    pub fn save(&mut self, state: &EngineState, now: i64) -> Result<()> {
        match ActiveTripSnapshot::capture(state, now) {
            Some(snapshot) => {
                let json = serde_json::to_string(&snapshot)?;
                self.slot.set(ACTIVE_TRIP_KEY, &json)?;
                debug!(
                    "[SnapshotStore] Saved {} snapshot ({:.3} km)",
                    snapshot.status, snapshot.accumulated_distance_km
                );
                Ok(())
            }
            None => self.clear(),
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.slot.delete(ACTIVE_TRIP_KEY)
    }

    /// Read the stored snapshot without any policy applied.
    pub fn load(&self) -> Result<Option<ActiveTripSnapshot>> {
        match self.slot.get(ACTIVE_TRIP_KEY)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Load the snapshot and apply the recovery window.
    ///
    /// Stale and malformed data are removed from the slot and reported as
    /// non-restorable; neither is an error.
    pub fn try_recover(&mut self, window_ms: i64, now: i64) -> Recovery {
        let raw = match self.slot.get(ACTIVE_TRIP_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Recovery::Absent,
            Err(e) => {
                warn!("[SnapshotStore] Could not read snapshot slot: {}", e);
                return Recovery::Absent;
            }
        };

        let snapshot = match serde_json::from_str::<ActiveTripSnapshot>(&raw) {
            Ok(snapshot) if snapshot.is_usable() => snapshot,
            Ok(_) => {
                warn!("[SnapshotStore] Snapshot has no resumable trip, clearing");
                self.clear_quietly();
                return Recovery::Corrupt;
            }
            Err(e) => {
                warn!("[SnapshotStore] Malformed snapshot, clearing: {}", e);
                self.clear_quietly();
                return Recovery::Corrupt;
            }
        };

        let age_ms = now - snapshot.last_updated;
        if age_ms > window_ms {
            info!(
                "[SnapshotStore] Dropping stale snapshot ({} min old)",
                age_ms / 60_000
            );
            self.clear_quietly();
            return Recovery::Stale { age_ms };
        }

        info!(
            "[SnapshotStore] Recovering {} trip ({:.3} km, {}s since last write)",
            snapshot.status,
            snapshot.accumulated_distance_km,
            age_ms.max(0) / 1000
        );
        Recovery::Restored(snapshot.into_state())
    }

    fn clear_quietly(&mut self) {
        if let Err(e) = self.clear() {
            warn!("[SnapshotStore] Failed to clear snapshot slot: {}", e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
