//! # Trip Engine
//!
//! The trip detection state machine. The engine owns its state and is driven
//! by one [`EngineEvent`] at a time; every call returns the [`Effect`]s the
//! host must carry out (arm or cancel the stop timer, resolve an address,
//! persist or clear the snapshot, hand a finished trip to the sink).
//!
//! ## States
//!
//! ```text
//!          speed > start / force_start
//!   IDLE ──────────────────────────────▶ MOVING ◀──────────┐
//!    ▲                                    │   displacement │
//!    │                      jitter + slow │   or speed ≥ stop
//!    │                                    ▼                │
//!    │   discard / too short      STOPPED_WAITING ─────────┘
//!    ├────────────────────────────────────┤
//!    │                                    │ timer fired / force_stop
//!    │  confirm_save / discard            ▼
//!    └─────────────────────────────── PENDING_SAVE
//! ```
//!
//! The engine never reads a clock. Callers pass `now` (epoch ms) with every
//! event, which keeps transitions deterministic under test.

use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::assembler::assemble_trip;
use crate::error::{Result, TripError};
use crate::geo_utils::distance_km;
use crate::{
    GpsSample, ResolvedAddress, TrackerConfig, Trip, TripLocation, TripType,
};

// ============================================================================
// Core Types
// ============================================================================

/// Trip detection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    #[default]
    Idle,
    Moving,
    StoppedWaiting,
    PendingSave,
}

impl TripStatus {
    /// Moving or waiting out a stop.
    pub fn is_tracking(&self) -> bool {
        matches!(self, TripStatus::Moving | TripStatus::StoppedWaiting)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TripStatus::Idle => "IDLE",
            TripStatus::Moving => "MOVING",
            TripStatus::StoppedWaiting => "STOPPED_WAITING",
            TripStatus::PendingSave => "PENDING_SAVE",
        };
        f.write_str(s)
    }
}

/// State of the trip currently being tracked.
///
/// `status == Idle` exactly when `start_location` is `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineState {
    pub status: TripStatus,
    pub start_location: Option<TripLocation>,
    /// Last point that counted as real travel
    pub last_tracked_location: Option<TripLocation>,
    pub accumulated_distance_km: f64,
    /// Epoch ms, set once per trip
    pub start_timestamp: Option<i64>,
    pub is_manual_start: bool,
    pub pending_end_location: Option<TripLocation>,
    /// Epoch ms at which the vehicle was first seen stationary
    pub stopped_since: Option<i64>,
    /// Epoch ms the trip is considered to have ended (set on finalize)
    pub end_timestamp: Option<i64>,
}

impl EngineState {
    pub fn is_idle(&self) -> bool {
        self.status == TripStatus::Idle
    }
}

/// Which trip endpoint an address lookup belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressTarget {
    Start,
    End,
}

/// Inbound events, consumed one at a time.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A position reading from the location source
    Sample(GpsSample),
    /// The stop-debounce timer with this generation elapsed
    TimerFired { generation: u64 },
    /// Operator override: start a trip here regardless of speed
    ForceStart { location: TripLocation },
    /// Operator override: finalize now. `None` uses the last known position.
    ForceStop { location: Option<TripLocation> },
    /// User confirmed saving the pending trip
    ConfirmSave {
        trip_id: String,
        trip_type: TripType,
        notes: String,
    },
    /// User declined saving the pending trip
    Discard,
    /// An address lookup finished
    AddressResolved {
        target: AddressTarget,
        trip_generation: u64,
        address: ResolvedAddress,
    },
    /// Adopt a state recovered from the durable snapshot
    Restore(EngineState),
    /// The position source became available or unavailable
    SourceAvailability { available: bool },
}

/// Work the host must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Arm the stop-debounce timer
    ScheduleStopTimer { generation: u64, delay_ms: u64 },
    /// Abort the armed stop-debounce timer
    CancelStopTimer { generation: u64 },
    /// Resolve an address in the background and report back with `AddressResolved`
    ResolveAddress {
        target: AddressTarget,
        trip_generation: u64,
        latitude: f64,
        longitude: f64,
    },
    /// Write the current state to the snapshot slot
    PersistSnapshot,
    /// Delete the snapshot slot
    ClearSnapshot,
    /// A trip began
    TripStarted { manual: bool },
    /// A trip is waiting for the user's save/discard decision
    TripPendingSave { distance_km: f64 },
    /// A finalized trip was too short and dropped
    TripDiscarded { distance_km: f64 },
    /// A trip was saved; hand it to the sink
    TripCompleted(Trip),
}

// ============================================================================
// Trip Engine
// ============================================================================

/// The trip detection state machine.
#[derive(Debug, Clone)]
pub struct TripEngine {
    state: EngineState,
    config: TrackerConfig,

    /// Generation of the armed stop timer, if any
    stop_timer: Option<u64>,
    next_timer_generation: u64,

    /// Incremented per trip so late address lookups cannot patch a later trip
    trip_generation: u64,

    /// Most recent valid sample position (jitter included)
    last_known_location: Option<TripLocation>,
    last_speed_kmh: f64,
    source_available: bool,
}

impl TripEngine {
    /// Create an idle engine.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            state: EngineState::default(),
            config,
            stop_timer: None,
            next_timer_generation: 0,
            trip_generation: 0,
            last_known_location: None,
            last_speed_kmh: 0.0,
            source_available: true,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn status(&self) -> TripStatus {
        self.state.status
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn trip_generation(&self) -> u64 {
        self.trip_generation
    }

    /// Generation of the armed stop timer.
    pub fn pending_stop_timer(&self) -> Option<u64> {
        self.stop_timer
    }

    pub fn last_speed_kmh(&self) -> f64 {
        self.last_speed_kmh
    }

    pub fn source_available(&self) -> bool {
        self.source_available
    }

    /// Apply one event.
    ///
    /// Operator and user operations that are not valid in the current status
    /// return [`TripError::InvalidTransition`] and leave the state untouched.
    /// Everything else (samples, stale timers, late lookups) never fails.
    pub fn handle(&mut self, event: EngineEvent, now: i64) -> Result<Vec<Effect>> {
        match event {
            EngineEvent::Sample(sample) => Ok(self.on_sample(sample, now)),
            EngineEvent::TimerFired { generation } => Ok(self.on_timer_fired(generation, now)),
            EngineEvent::ForceStart { location } => self.force_start(location, now),
            EngineEvent::ForceStop { location } => self.force_stop(location, now),
            EngineEvent::ConfirmSave {
                trip_id,
                trip_type,
                notes,
            } => self.confirm_save(trip_id, trip_type, notes).map(|trip| {
                // Sink first: the snapshot is only cleared once the trip is handed off
                let mut effects = vec![Effect::TripCompleted(trip)];
                effects.extend(self.reset());
                effects
            }),
            EngineEvent::Discard => self.discard(),
            EngineEvent::AddressResolved {
                target,
                trip_generation,
                address,
            } => Ok(self.on_address_resolved(target, trip_generation, &address)),
            EngineEvent::Restore(candidate) => Ok(self.restore(candidate, now)),
            EngineEvent::SourceAvailability { available } => {
                if self.source_available != available {
                    info!("[TripEngine] Position source available={}", available);
                }
                self.source_available = available;
                Ok(Vec::new())
            }
        }
    }

    // ========================================================================
    // Samples
    // ========================================================================

    fn on_sample(&mut self, sample: GpsSample, now: i64) -> Vec<Effect> {
        if !sample.is_valid() {
            warn!(
                "[TripEngine] Ignoring invalid sample ({}, {}, {} km/h)",
                sample.latitude, sample.longitude, sample.speed_kmh
            );
            return Vec::new();
        }

        let location = sample.location();
        self.last_speed_kmh = sample.speed_kmh;
        self.last_known_location = Some(location.clone());

        match self.state.status {
            TripStatus::Idle => {
                if sample.speed_kmh > self.config.start_speed_threshold_kmh {
                    info!(
                        "[TripEngine] Speed {:.1} km/h above start threshold, starting trip",
                        sample.speed_kmh
                    );
                    self.start_trip(location, false, now)
                } else {
                    self.state.last_tracked_location = Some(location);
                    Vec::new()
                }
            }
            TripStatus::Moving | TripStatus::StoppedWaiting => {
                self.track(location, sample.speed_kmh, now)
            }
            TripStatus::PendingSave => {
                debug!("[TripEngine] Sample ignored while awaiting save decision");
                Vec::new()
            }
        }
    }

    /// Accumulate or debounce a sample while a trip is active.
    fn track(&mut self, location: TripLocation, speed_kmh: f64, now: i64) -> Vec<Effect> {
        let mut effects = Vec::new();

        let Some(last) = self.state.last_tracked_location.as_ref() else {
            // Only reachable from an inconsistent restore; re-anchor here
            self.state.last_tracked_location = Some(location);
            effects.push(Effect::PersistSnapshot);
            return effects;
        };

        let d = distance_km(last, &location);

        if d > self.config.displacement_noise_floor_km {
            self.state.accumulated_distance_km += d;
            self.state.last_tracked_location = Some(location);
            self.cancel_stop_timer(&mut effects);
            if self.state.status != TripStatus::Moving {
                info!("[TripEngine] Moving again after stop");
            }
            self.state.status = TripStatus::Moving;
            self.state.stopped_since = None;
            debug!(
                "[TripEngine] +{:.4} km (total {:.3} km)",
                d, self.state.accumulated_distance_km
            );
            effects.push(Effect::PersistSnapshot);
        } else if speed_kmh < self.config.stop_speed_threshold_kmh {
            if self.stop_timer.is_none() {
                let generation = self.arm_stop_timer(&mut effects);
                self.state.status = TripStatus::StoppedWaiting;
                self.state.stopped_since = Some(now);
                info!(
                    "[TripEngine] Stationary, auto-stop in {}s (timer #{})",
                    self.config.stop_debounce_seconds, generation
                );
                effects.push(Effect::PersistSnapshot);
            }
        } else {
            // Crawling: jitter-sized displacement but real speed
            let was_waiting = self.state.status != TripStatus::Moving;
            self.cancel_stop_timer(&mut effects);
            self.state.status = TripStatus::Moving;
            self.state.stopped_since = None;
            if was_waiting {
                effects.push(Effect::PersistSnapshot);
            }
        }

        effects
    }

    // ========================================================================
    // Stop timer
    // ========================================================================

    fn arm_stop_timer(&mut self, effects: &mut Vec<Effect>) -> u64 {
        // Never two timers at once
        self.cancel_stop_timer(effects);
        self.next_timer_generation += 1;
        let generation = self.next_timer_generation;
        self.stop_timer = Some(generation);
        effects.push(Effect::ScheduleStopTimer {
            generation,
            delay_ms: self.config.stop_debounce_ms(),
        });
        generation
    }

    fn cancel_stop_timer(&mut self, effects: &mut Vec<Effect>) {
        if let Some(generation) = self.stop_timer.take() {
            debug!("[TripEngine] Cancelling stop timer #{}", generation);
            effects.push(Effect::CancelStopTimer { generation });
        }
    }

    fn on_timer_fired(&mut self, generation: u64, now: i64) -> Vec<Effect> {
        if self.stop_timer != Some(generation) {
            debug!(
                "[TripEngine] Ignoring stale stop timer #{} (armed: {:?})",
                generation, self.stop_timer
            );
            return Vec::new();
        }
        self.stop_timer = None;

        if self.state.status != TripStatus::StoppedWaiting {
            return Vec::new();
        }

        let location = self.last_position();
        let end = self.state.stopped_since.unwrap_or(now);
        info!("[TripEngine] Auto-stop after {}s stationary", self.config.stop_debounce_seconds);
        self.finalize(location, end)
    }

    // ========================================================================
    // Trip boundaries
    // ========================================================================

    fn start_trip(&mut self, location: TripLocation, manual: bool, now: i64) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.cancel_stop_timer(&mut effects);

        self.trip_generation += 1;
        self.state = EngineState {
            status: TripStatus::Moving,
            start_location: Some(location.clone()),
            last_tracked_location: Some(location.clone()),
            accumulated_distance_km: 0.0,
            start_timestamp: Some(now),
            is_manual_start: manual,
            pending_end_location: None,
            stopped_since: None,
            end_timestamp: None,
        };

        effects.push(Effect::ResolveAddress {
            target: AddressTarget::Start,
            trip_generation: self.trip_generation,
            latitude: location.latitude,
            longitude: location.longitude,
        });
        effects.push(Effect::PersistSnapshot);
        effects.push(Effect::TripStarted { manual });
        effects
    }

    /// Start a trip immediately, bypassing the speed check.
    fn force_start(&mut self, location: TripLocation, now: i64) -> Result<Vec<Effect>> {
        if self.state.status != TripStatus::Idle {
            return Err(self.invalid("force start"));
        }
        if !location.is_valid() {
            warn!("[TripEngine] Force start with invalid location ignored");
            return Err(TripError::InvalidLocation {
                latitude: location.latitude,
                longitude: location.longitude,
            });
        }
        info!("[TripEngine] Manual trip start");
        self.last_known_location = Some(location.clone());
        Ok(self.start_trip(location, true, now))
    }

    /// Finalize immediately with the same discard rule as an auto-stop.
    fn force_stop(&mut self, location: Option<TripLocation>, now: i64) -> Result<Vec<Effect>> {
        if !self.state.status.is_tracking() {
            return Err(self.invalid("force stop"));
        }
        let location = location
            .filter(TripLocation::is_valid)
            .unwrap_or_else(|| self.last_position());
        info!("[TripEngine] Manual trip stop");
        Ok(self.finalize(location, now))
    }

    /// Decide between discarding the trip and asking the user to save it.
    fn finalize(&mut self, location: TripLocation, end_timestamp: i64) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.cancel_stop_timer(&mut effects);

        let distance_km = self.state.accumulated_distance_km;
        if distance_km < self.config.min_trip_distance_km && !self.state.is_manual_start {
            info!(
                "[TripEngine] Discarding {:.3} km trip (minimum {:.3} km)",
                distance_km, self.config.min_trip_distance_km
            );
            effects.extend(self.reset());
            effects.push(Effect::TripDiscarded { distance_km });
            return effects;
        }

        let start = self.state.start_timestamp.unwrap_or(end_timestamp);
        self.state.pending_end_location = Some(location.clone());
        self.state.end_timestamp = Some(end_timestamp.max(start));
        self.state.stopped_since = None;
        self.state.status = TripStatus::PendingSave;
        info!(
            "[TripEngine] Trip finished: {:.3} km, awaiting save decision",
            distance_km
        );

        effects.push(Effect::ResolveAddress {
            target: AddressTarget::End,
            trip_generation: self.trip_generation,
            latitude: location.latitude,
            longitude: location.longitude,
        });
        effects.push(Effect::PersistSnapshot);
        effects.push(Effect::TripPendingSave { distance_km });
        effects
    }

    /// Build the trip record from the pending state. Does not reset.
    fn confirm_save(&mut self, trip_id: String, trip_type: TripType, notes: String) -> Result<Trip> {
        if self.state.status != TripStatus::PendingSave {
            return Err(self.invalid("confirm save"));
        }
        let trip = assemble_trip(
            &self.state,
            trip_id,
            trip_type,
            notes,
            self.config.preferred_unit,
        )?;
        info!(
            "[TripEngine] Saved trip {} ({:.3} km, {}s)",
            trip.id, trip.distance_km, trip.duration_seconds
        );
        Ok(trip)
    }

    fn discard(&mut self) -> Result<Vec<Effect>> {
        if self.state.status != TripStatus::PendingSave {
            return Err(self.invalid("discard"));
        }
        info!("[TripEngine] Pending trip discarded by user");
        Ok(self.reset())
    }

    /// Back to IDLE. The snapshot slot goes with it.
    fn reset(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.cancel_stop_timer(&mut effects);
        let last_tracked = self.last_known_location.clone();
        self.state = EngineState {
            last_tracked_location: last_tracked,
            ..EngineState::default()
        };
        effects.push(Effect::ClearSnapshot);
        effects
    }

    // ========================================================================
    // Addresses and recovery
    // ========================================================================

    fn on_address_resolved(
        &mut self,
        target: AddressTarget,
        trip_generation: u64,
        address: &ResolvedAddress,
    ) -> Vec<Effect> {
        if trip_generation != self.trip_generation || self.state.is_idle() {
            debug!(
                "[TripEngine] Dropping address for trip #{} (current #{})",
                trip_generation, self.trip_generation
            );
            return Vec::new();
        }

        let slot = match target {
            AddressTarget::Start => self.state.start_location.as_mut(),
            AddressTarget::End => self.state.pending_end_location.as_mut(),
        };
        match slot {
            Some(location) => {
                location.apply_address(address);
                vec![Effect::PersistSnapshot]
            }
            None => Vec::new(),
        }
    }

    /// Adopt a recovered state. Only possible before any trip has started.
    fn restore(&mut self, candidate: EngineState, now: i64) -> Vec<Effect> {
        if !self.state.is_idle() {
            warn!(
                "[TripEngine] Recovered trip arrived while {}, discarding it",
                self.state.status
            );
            return Vec::new();
        }
        if candidate.is_idle() || candidate.start_location.is_none() {
            return vec![Effect::ClearSnapshot];
        }

        let mut effects = Vec::new();
        self.cancel_stop_timer(&mut effects);
        self.trip_generation += 1;
        self.state = candidate;
        info!(
            "[TripEngine] Recovered {} trip ({:.3} km)",
            self.state.status, self.state.accumulated_distance_km
        );

        if let Some(start) = &self.state.start_location {
            if start.address.is_none() {
                effects.push(Effect::ResolveAddress {
                    target: AddressTarget::Start,
                    trip_generation: self.trip_generation,
                    latitude: start.latitude,
                    longitude: start.longitude,
                });
            }
        }

        match self.state.status {
            TripStatus::StoppedWaiting => {
                // The debounce restarts from the moment of recovery
                self.arm_stop_timer(&mut effects);
                self.state.stopped_since = Some(now);
            }
            TripStatus::PendingSave => {
                if let Some(end) = &self.state.pending_end_location {
                    if end.address.is_none() {
                        effects.push(Effect::ResolveAddress {
                            target: AddressTarget::End,
                            trip_generation: self.trip_generation,
                            latitude: end.latitude,
                            longitude: end.longitude,
                        });
                    }
                }
                effects.push(Effect::TripPendingSave {
                    distance_km: self.state.accumulated_distance_km,
                });
            }
            _ => {}
        }

        effects.push(Effect::PersistSnapshot);
        effects
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn last_position(&self) -> TripLocation {
        self.last_known_location
            .clone()
            .or_else(|| self.state.last_tracked_location.clone())
            .or_else(|| self.state.start_location.clone())
            .unwrap_or_else(|| TripLocation::new(0.0, 0.0))
    }

    fn invalid(&self, operation: &'static str) -> TripError {
        warn!("[TripEngine] Rejected {} while {}", operation, self.state.status);
        TripError::InvalidTransition {
            operation,
            status: self.state.status,
        }
    }
}

impl Default for TripEngine {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
