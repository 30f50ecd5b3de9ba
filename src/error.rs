//! Unified error handling for the drivelog library.
//!
//! Nothing in this crate is fatal to the host process. Every failure here is
//! either surfaced to the caller of an explicit operation (an operation that
//! is not valid in the current state) or degraded to a safe default and
//! logged (corrupt snapshot, geocoder failure).

use crate::engine::TripStatus;

/// Unified error type for drivelog operations.
#[derive(Debug, thiserror::Error)]
pub enum TripError {
    /// Operation is not valid in the engine's current status
    #[error("Cannot {operation} while {status}")]
    InvalidTransition {
        operation: &'static str,
        status: TripStatus,
    },
    /// Coordinates outside WGS84 ranges or not finite
    #[error("Invalid coordinates: ({latitude}, {longitude})")]
    InvalidLocation { latitude: f64, longitude: f64 },
    /// Engine state is missing a field the operation depends on
    #[error("Engine state is missing {field}")]
    MissingState { field: &'static str },
    /// Durable slot read/write failed
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// Snapshot or config (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Reverse geocoding failed
    #[error("Geocoding error: {message}")]
    Geocoding { message: String },
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
    /// The trip service is no longer running
    #[error("Trip service channel closed")]
    ChannelClosed,
}

impl TripError {
    #[cfg_attr(not(feature = "persistence"), allow(dead_code))]
    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        TripError::Persistence {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        TripError::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for drivelog operations.
pub type Result<T> = std::result::Result<T, TripError>;

/// Extension trait for converting Option to TripError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a missing engine state error.
    fn ok_or_missing(self, field: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_missing(self, field: &'static str) -> Result<T> {
        self.ok_or(TripError::MissingState { field })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TripError::InvalidTransition {
            operation: "discard",
            status: TripStatus::Moving,
        };
        assert_eq!(err.to_string(), "Cannot discard while MOVING");

        let err = TripError::persistence("disk full");
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i64> = None;
        let result = none.ok_or_missing("start_timestamp");
        assert!(matches!(
            result,
            Err(TripError::MissingState {
                field: "start_timestamp"
            })
        ));
        assert_eq!(Some(3).ok_or_missing("x").unwrap(), 3);
    }

    #[test]
    fn test_serde_error_converts() {
        let err: TripError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, TripError::Serialization(_)));
    }
}
