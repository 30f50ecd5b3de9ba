//! Reverse geocoding collaborator.
//!
//! Lookups are fire-and-forget from the engine's point of view: the service
//! runs them in the background and reports the result back as an event.
//! A failed lookup never blocks a save; the coordinate string stands in.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geo_utils::format_coordinates;

/// A resolved human-readable address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAddress {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maps_url: Option<String>,
}

impl ResolvedAddress {
    /// Coordinate string used when no address is available.
    pub fn fallback(latitude: f64, longitude: f64) -> Self {
        Self {
            address: format_coordinates(latitude, longitude),
            maps_url: None,
        }
    }
}

/// Resolves coordinates to an address.
pub trait Geocoder: Send + Sync {
    fn reverse(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, Result<ResolvedAddress>>;
}

/// Geocoder that always answers with the coordinate string.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinateGeocoder;

impl Geocoder for CoordinateGeocoder {
    fn reverse(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, Result<ResolvedAddress>> {
        Box::pin(async move { Ok(ResolvedAddress::fallback(latitude, longitude)) })
    }
}

/// Resolve an address, degrading to the coordinate string on failure.
pub async fn resolve_or_fallback<G: Geocoder + ?Sized>(
    geocoder: &G,
    latitude: f64,
    longitude: f64,
) -> ResolvedAddress {
    match geocoder.reverse(latitude, longitude).await {
        Ok(resolved) if !resolved.address.trim().is_empty() => resolved,
        Ok(_) => ResolvedAddress::fallback(latitude, longitude),
        Err(e) => {
            log::warn!(
                "[Geocoder] Lookup failed for ({:.5}, {:.5}): {}",
                latitude,
                longitude,
                e
            );
            ResolvedAddress::fallback(latitude, longitude)
        }
    }
}
