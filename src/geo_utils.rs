//! Geographic utilities: great-circle distance and coordinate formatting.
//!
//! Distances here are in kilometers, since trip accumulation and every
//! policy threshold are expressed in kilometers.

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Kilometers per statute mile.
pub const KM_PER_MILE: f64 = 1.609_344;

/// Haversine distance between two coordinates in kilometers.
///
/// Non-negative and symmetric. NaN inputs propagate NaN, so callers must
/// reject invalid coordinates before accumulating.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    // Clamp guards asin against rounding just above 1.0 for antipodal points
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * c
}

/// Great-circle distance between two located values in kilometers.
pub fn distance_km<A: Located, B: Located>(a: &A, b: &B) -> f64 {
    let (lat1, lon1) = a.coordinates();
    let (lat2, lon2) = b.coordinates();
    haversine_km(lat1, lon1, lat2, lon2)
}

/// Anything with a latitude/longitude pair.
pub trait Located {
    fn coordinates(&self) -> (f64, f64);
}

/// Convert kilometers to statute miles.
pub fn km_to_miles(km: f64) -> f64 {
    km / KM_PER_MILE
}

/// Coordinate string used wherever an address is unavailable.
pub fn format_coordinates(latitude: f64, longitude: f64) -> String {
    format!("{:.5}, {:.5}", latitude, longitude)
}

/// Check that a coordinate pair is finite and within WGS84 ranges.
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}
