//! Geographic distance math for the detection rules

/// Threshold for considering coordinates as effectively zero.
///
/// A coordinate pair is treated as "unknown" (sentinel 0,0) if both
/// latitude and longitude are within this epsilon of zero. 1e-7
/// degrees is about 1.1 cm at the equator, well below GPS accuracy,
/// so the comparison is reliable without exact float equality.
pub const COORDINATE_EPSILON: f64 = 1e-7;

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Returns true if the coordinates represent an unknown location.
pub fn is_unknown_location(lat: f64, lon: f64) -> bool {
    lat.abs() < COORDINATE_EPSILON && lon.abs() < COORDINATE_EPSILON
}

/// Great-circle distance between two points in kilometers (haversine).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}
