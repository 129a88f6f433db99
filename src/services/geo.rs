//! Geographic calculations

use crate::types::Coordinates;

/// Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Road distance coefficient (straight line to road)
pub const DEFAULT_DETOUR_FACTOR: f64 = 1.3;

/// Average speed in km/h for travel time estimation
pub const DEFAULT_SPEED_KMH: f64 = 40.0;

/// Calculate Haversine distance between two points in kilometers
pub fn haversine_distance(from: &Coordinates, to: &Coordinates) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lng - from.lng).to_radians();

    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Estimate road distance in km from straight-line distance
pub fn road_distance(from: &Coordinates, to: &Coordinates, detour_factor: f64) -> f64 {
    haversine_distance(from, to) * detour_factor
}

/// Estimate travel time in minutes at the given speed
pub fn travel_minutes(from: &Coordinates, to: &Coordinates, detour_factor: f64, speed_kmh: f64) -> f64 {
    let distance = road_distance(from, to, detour_factor);
    (distance / speed_kmh) * 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn madrid() -> Coordinates {
        Coordinates { lat: 40.4168, lng: -3.7038 }
    }

    fn toledo() -> Coordinates {
        Coordinates { lat: 39.8628, lng: -4.0273 }
    }

    #[test]
    fn test_haversine_madrid_toledo() {
        let distance = haversine_distance(&madrid(), &toledo());

        // Madrid to Toledo is approximately 67 km
        assert!((distance - 67.0).abs() < 5.0, "got {} km", distance);
    }

    #[test]
    fn test_haversine_same_point() {
        let point = madrid();
        let distance = haversine_distance(&point, &point);
        assert!(distance.abs() < 0.001);
    }

    #[test]
    fn test_road_distance_applies_detour_factor() {
        let distance = road_distance(&madrid(), &toledo(), DEFAULT_DETOUR_FACTOR);
        let straight = haversine_distance(&madrid(), &toledo());

        assert!((distance / straight - DEFAULT_DETOUR_FACTOR).abs() < 0.01);
    }

    #[test]
    fn test_travel_minutes_reasonable() {
        let minutes = travel_minutes(&madrid(), &toledo(), DEFAULT_DETOUR_FACTOR, DEFAULT_SPEED_KMH);

        // ~87 road km at 40 km/h is a bit over two hours
        assert!(minutes > 100.0 && minutes < 180.0, "got {} min", minutes);
    }

    #[test]
    fn test_travel_minutes_scales_with_speed() {
        let slow = travel_minutes(&madrid(), &toledo(), 1.3, 30.0);
        let fast = travel_minutes(&madrid(), &toledo(), 1.3, 60.0);
        assert!((slow / fast - 2.0).abs() < 0.01);
    }
}
