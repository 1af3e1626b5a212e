use rideflow_shared::Coordinates;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle (haversine) distance between two points, in kilometers.
pub fn great_circle_distance_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Scalar-argument convenience wrapper.
pub fn great_circle_distance_km_scalar(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    great_circle_distance_km(Coordinates::new(lat1, lng1), Coordinates::new(lat2, lng2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance_for_identical_points() {
        let origin = Coordinates::new(0.0, 0.0);
        assert_eq!(great_circle_distance_km(origin, origin), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = Coordinates::new(28.6139, 77.2090);
        let b = Coordinates::new(28.7041, 77.1025);
        let forward = great_circle_distance_km(a, b);
        let back = great_circle_distance_km(b, a);
        assert!((forward - back).abs() < 1e-12);
    }

    #[test]
    fn test_known_city_pair_distance() {
        // Connaught Place to Delhi University, roughly 14.5 km
        let d = great_circle_distance_km_scalar(28.6139, 77.2090, 28.7041, 77.1025);
        assert!(d > 13.5 && d < 15.5, "got {}", d);
    }
}
