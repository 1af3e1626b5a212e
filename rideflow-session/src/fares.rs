use crate::models::{QuoteOption, VehicleClass};

const FARE_PER_KM: f64 = 10.0;

/// Base fares aligned with the server's fare structure.
pub fn base_fare(class: VehicleClass) -> f64 {
    match class {
        VehicleClass::Share => 30.0,
        VehicleClass::Bike => 40.0,
        VehicleClass::Auto => 50.0,
        VehicleClass::Car => 80.0,
    }
}

/// Client-side fallback estimate per vehicle class; the authoritative
/// fare arrives only once a ride exists.
pub fn estimate_quotes(
    distance_km: f64,
    route_duration_seconds: Option<f64>,
    fallback_speed_kmh: f64,
) -> Vec<QuoteOption> {
    let eta = eta_minutes(distance_km, route_duration_seconds, fallback_speed_kmh);
    VehicleClass::all()
        .into_iter()
        .map(|class| QuoteOption {
            vehicle_class: class,
            price: (base_fare(class) + distance_km * FARE_PER_KM).round(),
            eta_minutes: eta,
        })
        .collect()
}

/// ETA from the route duration when known, otherwise from an assumed
/// average speed. Never less than one minute.
pub fn eta_minutes(
    distance_km: f64,
    route_duration_seconds: Option<f64>,
    fallback_speed_kmh: f64,
) -> u32 {
    let minutes = match route_duration_seconds {
        Some(seconds) if seconds > 0.0 => seconds / 60.0,
        _ => distance_km / fallback_speed_kmh * 60.0,
    };
    (minutes.round() as u32).max(1)
}
