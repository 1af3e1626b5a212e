/// Format a duration in seconds to the closest human unit.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{} sec", seconds.round() as i64);
    }
    let minutes = (seconds / 60.0).floor() as i64;
    if minutes < 60 {
        return format!("{} min", minutes);
    }
    let hours = minutes / 60;
    let remaining = minutes % 60;
    format!("{}h {}m", hours, remaining)
}

/// Format a distance in meters to the closest human unit.
pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        return format!("{} m", meters.round() as i64);
    }
    format!("{:.1} km", meters / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_unit_boundaries() {
        assert_eq!(format_duration(42.4), "42 sec");
        assert_eq!(format_duration(59.9), "60 sec");
        assert_eq!(format_duration(60.0), "1 min");
        assert_eq!(format_duration(7.0 * 60.0), "7 min");
        assert_eq!(format_duration(65.0 * 60.0), "1h 5m");
        assert_eq!(format_duration(2.0 * 3600.0), "2h 0m");
    }

    #[test]
    fn test_distance_unit_boundaries() {
        assert_eq!(format_distance(850.0), "850 m");
        assert_eq!(format_distance(999.4), "999 m");
        assert_eq!(format_distance(1000.0), "1.0 km");
        assert_eq!(format_distance(3250.0), "3.2 km");
    }
}
