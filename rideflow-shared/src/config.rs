use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub routing: RoutingConfig,
    pub session: SessionConfig,
}

/// Knobs for the route resolution fallback chain. The timing values were
/// chosen empirically in production; they are configuration rather than
/// constants so deployments can tune them.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RoutingConfig {
    /// Backend proxy base URL, tried before any public endpoint.
    pub proxy_base: Option<String>,
    /// Public routing endpoints, tried in order after the proxy.
    pub osrm_endpoints: Vec<String>,
    pub attempt_timeout_ms: u64,
    /// Pause between consecutive public-endpoint attempts.
    pub backoff_ms: u64,
    /// How long a resolved route stays cached to absorb burst calls.
    pub dedup_ttl_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            proxy_base: None,
            osrm_endpoints: vec![
                "https://router.project-osrm.org/route/v1/driving".to_string(),
                "https://routing.openstreetmap.de/routed-car/route/v1/driving".to_string(),
            ],
            attempt_timeout_ms: 6_000,
            backoff_ms: 200,
            dedup_ttl_ms: 1_000,
        }
    }
}

/// Knobs for the ride session lifecycle.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// A booking with no acceptance within this window is cancelled.
    pub auto_cancel_seconds: u64,
    pub accept_poll_interval_ms: u64,
    /// Acceptance polling stops after this ceiling even if unaccepted.
    pub accept_poll_ceiling_ms: u64,
    pub nearby_refresh_ms: u64,
    pub nearby_radius_km: f64,
    pub otp_retry_attempts: u32,
    pub otp_retry_interval_ms: u64,
    pub geocode_debounce_ms: u64,
    pub preview_debounce_ms: u64,
    /// Assumed driver speed for ETA when no route duration is known.
    pub fallback_speed_kmh: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_cancel_seconds: 300,
            accept_poll_interval_ms: 3_000,
            accept_poll_ceiling_ms: 120_000,
            nearby_refresh_ms: 5_000,
            nearby_radius_km: 5.0,
            otp_retry_attempts: 3,
            otp_retry_interval_ms: 500,
            geocode_debounce_ms: 300,
            preview_debounce_ms: 300,
            fallback_speed_kmh: 30.0,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // E.g. `RIDEFLOW_SESSION__AUTO_CANCEL_SECONDS=120`
            .add_source(config::Environment::with_prefix("RIDEFLOW").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
