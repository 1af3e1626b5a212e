use rideflow_shared::{Coordinates, RouteKey, RoutingConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::{sleep, timeout};

use crate::backend::{OsrmBackend, ProxyBackend, RouteBackend, RouteResult};
use crate::distance::great_circle_distance_km;

type InflightMap = HashMap<RouteKey, Arc<OnceCell<RouteResult>>>;

/// Multi-endpoint route resolver: proxy first, then public endpoints in
/// priority order, finally a straight-line degraded result. `resolve`
/// never fails; callers always get a usable path.
///
/// Concurrent calls for the same rounded coordinate pair share one
/// underlying attempt chain, and the result lingers briefly to absorb
/// burst calls from reactive re-renders.
pub struct RouteResolver {
    backends: Vec<Arc<dyn RouteBackend>>,
    inflight: Arc<Mutex<InflightMap>>,
    config: RoutingConfig,
}

impl RouteResolver {
    pub fn new(config: RoutingConfig) -> Self {
        let attempt_timeout = Duration::from_millis(config.attempt_timeout_ms);
        let mut backends: Vec<Arc<dyn RouteBackend>> = Vec::new();
        if let Some(base) = &config.proxy_base {
            backends.push(Arc::new(ProxyBackend::new(base, attempt_timeout)));
        }
        for endpoint in &config.osrm_endpoints {
            backends.push(Arc::new(OsrmBackend::new(endpoint, attempt_timeout)));
        }
        Self::with_backends(backends, config)
    }

    /// Build a resolver over an explicit backend chain.
    pub fn with_backends(backends: Vec<Arc<dyn RouteBackend>>, config: RoutingConfig) -> Self {
        Self {
            backends,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub async fn resolve(&self, start: Coordinates, end: Coordinates) -> RouteResult {
        let key = RouteKey::new(start, end);

        // Guard dropped before any await so the future stays Send
        let cell = {
            let mut map = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_init(|| async {
            let result = self.resolve_chain(start, end).await;
            self.schedule_eviction(key);
            result
        })
        .await
        .clone()
    }

    async fn resolve_chain(&self, start: Coordinates, end: Coordinates) -> RouteResult {
        for (index, backend) in self.backends.iter().enumerate() {
            let attempt = timeout(
                Duration::from_millis(self.config.attempt_timeout_ms),
                backend.fetch(start, end),
            )
            .await;

            match attempt {
                Ok(Ok(route)) => {
                    tracing::debug!(backend = backend.name(), "route resolved");
                    return route;
                }
                Ok(Err(err)) => {
                    tracing::warn!(backend = backend.name(), %err, "route attempt failed, trying next");
                }
                Err(_) => {
                    tracing::warn!(backend = backend.name(), "route attempt timed out, trying next");
                }
            }

            if index + 1 < self.backends.len() {
                sleep(Duration::from_millis(self.config.backoff_ms)).await;
            }
        }

        tracing::warn!("all routing backends failed, falling back to straight line");
        straight_line(start, end)
    }

    fn schedule_eviction(&self, key: RouteKey) {
        let inflight = self.inflight.clone();
        let ttl = Duration::from_millis(self.config.dedup_ttl_ms);
        tokio::spawn(async move {
            sleep(ttl).await;
            let mut map = inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            map.remove(&key);
        });
    }
}

/// Degraded result when every backend fails: a two-point path with
/// great-circle distance and unknown duration.
fn straight_line(start: Coordinates, end: Coordinates) -> RouteResult {
    RouteResult {
        coordinates: vec![start, end],
        distance_meters: great_circle_distance_km(start, end) * 1000.0,
        duration_seconds: 0.0,
        steps: Vec::new(),
    }
}
