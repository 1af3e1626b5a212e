pub mod config;
pub mod geo;

pub use config::{Config, RoutingConfig, SessionConfig};
pub use geo::{Coordinates, RouteKey};
