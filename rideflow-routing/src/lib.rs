pub mod animate;
pub mod backend;
pub mod distance;
pub mod format;
pub mod resolver;

pub use animate::interpolate_position;
pub use backend::{OsrmBackend, ProxyBackend, RouteBackend, RouteError, RouteResult, RouteStep};
pub use distance::{great_circle_distance_km, great_circle_distance_km_scalar};
pub use format::{format_distance, format_duration};
pub use resolver::RouteResolver;
