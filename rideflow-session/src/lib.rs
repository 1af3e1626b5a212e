pub mod backend;
pub mod coordinator;
pub mod events;
pub mod fares;
pub mod geocode;
pub mod models;

pub use backend::{BackendError, BookingRequest, HttpRideBackend, RideBackend};
pub use coordinator::{NoticeKind, RideCoordinator, SessionError, SessionNotice};
pub use events::{RidePayload, RideUpdate};
pub use geocode::{GeocodeResult, Geocoder, NominatimGeocoder};
pub use models::{
    CompletedSummary, Driver, NearbyDriver, Place, QuoteOption, RidePhase, RideSession,
    TimelineEvent, VehicleClass,
};
