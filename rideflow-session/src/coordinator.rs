use chrono::Utc;
use rideflow_routing::{great_circle_distance_km, RouteResolver};
use rideflow_shared::{Coordinates, SessionConfig};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use crate::backend::{BackendError, BookingRequest, RideBackend};
use crate::events::{RidePayload, RideUpdate};
use crate::fares;
use crate::geocode::Geocoder;
use crate::models::{CompletedSummary, QuoteOption, RidePhase, RideSession, VehicleClass};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{action} is not valid while the session is in {phase:?}")]
    InvalidPhase {
        action: &'static str,
        phase: RidePhase,
    },

    #[error("pickup and destination coordinates are not resolved yet")]
    MissingCoordinates,

    #[error("no quote available for {0:?}")]
    UnknownQuote(VehicleClass),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Success,
    Warning,
    Error,
}

/// User-visible outcome of an asynchronous lifecycle step, broadcast to
/// whatever presentation layer is listening.
#[derive(Debug, Clone)]
pub struct SessionNotice {
    pub id: Uuid,
    pub kind: NoticeKind,
    pub message: String,
}

#[derive(Clone, Copy)]
enum RouteSlot {
    DriverToPickup,
    PickupToDestination,
}

struct SessionState {
    session: RideSession,
    current_location: Option<Coordinates>,
    /// Bumped on every teardown; timers and loops carry the epoch they
    /// were armed under and no-op if it has moved on.
    epoch: u64,
    pickup_generation: u64,
    destination_generation: u64,
    preview_generation: u64,
    /// Booking id with an OTP hydration loop currently in flight.
    hydrating_for: Option<String>,
    /// Timers and loops tied to the current session context.
    tasks: Vec<JoinHandle<()>>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the lifecycle of the current ride: phase transitions, timers,
/// retry loops, and the merge of server truth into local state.
///
/// Push events and poll results are both funneled through
/// [`RideCoordinator::apply_update`], so the merge logic lives in exactly
/// one place regardless of event origin. Driver-location delivery itself
/// is the push channel's job; this type only consumes its events.
#[derive(Clone)]
pub struct RideCoordinator {
    state: Arc<Mutex<SessionState>>,
    backend: Arc<dyn RideBackend>,
    geocoder: Arc<dyn Geocoder>,
    resolver: Arc<RouteResolver>,
    config: Arc<SessionConfig>,
    notices: broadcast::Sender<SessionNotice>,
    nearby_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RideCoordinator {
    pub fn new(
        backend: Arc<dyn RideBackend>,
        geocoder: Arc<dyn Geocoder>,
        resolver: Arc<RouteResolver>,
        config: SessionConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(100);
        Self {
            state: Arc::new(Mutex::new(SessionState {
                session: RideSession::new(),
                current_location: None,
                epoch: 0,
                pickup_generation: 0,
                destination_generation: 0,
                preview_generation: 0,
                hydrating_for: None,
                tasks: Vec::new(),
            })),
            backend,
            geocoder,
            resolver,
            config: Arc::new(config),
            notices,
            nearby_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Read-only projection of the current session for the presentation
    /// layer.
    pub fn snapshot(&self) -> RideSession {
        self.lock().session.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn update_current_location(&self, at: Coordinates) {
        self.lock().current_location = Some(at);
    }

    /// Set the pickup label and kick off a debounced geocode. Only the
    /// response to the most recent request may update the coordinates.
    pub fn set_pickup(&self, label: &str) {
        let generation = {
            let mut state = self.lock();
            state.session.pickup.label = label.to_string();
            state.pickup_generation += 1;
            state.pickup_generation
        };
        if label.trim().len() > 3 {
            self.debounced_geocode(label.to_string(), generation, true);
        }
    }

    pub fn set_destination(&self, label: &str) {
        let generation = {
            let mut state = self.lock();
            state.session.destination.label = label.to_string();
            state.destination_generation += 1;
            state.destination_generation
        };
        if label.trim().len() > 3 {
            self.debounced_geocode(label.to_string(), generation, false);
        }
    }

    /// Set pickup coordinates directly (e.g. from a map tap or device
    /// GPS); the label is filled in by reverse geocoding, best effort.
    pub fn set_pickup_point(&self, at: Coordinates) {
        {
            let mut state = self.lock();
            state.pickup_generation += 1;
            state.session.pickup.coordinates = Some(at);
        }
        self.refresh_preview();
        self.reverse_label(at, true);
    }

    pub fn set_destination_point(&self, at: Coordinates) {
        {
            let mut state = self.lock();
            state.destination_generation += 1;
            state.session.destination.coordinates = Some(at);
        }
        self.refresh_preview();
        self.reverse_label(at, false);
    }

    /// Compute client-side fare estimates and move to `Selecting`. The
    /// prices are a fallback; the authoritative fare arrives with the
    /// ride itself.
    pub fn request_quote(&self) -> Result<Vec<QuoteOption>, SessionError> {
        let quotes = {
            let mut state = self.lock();
            if !matches!(
                state.session.phase,
                RidePhase::Search | RidePhase::Selecting
            ) {
                return Err(SessionError::InvalidPhase {
                    action: "request_quote",
                    phase: state.session.phase,
                });
            }
            let (Some(start), Some(end)) = (
                state.session.pickup.coordinates,
                state.session.destination.coordinates,
            ) else {
                return Err(SessionError::MissingCoordinates);
            };

            let distance_km = great_circle_distance_km(start, end);
            let duration = state
                .session
                .preview_route
                .as_ref()
                .map(|route| route.duration_seconds);
            let quotes =
                fares::estimate_quotes(distance_km, duration, self.config.fallback_speed_kmh);
            state.session.quotes = quotes.clone();
            state.session.phase = RidePhase::Selecting;
            quotes
        };
        self.refresh_preview();
        Ok(quotes)
    }

    /// Book the selected vehicle class. On success the session enters
    /// `Booking` with the auto-cancel timer armed and acceptance polling
    /// running; on failure it reverts to `Selecting` so the user can
    /// retry.
    pub async fn book_ride(&self, class: VehicleClass) -> Result<(), SessionError> {
        let request = {
            let mut state = self.lock();
            if state.session.phase != RidePhase::Selecting {
                return Err(SessionError::InvalidPhase {
                    action: "book_ride",
                    phase: state.session.phase,
                });
            }
            let (Some(start), Some(end)) = (
                state.session.pickup.coordinates,
                state.session.destination.coordinates,
            ) else {
                return Err(SessionError::MissingCoordinates);
            };
            let quote = state
                .session
                .quotes
                .iter()
                .find(|quote| quote.vehicle_class == class)
                .cloned()
                .ok_or(SessionError::UnknownQuote(class))?;

            state.session.selected_class = Some(class);
            state.session.phase = RidePhase::Booking;
            BookingRequest {
                pickup_location: state.session.pickup.label.clone(),
                drop_location: state.session.destination.label.clone(),
                pickup_lat: start.lat,
                pickup_lng: start.lng,
                drop_lat: end.lat,
                drop_lng: end.lng,
                vehicle_type: class.as_str().to_string(),
                fare: quote.price,
            }
        };

        match self.backend.book_ride(&request).await {
            Ok(payload) => {
                let (epoch, booking_id) = {
                    let mut state = self.lock();
                    if state.session.phase != RidePhase::Booking {
                        // cancelled while the request was in flight
                        return Ok(());
                    }
                    payload.merge_into(&mut state.session);
                    let Some(booking_id) = state.session.booking_id.clone() else {
                        state.session.phase = RidePhase::Selecting;
                        return Err(SessionError::Backend(BackendError::Rejected(
                            "booking response carried no booking id".to_string(),
                        )));
                    };
                    state.session.auto_cancel_deadline = Some(
                        Utc::now()
                            + chrono::Duration::seconds(self.config.auto_cancel_seconds as i64),
                    );
                    state.session.record("Ride booked");
                    (state.epoch, booking_id)
                };
                tracing::info!(booking_id = %booking_id, "ride booked, waiting for acceptance");
                self.notify(NoticeKind::Info, "Ride booked! Finding driver...");
                self.arm_auto_cancel(epoch, booking_id.clone());
                self.start_acceptance_poll(epoch, booking_id);
                Ok(())
            }
            Err(err) => {
                {
                    let mut state = self.lock();
                    if state.session.phase == RidePhase::Booking {
                        state.session.phase = RidePhase::Selecting;
                    }
                }
                self.notify(NoticeKind::Error, "Failed to book ride");
                Err(err.into())
            }
        }
    }

    /// The single reducer for asynchronous ride-state events, whether
    /// they arrived over the push channel or from a poll.
    pub fn apply_update(&self, update: RideUpdate) {
        match update {
            RideUpdate::Accepted { ride } => self.handle_accepted(ride),
            RideUpdate::DriverLocation {
                latitude,
                longitude,
            } => {
                let at = Coordinates::new(latitude, longitude);
                let mut state = self.lock();
                // kept even while the driver record is still pending
                state.session.driver_location = Some(at);
                if let Some(driver) = state.session.driver.as_mut() {
                    // last write wins, regardless of source
                    driver.location = Some(at);
                }
            }
            RideUpdate::Started => {
                let started = {
                    let mut state = self.lock();
                    if state.session.phase == RidePhase::Tracking {
                        state.session.record("Ride started");
                        true
                    } else {
                        false
                    }
                };
                if started {
                    self.notify(NoticeKind::Info, "Ride started!");
                }
            }
            RideUpdate::Completed { ride } => self.handle_completed(ride),
            RideUpdate::Cancelled { reason } => {
                {
                    let mut state = self.lock();
                    if !matches!(
                        state.session.phase,
                        RidePhase::Booking | RidePhase::Tracking
                    ) {
                        // stale event for a session that already moved on
                        return;
                    }
                    Self::teardown_locked(&mut state);
                    state.session.record("Ride cancelled");
                    state.session.reset();
                }
                let message = reason.unwrap_or_else(|| "Ride was cancelled".to_string());
                tracing::info!("server cancelled the ride");
                self.notify(NoticeKind::Warning, &message);
            }
        }
    }

    /// Verify the ride OTP with the server. Business rejections come back
    /// verbatim; on success the OTP is marked stale and the
    /// pickup-to-destination route is requested.
    pub async fn verify_otp(&self, code: &str) -> Result<(), SessionError> {
        let (booking_id, pickup, destination) = {
            let state = self.lock();
            if state.session.phase != RidePhase::Tracking {
                return Err(SessionError::InvalidPhase {
                    action: "verify_otp",
                    phase: state.session.phase,
                });
            }
            let booking_id =
                state
                    .session
                    .booking_id
                    .clone()
                    .ok_or(SessionError::InvalidPhase {
                        action: "verify_otp",
                        phase: state.session.phase,
                    })?;
            (
                booking_id,
                state.session.pickup.coordinates,
                state.session.destination.coordinates,
            )
        };

        self.backend.verify_otp(&booking_id, code).await?;

        let epoch = {
            let mut state = self.lock();
            state.session.otp_verified = true;
            state.epoch
        };
        self.notify(
            NoticeKind::Success,
            "OTP verified. Showing route to destination.",
        );
        if let (Some(from), Some(to)) = (pickup, destination) {
            self.spawn_route(epoch, from, to, RouteSlot::PickupToDestination);
        }
        Ok(())
    }

    /// Forward a driver-side accept. A rejection (e.g. the ride was
    /// already taken) propagates verbatim with no transition so the
    /// caller may retry; a successful response is treated as an
    /// acceptance observation like any push or poll result.
    pub async fn accept_ride(&self, driver_id: &str) -> Result<(), SessionError> {
        let booking_id = {
            let state = self.lock();
            if state.session.phase != RidePhase::Booking {
                return Err(SessionError::InvalidPhase {
                    action: "accept_ride",
                    phase: state.session.phase,
                });
            }
            state
                .session
                .booking_id
                .clone()
                .ok_or(SessionError::InvalidPhase {
                    action: "accept_ride",
                    phase: state.session.phase,
                })?
        };

        let payload = self.backend.accept_ride(&booking_id, driver_id).await?;
        self.apply_update(RideUpdate::Accepted { ride: payload });
        Ok(())
    }

    pub async fn resend_otp(&self) -> Result<(), SessionError> {
        let booking_id = {
            let state = self.lock();
            if state.session.phase != RidePhase::Tracking {
                return Err(SessionError::InvalidPhase {
                    action: "resend_otp",
                    phase: state.session.phase,
                });
            }
            state
                .session
                .booking_id
                .clone()
                .ok_or(SessionError::InvalidPhase {
                    action: "resend_otp",
                    phase: state.session.phase,
                })?
        };

        match self.backend.resend_otp(&booking_id).await {
            Ok(()) => {
                self.notify(NoticeKind::Success, "OTP resent to your phone");
                Ok(())
            }
            Err(err) => {
                self.notify(NoticeKind::Warning, "Unable to resend OTP");
                Err(err.into())
            }
        }
    }

    /// User-initiated cancel from any phase. The server call is best
    /// effort: a network failure is logged and the local session is
    /// cleared anyway, so the rider is never stuck waiting for a
    /// confirmation that may not arrive.
    pub async fn cancel_ride(&self) -> Result<(), SessionError> {
        let booking_id = {
            let mut state = self.lock();
            if state.session.phase == RidePhase::Search {
                return Ok(());
            }
            Self::teardown_locked(&mut state);
            let booking_id = state.session.booking_id.clone();
            state.session.record("Ride cancelled");
            state.session.reset();
            booking_id
        };
        self.notify(NoticeKind::Info, "Ride cancelled");

        if let Some(booking_id) = booking_id {
            if let Err(err) = self
                .backend
                .cancel_ride(&booking_id, "Cancelled by customer")
                .await
            {
                tracing::warn!(%err, booking_id = %booking_id, "cancel request failed; local session already cleared");
            }
        }
        Ok(())
    }

    /// Submit the post-ride rating and clear the session. Rating delivery
    /// is best effort; the session goes back to `Search` either way.
    pub async fn submit_rating(&self, stars: u8, comment: &str) -> Result<(), SessionError> {
        let booking_id = {
            let state = self.lock();
            if state.session.phase != RidePhase::Completed {
                return Err(SessionError::InvalidPhase {
                    action: "submit_rating",
                    phase: state.session.phase,
                });
            }
            state.session.booking_id.clone()
        };

        if let Some(booking_id) = &booking_id {
            if let Err(err) = self.backend.submit_rating(booking_id, stars, comment).await {
                tracing::warn!(%err, "rating submission failed");
            }
        }
        self.clear_completed();
        Ok(())
    }

    pub fn dismiss_rating(&self) {
        self.clear_completed();
    }

    /// Start the idle nearby-driver refresh loop. It only touches the
    /// network while the session sits in `Search`.
    pub fn start_nearby_refresh(&self) {
        let mut slot = lock_recover(&self.nearby_task);
        if slot.is_some() {
            return;
        }
        let coordinator = self.clone();
        let every = Duration::from_millis(self.config.nearby_refresh_ms);
        let radius = self.config.nearby_radius_km;
        *slot = Some(tokio::spawn(async move {
            loop {
                let center = {
                    let state = coordinator.lock();
                    if state.session.phase == RidePhase::Search {
                        state
                            .session
                            .pickup
                            .coordinates
                            .or(state.current_location)
                    } else {
                        None
                    }
                };
                if let Some(center) = center {
                    match coordinator.backend.nearby_drivers(center, radius).await {
                        Ok(drivers) => {
                            let mut state = coordinator.lock();
                            if state.session.phase == RidePhase::Search {
                                state.session.nearby_drivers = drivers;
                            }
                        }
                        Err(err) => tracing::debug!(%err, "nearby driver fetch failed"),
                    }
                }
                sleep(every).await;
            }
        }));
    }

    pub fn stop_nearby_refresh(&self) {
        if let Some(task) = lock_recover(&self.nearby_task).take() {
            task.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock_recover(&self.state)
    }

    fn notify(&self, kind: NoticeKind, message: &str) {
        let _ = self.notices.send(SessionNotice {
            id: Uuid::new_v4(),
            kind,
            message: message.to_string(),
        });
    }

    fn register(&self, handle: JoinHandle<()>) {
        self.lock().tasks.push(handle);
    }

    /// Cancel every timer and loop tied to the current context. Anything
    /// that still fires afterwards sees a bumped epoch and becomes a
    /// no-op.
    fn teardown_locked(state: &mut SessionState) {
        state.epoch += 1;
        state.hydrating_for = None;
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }

    fn handle_accepted(&self, ride: RidePayload) {
        struct Fresh {
            epoch: u64,
            booking_id: String,
            needs_otp: bool,
            driver_from: Option<Coordinates>,
            pickup: Option<Coordinates>,
        }

        let fresh = {
            let mut state = self.lock();
            match state.session.phase {
                RidePhase::Tracking => {
                    // Acceptance observed again (push + poll, or a retry):
                    // merge only, no second transition, no repeated side
                    // effects.
                    ride.merge_into(&mut state.session);
                    None
                }
                RidePhase::Booking => {
                    Self::teardown_locked(&mut state);
                    ride.merge_into(&mut state.session);
                    state.session.phase = RidePhase::Tracking;
                    state.session.auto_cancel_deadline = None;
                    state.session.record("Driver accepted");
                    // A location pushed before acceptance stands in when
                    // the acceptance payload carries no coordinates.
                    let fallback = state.session.driver_location;
                    if let Some(driver) = state.session.driver.as_mut() {
                        if driver.location.is_none() {
                            driver.location = fallback;
                        }
                    }
                    state.session.booking_id.clone().map(|booking_id| Fresh {
                        epoch: state.epoch,
                        needs_otp: state.session.otp.is_none(),
                        driver_from: state
                            .session
                            .driver
                            .as_ref()
                            .and_then(|d| d.location)
                            .or(fallback),
                        pickup: state.session.pickup.coordinates,
                        booking_id,
                    })
                }
                _ => None,
            }
        };

        let Some(fresh) = fresh else {
            return;
        };

        tracing::info!(booking_id = %fresh.booking_id, "ride accepted");
        self.notify(NoticeKind::Success, "Driver accepted your ride!");
        if let (Some(from), Some(to)) = (fresh.driver_from, fresh.pickup) {
            self.spawn_route(fresh.epoch, from, to, RouteSlot::DriverToPickup);
        }
        if fresh.needs_otp {
            self.ensure_otp(fresh.booking_id);
        }
    }

    fn handle_completed(&self, ride: Option<RidePayload>) {
        {
            let mut state = self.lock();
            if state.session.phase != RidePhase::Tracking {
                return;
            }
            Self::teardown_locked(&mut state);
            if let Some(payload) = &ride {
                payload.merge_into(&mut state.session);
            }
            state.session.phase = RidePhase::Completed;
            state.session.record("Ride completed");
            state.session.completed_summary = Some(CompletedSummary {
                driver_name: state
                    .session
                    .driver
                    .as_ref()
                    .map(|driver| driver.name.clone())
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| "Driver".to_string()),
                fare: state.session.fare.unwrap_or(0.0),
            });
        }
        self.notify(NoticeKind::Success, "Ride completed!");
    }

    fn clear_completed(&self) {
        let mut state = self.lock();
        if state.session.phase == RidePhase::Completed {
            Self::teardown_locked(&mut state);
            state.session.reset();
        }
    }

    fn arm_auto_cancel(&self, epoch: u64, booking_id: String) {
        let coordinator = self.clone();
        let wait = Duration::from_secs(self.config.auto_cancel_seconds);
        let handle = tokio::spawn(async move {
            sleep(wait).await;
            coordinator.fire_auto_cancel(epoch, &booking_id);
        });
        self.register(handle);
    }

    fn fire_auto_cancel(&self, epoch: u64, booking_id: &str) {
        {
            let mut state = self.lock();
            // A stale timer must never cancel a ride that already
            // advanced.
            if state.epoch != epoch
                || state.session.phase != RidePhase::Booking
                || state.session.booking_id.as_deref() != Some(booking_id)
            {
                return;
            }
            Self::teardown_locked(&mut state);
            state.session.record("No driver found");
            state.session.reset();
        }
        tracing::info!(booking_id = %booking_id, "no acceptance before deadline, auto-cancelling");
        self.notify(NoticeKind::Error, "No driver found. Ride cancelled.");

        let backend = self.backend.clone();
        let booking_id = booking_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = backend.cancel_ride(&booking_id, "No driver found").await {
                tracing::warn!(%err, booking_id = %booking_id, "auto-cancel request failed");
            }
        });
    }

    fn start_acceptance_poll(&self, epoch: u64, booking_id: String) {
        let coordinator = self.clone();
        let interval = Duration::from_millis(self.config.accept_poll_interval_ms);
        let ceiling = Duration::from_millis(self.config.accept_poll_ceiling_ms);
        let handle = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + ceiling;
            loop {
                sleep(interval).await;
                if tokio::time::Instant::now() >= deadline {
                    tracing::debug!(booking_id = %booking_id, "acceptance polling ceiling reached");
                    return;
                }
                {
                    let state = coordinator.lock();
                    if state.epoch != epoch || state.session.phase != RidePhase::Booking {
                        return;
                    }
                }
                match coordinator.backend.ride_detail(&booking_id).await {
                    Ok(payload) if payload.is_accepted() => {
                        coordinator.apply_update(RideUpdate::Accepted { ride: payload });
                        return;
                    }
                    Ok(_) => {}
                    // individual poll failures are absorbed
                    Err(err) => tracing::debug!(%err, "acceptance poll failed"),
                }
            }
        });
        self.register(handle);
    }

    /// Start the bounded OTP retry loop, unless one is already in flight
    /// for this booking.
    fn ensure_otp(&self, booking_id: String) {
        let epoch = {
            let mut state = self.lock();
            if state.session.otp.is_some() {
                return;
            }
            if state.hydrating_for.as_deref() == Some(booking_id.as_str()) {
                return;
            }
            state.hydrating_for = Some(booking_id.clone());
            state.epoch
        };
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            coordinator.run_otp_hydration(epoch, booking_id).await;
        });
        self.register(handle);
    }

    async fn run_otp_hydration(&self, epoch: u64, booking_id: String) {
        let attempts = self.config.otp_retry_attempts.max(1);
        for attempt in 1..=attempts {
            {
                let state = self.lock();
                if state.epoch != epoch || state.session.otp.is_some() {
                    break;
                }
            }
            match self.backend.ride_detail(&booking_id).await {
                Ok(payload) if payload.otp.is_some() => {
                    let mut state = self.lock();
                    // A loop torn down mid-fetch must not clear a marker
                    // that now belongs to a newer session's hydrator.
                    if state.epoch == epoch {
                        payload.merge_into(&mut state.session);
                        state.hydrating_for = None;
                    }
                    return;
                }
                Ok(_) => {
                    tracing::debug!(booking_id = %booking_id, attempt, "ride detail still has no otp")
                }
                Err(err) => tracing::debug!(%err, attempt, "otp hydration fetch failed"),
            }
            if attempt < attempts {
                sleep(Duration::from_millis(self.config.otp_retry_interval_ms)).await;
            }
        }
        // Give up silently; a later poll or push event may still carry it.
        let mut state = self.lock();
        if state.hydrating_for.as_deref() == Some(booking_id.as_str()) {
            state.hydrating_for = None;
        }
    }

    fn debounced_geocode(&self, query: String, generation: u64, is_pickup: bool) {
        let coordinator = self.clone();
        let debounce = Duration::from_millis(self.config.geocode_debounce_ms);
        let handle = tokio::spawn(async move {
            sleep(debounce).await;
            {
                let state = coordinator.lock();
                let current = if is_pickup {
                    state.pickup_generation
                } else {
                    state.destination_generation
                };
                if current != generation {
                    // superseded while debouncing
                    return;
                }
            }
            let found = match coordinator.geocoder.geocode(&query).await {
                Ok(found) => found,
                Err(err) => {
                    tracing::warn!(%err, query = %query, "geocoding failed");
                    return;
                }
            };
            let Some(found) = found else {
                return;
            };
            {
                let mut state = coordinator.lock();
                let current = if is_pickup {
                    state.pickup_generation
                } else {
                    state.destination_generation
                };
                if current != generation {
                    // a newer request was issued while this one was in
                    // flight; its response wins
                    return;
                }
                if is_pickup {
                    state.session.pickup.coordinates = Some(found.coordinates);
                } else {
                    state.session.destination.coordinates = Some(found.coordinates);
                }
            }
            coordinator.refresh_preview();
        });
        self.register(handle);
    }

    fn reverse_label(&self, at: Coordinates, is_pickup: bool) {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            match coordinator.geocoder.reverse(at).await {
                Ok(Some(label)) => {
                    let mut state = coordinator.lock();
                    let place = if is_pickup {
                        &mut state.session.pickup
                    } else {
                        &mut state.session.destination
                    };
                    if place.coordinates == Some(at) {
                        place.label = label;
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(%err, "reverse geocoding failed"),
            }
        });
        self.register(handle);
    }

    /// Debounced re-resolution of the preview route; only the response to
    /// the most recent request may update the session.
    fn refresh_preview(&self) {
        let (generation, start, end) = {
            let mut state = self.lock();
            if !matches!(
                state.session.phase,
                RidePhase::Search | RidePhase::Selecting
            ) {
                return;
            }
            let (Some(start), Some(end)) = (
                state.session.pickup.coordinates,
                state.session.destination.coordinates,
            ) else {
                return;
            };
            state.preview_generation += 1;
            (state.preview_generation, start, end)
        };
        let coordinator = self.clone();
        let debounce = Duration::from_millis(self.config.preview_debounce_ms);
        let handle = tokio::spawn(async move {
            sleep(debounce).await;
            if coordinator.lock().preview_generation != generation {
                return;
            }
            let route = coordinator.resolver.resolve(start, end).await;
            let mut state = coordinator.lock();
            if state.preview_generation != generation {
                return;
            }
            state.session.preview_route = Some(route);
        });
        self.register(handle);
    }

    fn spawn_route(&self, epoch: u64, from: Coordinates, to: Coordinates, slot: RouteSlot) {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            let route = coordinator.resolver.resolve(from, to).await;
            let mut state = coordinator.lock();
            if state.epoch != epoch {
                // the session moved on while resolving
                return;
            }
            match slot {
                RouteSlot::DriverToPickup => {
                    state.session.driver_to_pickup_route = Some(route);
                }
                RouteSlot::PickupToDestination => {
                    state.session.pickup_to_destination_route = Some(route);
                }
            }
        });
        self.register(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::GeocodeResult;
    use async_trait::async_trait;
    use rideflow_shared::RoutingConfig;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const PICKUP: Coordinates = Coordinates {
        lat: 28.6139,
        lng: 77.2090,
    };
    const DESTINATION: Coordinates = Coordinates {
        lat: 28.7041,
        lng: 77.1025,
    };

    #[derive(Default)]
    struct MockBackend {
        detail: Mutex<RidePayload>,
        detail_delay: Mutex<Duration>,
        detail_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
        fail_booking: AtomicBool,
        fail_cancel: AtomicBool,
        reject_accept: AtomicBool,
    }

    impl MockBackend {
        fn set_detail(&self, payload: RidePayload) {
            *self.detail.lock().unwrap() = payload;
        }
    }

    #[async_trait]
    impl RideBackend for MockBackend {
        async fn book_ride(&self, _request: &BookingRequest) -> Result<RidePayload, BackendError> {
            if self.fail_booking.load(Ordering::SeqCst) {
                return Err(BackendError::Transport("connection refused".to_string()));
            }
            Ok(RidePayload {
                booking_id: Some("R-1".to_string()),
                status: Some("PENDING".to_string()),
                ..RidePayload::default()
            })
        }

        async fn ride_detail(&self, _booking_id: &str) -> Result<RidePayload, BackendError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.detail_delay.lock().unwrap();
            if !delay.is_zero() {
                sleep(delay).await;
            }
            Ok(self.detail.lock().unwrap().clone())
        }

        async fn accept_ride(
            &self,
            booking_id: &str,
            driver_id: &str,
        ) -> Result<RidePayload, BackendError> {
            if self.reject_accept.load(Ordering::SeqCst) {
                return Err(BackendError::Rejected(
                    "Ride already accepted by another driver".to_string(),
                ));
            }
            Ok(RidePayload {
                booking_id: Some(booking_id.to_string()),
                status: Some("ACCEPTED".to_string()),
                driver_id: Some(driver_id.to_string()),
                driver_name: Some("Ravi".to_string()),
                ..RidePayload::default()
            })
        }

        async fn cancel_ride(&self, _booking_id: &str, _reason: &str) -> Result<(), BackendError> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_cancel.load(Ordering::SeqCst) {
                return Err(BackendError::Transport("connection reset".to_string()));
            }
            Ok(())
        }

        async fn verify_otp(&self, _booking_id: &str, _otp: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn resend_otp(&self, _booking_id: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn nearby_drivers(
            &self,
            _around: Coordinates,
            _radius_km: f64,
        ) -> Result<Vec<crate::models::NearbyDriver>, BackendError> {
            Ok(Vec::new())
        }

        async fn submit_rating(
            &self,
            _booking_id: &str,
            _stars: u8,
            _comment: &str,
        ) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockGeocoder {
        // query -> (coordinates, simulated latency)
        places: HashMap<String, (Coordinates, Duration)>,
    }

    #[async_trait]
    impl Geocoder for MockGeocoder {
        async fn geocode(&self, query: &str) -> Result<Option<GeocodeResult>, BackendError> {
            let Some((coordinates, latency)) = self.places.get(query).copied() else {
                return Ok(None);
            };
            sleep(latency).await;
            Ok(Some(GeocodeResult {
                coordinates,
                display_name: query.to_string(),
            }))
        }

        async fn reverse(&self, _at: Coordinates) -> Result<Option<String>, BackendError> {
            Ok(Some("Resolved Place".to_string()))
        }
    }

    fn coordinator_with(backend: Arc<MockBackend>, geocoder: MockGeocoder) -> RideCoordinator {
        let resolver = Arc::new(RouteResolver::with_backends(
            Vec::new(),
            RoutingConfig::default(),
        ));
        RideCoordinator::new(
            backend,
            Arc::new(geocoder),
            resolver,
            SessionConfig::default(),
        )
    }

    fn accepted_payload(otp: Option<&str>) -> RidePayload {
        RidePayload {
            booking_id: Some("R-1".to_string()),
            status: Some("ACCEPTED".to_string()),
            otp: otp.map(str::to_string),
            driver_id: Some("D1".to_string()),
            driver_name: Some("Ravi".to_string()),
            driver_lat: Some(28.6200),
            driver_lng: Some(77.2150),
            fare: Some(225.0),
            ..RidePayload::default()
        }
    }

    /// Walk the coordinator to `Booking` for vehicle class `Car`.
    async fn book(coordinator: &RideCoordinator) {
        coordinator.set_pickup_point(PICKUP);
        coordinator.set_destination_point(DESTINATION);
        coordinator.request_quote().expect("quotes");
        coordinator
            .book_ride(VehicleClass::Car)
            .await
            .expect("booking succeeds");
    }

    #[tokio::test(start_paused = true)]
    async fn test_booking_then_acceptance_then_otp_hydration() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        let session = coordinator.snapshot();
        assert_eq!(session.phase, RidePhase::Booking);
        assert_eq!(session.booking_id.as_deref(), Some("R-1"));
        assert!(session.auto_cancel_deadline.is_some());

        // acceptance arrives without an OTP
        coordinator.apply_update(RideUpdate::Accepted {
            ride: accepted_payload(None),
        });
        let session = coordinator.snapshot();
        assert_eq!(session.phase, RidePhase::Tracking);
        assert!(session.otp.is_none());
        assert!(session.auto_cancel_deadline.is_none());

        // the detail endpoint now serves the OTP; the hydrator picks it up
        backend.set_detail(accepted_payload(Some("4821")));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.snapshot().otp.as_deref(), Some("4821"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_acceptance_merges_without_side_effects() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        coordinator.apply_update(RideUpdate::Accepted {
            ride: accepted_payload(Some("4821")),
        });
        // the same acceptance observed again via poll, this time sparse
        coordinator.apply_update(RideUpdate::Accepted {
            ride: RidePayload {
                booking_id: Some("R-1".to_string()),
                status: Some("ACCEPTED".to_string()),
                ..RidePayload::default()
            },
        });
        coordinator.apply_update(RideUpdate::Accepted {
            ride: RidePayload {
                booking_id: Some("R-1".to_string()),
                status: Some("ACCEPTED".to_string()),
                ..RidePayload::default()
            },
        });

        let session = coordinator.snapshot();
        assert_eq!(session.phase, RidePhase::Tracking);
        assert_eq!(session.otp.as_deref(), Some("4821"));
        let accepted_entries = session
            .timeline
            .iter()
            .filter(|event| event.label == "Driver accepted")
            .count();
        assert_eq!(accepted_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_otp_hydrator_runs_once_per_booking() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());
        {
            let mut state = coordinator.lock();
            state.session.phase = RidePhase::Tracking;
            state.session.booking_id = Some("R-1".to_string());
        }

        // detail never carries an OTP, so each loop would burn all attempts
        coordinator.ensure_otp("R-1".to_string());
        coordinator.ensure_otp("R-1".to_string());
        sleep(Duration::from_secs(5)).await;

        let attempts = SessionConfig::default().otp_retry_attempts as usize;
        assert_eq!(backend.detail_calls.load(Ordering::SeqCst), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_cancel_fires_exactly_once() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        sleep(Duration::from_secs(301)).await;

        assert_eq!(coordinator.snapshot().phase, RidePhase::Search);
        assert_eq!(backend.cancel_calls.load(Ordering::SeqCst), 1);

        // nothing else fires later
        sleep(Duration::from_secs(600)).await;
        assert_eq!(backend.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptance_just_before_deadline_disarms_auto_cancel() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        sleep(Duration::from_secs(299)).await;
        coordinator.apply_update(RideUpdate::Accepted {
            ride: accepted_payload(Some("4821")),
        });
        sleep(Duration::from_secs(10)).await;

        assert_eq!(coordinator.snapshot().phase, RidePhase::Tracking);
        assert_eq!(backend.cancel_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_booking_failure_reverts_to_selecting() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_booking.store(true, Ordering::SeqCst);
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        coordinator.set_pickup_point(PICKUP);
        coordinator.set_destination_point(DESTINATION);
        coordinator.request_quote().expect("quotes");
        let result = coordinator.book_ride(VehicleClass::Car).await;

        assert!(result.is_err());
        assert_eq!(coordinator.snapshot().phase, RidePhase::Selecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_session_even_when_request_fails() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_cancel.store(true, Ordering::SeqCst);
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        coordinator.cancel_ride().await.expect("cancel is best effort");

        let session = coordinator.snapshot();
        assert_eq!(session.phase, RidePhase::Search);
        assert!(session.booking_id.is_none());
        assert_eq!(backend.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_geocode_response_is_discarded() {
        let mut geocoder = MockGeocoder::default();
        let old_coords = Coordinates::new(28.6315, 77.2167);
        let new_coords = Coordinates::new(28.6519, 77.1909);
        geocoder.places.insert(
            "Connaught Place".to_string(),
            (old_coords, Duration::from_secs(2)),
        );
        geocoder.places.insert(
            "Karol Bagh".to_string(),
            (new_coords, Duration::from_millis(100)),
        );
        let coordinator = coordinator_with(Arc::new(MockBackend::default()), geocoder);

        coordinator.set_pickup("Connaught Place");
        // let the first request get past its debounce and into flight
        sleep(Duration::from_millis(400)).await;
        coordinator.set_pickup("Karol Bagh");
        sleep(Duration::from_secs(3)).await;

        let session = coordinator.snapshot();
        assert_eq!(session.pickup.label, "Karol Bagh");
        assert_eq!(session.pickup.coordinates, Some(new_coords));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_cancel_event_resets_and_notifies() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());
        let mut notices = coordinator.subscribe_notices();

        book(&coordinator).await;
        coordinator.apply_update(RideUpdate::Accepted {
            ride: accepted_payload(Some("4821")),
        });
        coordinator.apply_update(RideUpdate::Cancelled {
            reason: Some("Driver unavailable".to_string()),
        });

        assert_eq!(coordinator.snapshot().phase, RidePhase::Search);
        let mut saw_warning = false;
        while let Ok(notice) = notices.try_recv() {
            if notice.kind == NoticeKind::Warning && notice.message == "Driver unavailable" {
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_captures_summary_for_rating() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        coordinator.apply_update(RideUpdate::Accepted {
            ride: accepted_payload(Some("4821")),
        });
        coordinator.apply_update(RideUpdate::Started);
        coordinator.apply_update(RideUpdate::Completed { ride: None });

        let session = coordinator.snapshot();
        assert_eq!(session.phase, RidePhase::Completed);
        let summary = session.completed_summary.expect("summary captured");
        assert_eq!(summary.driver_name, "Ravi");
        assert_eq!(summary.fare, 225.0);

        coordinator.dismiss_rating();
        assert_eq!(coordinator.snapshot().phase, RidePhase::Search);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_otp_requests_destination_route() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        coordinator.apply_update(RideUpdate::Accepted {
            ride: accepted_payload(Some("4821")),
        });
        coordinator.verify_otp("4821").await.expect("otp accepted");
        sleep(Duration::from_millis(50)).await;

        let session = coordinator.snapshot();
        assert!(session.otp_verified);
        let route = session
            .pickup_to_destination_route
            .expect("route requested after verification");
        assert!(!route.coordinates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_accept_keeps_booking_phase_for_retry() {
        let backend = Arc::new(MockBackend::default());
        backend.reject_accept.store(true, Ordering::SeqCst);
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        let err = coordinator
            .accept_ride("D2")
            .await
            .expect_err("rejection propagates");
        assert!(err
            .to_string()
            .contains("already accepted by another driver"));
        assert_eq!(coordinator.snapshot().phase, RidePhase::Booking);

        // a retry after the rejection clears can still succeed
        backend.reject_accept.store(false, Ordering::SeqCst);
        coordinator.accept_ride("D2").await.expect("retry succeeds");
        assert_eq!(coordinator.snapshot().phase, RidePhase::Tracking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_before_acceptance_survives_sparse_accept() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        // location pushed while the driver record is still pending
        coordinator.apply_update(RideUpdate::DriverLocation {
            latitude: 28.62,
            longitude: 77.215,
        });
        // acceptance payload carries no coordinates
        coordinator.apply_update(RideUpdate::Accepted {
            ride: RidePayload {
                booking_id: Some("R-1".to_string()),
                status: Some("ACCEPTED".to_string()),
                driver_id: Some("D1".to_string()),
                driver_name: Some("Ravi".to_string()),
                otp: Some("4821".to_string()),
                ..RidePayload::default()
            },
        });
        sleep(Duration::from_millis(50)).await;

        let session = coordinator.snapshot();
        let driver = session.driver.expect("driver present");
        assert_eq!(driver.location, Some(Coordinates::new(28.62, 77.215)));
        assert!(session.driver_to_pickup_route.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_torn_down_hydrator_leaves_replacement_marker_alone() {
        let backend = Arc::new(MockBackend::default());
        backend.set_detail(accepted_payload(Some("4821")));
        *backend.detail_delay.lock().unwrap() = Duration::from_millis(100);
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());
        {
            let mut state = coordinator.lock();
            state.session.phase = RidePhase::Tracking;
            state.session.booking_id = Some("R-1".to_string());
            state.hydrating_for = Some("R-1".to_string());
        }

        let stale = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run_otp_hydration(0, "R-1".to_string()).await }
        });
        // while the stale loop's fetch is in flight, the session is torn
        // down and a fresh booking arms its own hydrator
        sleep(Duration::from_millis(50)).await;
        {
            let mut state = coordinator.lock();
            state.epoch += 1;
            state.session.otp = None;
            state.session.booking_id = Some("R-2".to_string());
            state.hydrating_for = Some("R-2".to_string());
        }
        stale.await.expect("stale hydrator finishes");

        let state = coordinator.lock();
        assert_eq!(state.hydrating_for.as_deref(), Some("R-2"));
        assert!(state.session.otp.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_location_update_is_last_write_wins() {
        let backend = Arc::new(MockBackend::default());
        let coordinator = coordinator_with(backend.clone(), MockGeocoder::default());

        book(&coordinator).await;
        coordinator.apply_update(RideUpdate::Accepted {
            ride: accepted_payload(Some("4821")),
        });
        coordinator.apply_update(RideUpdate::DriverLocation {
            latitude: 28.6250,
            longitude: 77.2100,
        });
        coordinator.apply_update(RideUpdate::DriverLocation {
            latitude: 28.6300,
            longitude: 77.2050,
        });

        let driver = coordinator.snapshot().driver.expect("driver present");
        assert_eq!(driver.location, Some(Coordinates::new(28.6300, 77.2050)));
    }
}
