use rideflow_shared::Coordinates;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Drive `on_tick` with eased intermediate positions from `start` to
/// `end` over `duration`, used to animate a marker between discrete
/// position updates. Ticks at roughly frame rate, always finishes with
/// a tick exactly at `end`, and then returns; a fresh call is required
/// for a new animation.
pub async fn interpolate_position<F>(
    start: Coordinates,
    end: Coordinates,
    duration: Duration,
    mut on_tick: F,
) where
    F: FnMut(Coordinates),
{
    if duration.is_zero() {
        on_tick(end);
        return;
    }

    let started = Instant::now();
    let mut frames = tokio::time::interval(FRAME_INTERVAL);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        frames.tick().await;
        let progress =
            (started.elapsed().as_secs_f64() / duration.as_secs_f64()).min(1.0);
        let eased = ease_in_out_cubic(progress);

        on_tick(Coordinates::new(
            start.lat + (end.lat - start.lat) * eased,
            start.lng + (end.lng - start.lng) * eased,
        ));

        if progress >= 1.0 {
            break;
        }
    }
}

fn ease_in_out_cubic(t: f64) -> f64 {
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}
