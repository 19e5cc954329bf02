//! Artificial latency and fault injection.

use crate::model::{ErrorSimulation, Mock};
use rand::Rng;
use std::time::Duration;

/// Delay to apply before serving `mock`, in milliseconds.
///
/// A distinct `[min, max]` range draws uniformly from it; otherwise the fixed
/// `delay_ms` is used.
pub fn draw_delay<R: Rng>(mock: &Mock, rng: &mut R) -> u64 {
    match (mock.delay_range_min_ms, mock.delay_range_max_ms) {
        (Some(min), Some(max)) if min != max => {
            let (low, high) = if min < max { (min, max) } else { (max, min) };
            rng.gen_range(low..=high)
        }
        _ => mock.delay_ms,
    }
}

/// Whether this request should take the simulated error path.
pub fn should_simulate_error<R: Rng>(simulation: &ErrorSimulation, rng: &mut R) -> bool {
    simulation.is_armed() && rng.gen::<f64>() < simulation.probability
}

/// Cooperative sleep; a no-op for zero.
pub async fn sleep_ms(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
