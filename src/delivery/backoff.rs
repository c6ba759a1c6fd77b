use std::time::Duration;

use crate::config::QueueConfig;

/// Pause before the next send given the radio's free TX slots.
///
/// Congested (`free <= congestion_threshold`): grows linearly with every missing slot,
/// capped at `max_backoff_ms`. Lightly loaded (`free <= max_free_slots`): fixed
/// `normal_delay_ms`. Otherwise no pause.
pub fn backoff_delay(free: u32, config: &QueueConfig) -> Duration {
    if free <= config.congestion_threshold {
        let missing = u64::from(config.congestion_threshold - free) + 1;
        let ms = config
            .congestion_delay_multiplier_ms
            .saturating_mul(missing)
            .min(config.max_backoff_ms);
        Duration::from_millis(ms)
    } else if free <= config.max_free_slots {
        Duration::from_millis(config.normal_delay_ms)
    } else {
        Duration::ZERO
    }
}
