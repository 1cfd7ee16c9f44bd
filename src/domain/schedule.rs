//! Sweep interval computation.

use std::time::Duration;

/// Shortest pause between two sweeps, whatever the configuration.
pub const MINIMUM_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Pause the polling worker takes between sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepInterval {
    pub interval: Duration,
    /// The tightest requirement was below the floor and got raised to it.
    pub clamped: bool,
}

/// Derive the sweep interval from the tightest device requirement.
///
/// `min_required` is `None` when no device asks for polling; the floor is
/// used then. The result is `jitter_percent` of the clamped base, never
/// below [`MINIMUM_SWEEP_INTERVAL`].
pub fn sweep_interval(min_required: Option<Duration>, floor: Duration, jitter_percent: u8) -> SweepInterval {
    let (base, clamped) = match min_required {
        Some(required) if required < floor => (floor, true),
        Some(required) => (required, false),
        None => (floor, false),
    };

    let interval = base * u32::from(jitter_percent) / 100;
    SweepInterval {
        interval: interval.max(MINIMUM_SWEEP_INTERVAL),
        clamped,
    }
}
