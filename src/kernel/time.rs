//! Conversion between raw timer ticks and wall-clock [`Duration`]s.
use crate::architecture;
use core::{
    hint,
    num::{NonZeroU128, NonZeroU32},
    ops::Add,
    time::Duration,
};

/// Nanoseconds per second, as a `NonZeroU32` for division without a zero-check.
#[allow(clippy::undocumented_unsafe_blocks)]
const NANOSEC_PER_SEC: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(1_000_000_000) };

/// A raw reading of the architected physical counter (`CNTPCT_EL0`).
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimerValue {
    /// The counter value, in timer ticks.
    pub ticks: u64,
}

impl TimerValue {
    /// The largest representable tick count.
    const MAX: Self = Self::new(u64::MAX);

    /// Wraps a raw tick count.
    pub const fn new(ticks: u64) -> Self {
        Self { ticks }
    }
}

impl Add for TimerValue {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            ticks: self.ticks + other.ticks,
        }
    }
}

impl From<TimerValue> for Duration {
    fn from(value: TimerValue) -> Self {
        let nanoseconds: u128 = u128::from(value.ticks) * u128::from(NANOSEC_PER_SEC.get())
            / NonZeroU128::from(architecture::timer::timer_frequency());

        Self::new(
            (nanoseconds / NonZeroU128::from(NANOSEC_PER_SEC))
                .try_into()
                .expect("seconds component of a tick count should not overflow"),
            (nanoseconds % NonZeroU128::from(NANOSEC_PER_SEC))
                .try_into()
                .expect("subsec nanoseconds of a tick count should not overflow"),
        )
    }
}

impl TryFrom<Duration> for TimerValue {
    type Error = &'static str;

    fn try_from(duration: Duration) -> Result<Self, Self::Error> {
        if duration > Duration::from(Self::MAX) {
            return Err("duration is too large to represent with the architected timer");
        }

        Ok(Self {
            ticks: (duration.as_nanos()
                * u128::from(NonZeroU128::from(architecture::timer::timer_frequency()))
                / NonZeroU128::from(NANOSEC_PER_SEC))
            .try_into()
            .map_err(|_err| "tick count for a small enough duration should not overflow")?,
        })
    }
}

/// Returns the current monotonic timestamp since the timer was last reset.
pub fn now() -> Duration {
    Duration::from(architecture::timer::current_tick())
}

/// Busy-waits for at least the given duration, up to rounding error.
#[allow(dead_code)]
pub fn wait_at_least(duration: Duration) {
    let target_time: Duration = now() + duration;

    while now() < target_time {
        hint::spin_loop();
    }
}
