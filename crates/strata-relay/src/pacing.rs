//! # Pacing Clock
//!
//! Keeps forwarded output on the source's real-time timeline instead of
//! pushing units as fast as they can be read.
//!
//! Each attempt starts a [`PacingClock`]. For every unit the worker converts
//! the unit's timestamp to a common microsecond timeline and asks the clock
//! how long to hold it back:
//!
//! ```text
//!   elapsed <= burst allowance       → no delay (pipeline priming)
//!   timestamp unknown                → no delay (due now)
//!   timestamp <= elapsed             → no delay (behind schedule, catch up)
//!   timestamp  > elapsed             → min(timestamp - elapsed, max_delay)
//! ```
//!
//! Timestamps are stream-relative integers in a rational [`TimeBase`];
//! [`rescale`] moves them between bases.

use std::fmt;
use std::time::Duration;

use quanta::Instant;

/// Rational unit of time in which a stream's timestamps are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    /// One microsecond: the common pacing timeline.
    pub const MICROS: TimeBase = TimeBase::new(1, 1_000_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// A base with a zero term cannot convert anything.
    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Convert `ts` from `from` units to `to` units.
///
/// Computes `ts * from / to` in 128-bit arithmetic, rounds half away from
/// zero and saturates at the `i64` range. The transform is monotonic
/// non-decreasing in `ts`. Invalid bases leave `ts` untouched.
pub fn rescale(ts: i64, from: TimeBase, to: TimeBase) -> i64 {
    if !from.is_valid() || !to.is_valid() || from == to {
        return ts;
    }
    let num = from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };

    let product = ts as i128 * num;
    let half = den / 2;
    let rounded = if product >= 0 {
        (product + half) / den
    } else {
        (product - half) / den
    };
    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Position of a unit on the microsecond timeline.
///
/// Presentation timestamp first, decode timestamp as fallback; `None` when
/// the unit carries neither.
pub fn unit_timeline_us(pts: Option<i64>, dts: Option<i64>, time_base: TimeBase) -> Option<i64> {
    pts.or(dts).map(|ts| rescale(ts, time_base, TimeBase::MICROS))
}

/// Pacing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingConfig {
    /// Initial wall time during which units are never held back.
    pub burst_allowance: Duration,
    /// Upper bound for a single pacing delay.
    pub max_delay: Duration,
    /// Grain at which a pacing delay re-checks cancellation.
    pub sleep_slice: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            burst_allowance: Duration::from_secs(2),
            max_delay: Duration::from_micros(u32::MAX as u64),
            sleep_slice: Duration::from_millis(500),
        }
    }
}

/// Per-attempt pacing state: the zero point plus the configuration.
#[derive(Debug, Clone)]
pub struct PacingClock {
    config: PacingConfig,
    start: Instant,
}

impl PacingClock {
    /// Start the clock for a new attempt.
    pub fn started(config: PacingConfig) -> Self {
        Self {
            config,
            start: Instant::now(),
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Wall time since the attempt started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Delay for a unit at `timeline_us`, measured against the live clock.
    pub fn delay_now(&self, timeline_us: Option<i64>) -> Duration {
        self.delay_for(timeline_us, self.elapsed())
    }

    /// Delay for a unit at `timeline_us` given `elapsed` wall time.
    pub fn delay_for(&self, timeline_us: Option<i64>, elapsed: Duration) -> Duration {
        if elapsed <= self.config.burst_allowance {
            return Duration::ZERO;
        }
        let Some(ts_us) = timeline_us else {
            return Duration::ZERO;
        };
        let elapsed_us = i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX);
        if ts_us <= elapsed_us {
            return Duration::ZERO;
        }
        let ahead = Duration::from_micros((ts_us - elapsed_us) as u64);
        ahead.min(self.config.max_delay)
    }
}
