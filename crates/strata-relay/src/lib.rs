//! # strata-relay
//!
//! Paced, self-healing relays from live media sources to streaming endpoints.
//!
//! Each configured [`RelayPair`] gets its own [`Supervisor`] thread that runs
//! [`RelayWorker`] attempts back to back, with a cooldown in between, until
//! the shared [`CancelToken`] is set. Within an attempt, units are forwarded
//! in read order and held back by the [`PacingClock`] so the destination sees
//! the source's real-time cadence instead of a burst.
//!
//! The media library sits behind the traits in [`media`]. The FFmpeg
//! implementation is behind the `ffmpeg` cargo feature; the `testing` feature
//! adds a scripted in-memory backend.

pub mod cancel;
pub mod config;
pub mod error;
pub mod fleet;
pub mod media;
pub mod pacing;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use cancel::CancelToken;
pub use config::{RelayPair, RelaySettings};
pub use error::{ConfigError, TerminalReason};
pub use fleet::{Fleet, FleetReport, RelayOutcome};
pub use pacing::{PacingClock, PacingConfig, TimeBase};
pub use supervisor::{Supervisor, SupervisorEvent, SupervisorReport};
pub use worker::{AttemptReport, RelayWorker};
