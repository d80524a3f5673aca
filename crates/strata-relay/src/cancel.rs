//! Cooperative cancellation shared by every relay.
//!
//! A [`CancelToken`] is a cloneable handle over a single atomic flag. It is
//! set once (normally from the Ctrl-C handler) and polled by every worker at
//! its safe points: the top of the forwarding loop, the pacing sleep, the
//! retry cooldown and the media library's interrupt callback.
//!
//! Tokens are injected at construction, so a test can cancel one relay
//! without touching any process-wide state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use quanta::Instant;

/// Shared, set-once cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    ///
    /// Returns `true` if this call was the one that set the flag.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Block for up to `total`, waking every `slice` to re-check the flag.
    ///
    /// Returns `true` when the full duration elapsed and `false` as soon as
    /// cancellation is observed. Worst-case cancellation latency is one
    /// `slice`.
    pub fn sleep(&self, total: Duration, slice: Duration) -> bool {
        let slice = slice.max(Duration::from_millis(1));
        let start = Instant::now();
        loop {
            if self.is_cancelled() {
                return false;
            }
            let elapsed = start.elapsed();
            if elapsed >= total {
                return true;
            }
            thread::sleep((total - elapsed).min(slice));
        }
    }

    /// Raw pointer to the underlying flag, for C interrupt callbacks.
    ///
    /// The pointer stays valid for as long as any clone of this token is
    /// alive; callers must keep a clone next to whatever holds the pointer.
    #[cfg(feature = "ffmpeg")]
    pub(crate) fn as_flag_ptr(&self) -> *const AtomicBool {
        Arc::as_ptr(&self.flag)
    }
}
