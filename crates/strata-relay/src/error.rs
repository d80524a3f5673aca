use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Startup configuration failure. Fatal: no relay can be started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid settings: {0}")]
    Parse(String),
    #[error("unsupported settings version {0}")]
    UnsupportedVersion(u32),
}

/// Why a single relay attempt ended.
///
/// Every variant is recovered by the supervisor with a retry after the
/// cooldown; the reason exists for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalReason {
    /// Cancellation was observed; the attempt wound down cleanly.
    CancelledCleanly,
    /// Source, destination context or destination transport could not be opened.
    OpenFailed,
    /// Stream information could not be probed or mirrored.
    NegotiationFailed,
    /// The container header could not be written.
    HeaderWriteFailed,
    /// Reading from the source failed.
    ReadFailed,
    /// Writing to the destination failed.
    WriteFailed,
    /// The source reached its end. Live relays are meant to run forever,
    /// so this is retried like any failure.
    SourceExhausted,
}

impl TerminalReason {
    pub fn is_failure(&self) -> bool {
        !matches!(self, TerminalReason::CancelledCleanly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::CancelledCleanly => "cancelled",
            TerminalReason::OpenFailed => "open-failed",
            TerminalReason::NegotiationFailed => "negotiation-failed",
            TerminalReason::HeaderWriteFailed => "header-write-failed",
            TerminalReason::ReadFailed => "read-failed",
            TerminalReason::WriteFailed => "write-failed",
            TerminalReason::SourceExhausted => "source-exhausted",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
