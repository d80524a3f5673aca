//! Contract with the media container/transport library.
//!
//! The relay never demuxes, muxes or touches codecs itself. It drives a
//! backend through the operations below and reacts to their outcomes:
//!
//! ```text
//!   MediaBackend::open_source(cancel) ─► MediaSource::probe ─► read_unit … close
//!   MediaBackend::open_sink           ─► MediaSink::mirror_stream
//!                                         install_interrupt
//!                                         open_transport (when needs_transport)
//!                                         write_header ─► write_unit … close
//! ```
//!
//! Handles are owned values. `close` consumes them, so a handle cannot be
//! closed twice or used after it was closed.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::pacing::TimeBase;

/// Failure reported by the media library, with its diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op}: {message}")]
pub struct MediaError {
    /// The contract operation that failed (`open-source`, `write-unit`, …).
    pub op: &'static str,
    pub message: String,
}

impl MediaError {
    pub fn new(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }
}

/// Broad stream category, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Unknown,
}

/// A negotiated source stream.
///
/// `params` holds the backend's codec parameters, copied verbatim onto the
/// mirrored destination stream.
#[derive(Debug, Clone)]
pub struct StreamInfo<P> {
    pub index: usize,
    pub kind: MediaKind,
    pub time_base: TimeBase,
    pub codec: String,
    pub params: P,
}

/// Options passed through to the destination transport. The relay does not
/// implement reconnection itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub reconnect: bool,
    /// Also reconnect on streamed (non-seekable, live) transports.
    pub reconnect_streamed: bool,
    pub reconnect_delay_max_s: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_streamed: true,
            reconnect_delay_max_s: 5,
        }
    }
}

impl TransportOptions {
    /// Key/value form understood by the transport layer.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        vec![
            ("reconnect", flag(self.reconnect)),
            ("reconnect_streamed", flag(self.reconnect_streamed)),
            ("reconnect_delay_max", self.reconnect_delay_max_s.to_string()),
        ]
    }
}

/// One timestamped chunk of media read from a source.
pub trait DataUnit {
    fn stream_index(&self) -> usize;
    fn set_stream_index(&mut self, index: usize);
    fn pts(&self) -> Option<i64>;
    fn dts(&self) -> Option<i64>;
    /// Move every timestamp of the unit from `from` units to `to` units.
    fn rescale_timestamps(&mut self, from: TimeBase, to: TimeBase);
    /// Invalidate the byte position marker; it means nothing in another container.
    fn clear_position(&mut self);
    /// Payload size in bytes.
    fn size(&self) -> usize;
}

/// An open, exclusively owned input.
pub trait MediaSource {
    type Params;
    type Unit: DataUnit;

    /// Probe stream information.
    fn probe(&mut self) -> Result<Vec<StreamInfo<Self::Params>>, MediaError>;

    /// Read the next unit. `Ok(None)` is a clean end of stream.
    fn read_unit(&mut self) -> Result<Option<Self::Unit>, MediaError>;

    fn close(self) -> Result<(), MediaError>;
}

/// An open, exclusively owned output.
pub trait MediaSink {
    type Params;
    type Unit: DataUnit;

    /// Create a destination stream mirroring `stream` and return its index.
    fn mirror_stream(&mut self, stream: &StreamInfo<Self::Params>) -> Result<usize, MediaError>;

    /// Let blocking I/O inside the library abort once `cancel` is set.
    fn install_interrupt(&mut self, cancel: CancelToken);

    /// Whether the container needs a transport opened by the caller.
    fn needs_transport(&self) -> bool;

    fn open_transport(&mut self, address: &str, options: &TransportOptions)
    -> Result<(), MediaError>;

    fn write_header(&mut self) -> Result<(), MediaError>;

    /// Time-base of a destination stream. Only final after `write_header`.
    fn stream_time_base(&self, index: usize) -> Option<TimeBase>;

    /// Write one unit. The unit is consumed whether or not the write succeeds.
    fn write_unit(&mut self, unit: Self::Unit) -> Result<(), MediaError>;

    /// Finalize (trailer, if the header was written), close the transport
    /// and free the context.
    fn close(self) -> Result<(), MediaError>;
}

/// Factory for source and destination handles.
pub trait MediaBackend: Send + Sync {
    type Params;
    type Unit: DataUnit;
    type Source: MediaSource<Params = Self::Params, Unit = Self::Unit>;
    type Sink: MediaSink<Params = Self::Params, Unit = Self::Unit>;

    /// Open a source. Blocking I/O inside the library, during the open and
    /// every later read, aborts once `cancel` is set.
    fn open_source(&self, address: &str, cancel: &CancelToken)
    -> Result<Self::Source, MediaError>;

    fn open_sink(&self, address: &str, container: &str) -> Result<Self::Sink, MediaError>;
}
