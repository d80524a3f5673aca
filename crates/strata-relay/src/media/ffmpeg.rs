//! FFmpeg (libavformat) implementation of the media contract.
//!
//! Talks to libavformat through the raw `ffmpeg_next::ffi` bindings so every
//! context is owned by exactly one Rust value and released exactly once,
//! either through `close` or, as a fallback, on drop.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use ffmpeg_next::ffi;
use tracing::{debug, trace};

use super::{
    DataUnit, MediaBackend, MediaError, MediaKind, MediaSink, MediaSource, StreamInfo,
    TransportOptions,
};
use crate::cancel::CancelToken;
use crate::pacing::TimeBase;

/// Human-readable text for an FFmpeg error code.
pub fn error_string(errnum: c_int) -> String {
    let mut buf = [0 as c_char; 256];
    unsafe {
        ffi::av_strerror(errnum, buf.as_mut_ptr(), buf.len());
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

fn check(op: &'static str, ret: c_int) -> Result<c_int, MediaError> {
    if ret < 0 {
        Err(MediaError::new(op, error_string(ret)))
    } else {
        Ok(ret)
    }
}

fn c_string(op: &'static str, s: &str) -> Result<CString, MediaError> {
    CString::new(s).map_err(|_| MediaError::new(op, format!("address contains NUL: {s:?}")))
}

fn to_rational(tb: TimeBase) -> ffi::AVRational {
    ffi::AVRational {
        num: tb.num,
        den: tb.den,
    }
}

fn from_rational(r: ffi::AVRational) -> TimeBase {
    TimeBase::new(r.num, r.den)
}

fn media_kind(t: ffi::AVMediaType) -> MediaKind {
    match t {
        ffi::AVMediaType::AVMEDIA_TYPE_VIDEO => MediaKind::Video,
        ffi::AVMediaType::AVMEDIA_TYPE_AUDIO => MediaKind::Audio,
        ffi::AVMediaType::AVMEDIA_TYPE_SUBTITLE => MediaKind::Subtitle,
        ffi::AVMediaType::AVMEDIA_TYPE_DATA => MediaKind::Data,
        _ => MediaKind::Unknown,
    }
}

/// Polled by libavformat during blocking I/O. Non-zero aborts the call.
unsafe extern "C" fn interrupt_requested(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    let flag = unsafe { &*(opaque as *const AtomicBool) };
    flag.load(Ordering::Acquire) as c_int
}

/// Process-wide libavformat setup: library and network initialisation.
pub struct FfmpegBackend {
    _priv: (),
}

impl FfmpegBackend {
    pub fn new() -> Result<Self, MediaError> {
        ffmpeg_next::init().map_err(|e| MediaError::new("init", e.to_string()))?;
        check("network-init", unsafe { ffi::avformat_network_init() })?;
        debug!("libavformat initialised");
        Ok(Self { _priv: () })
    }
}

impl Drop for FfmpegBackend {
    fn drop(&mut self) {
        unsafe {
            ffi::avformat_network_deinit();
        }
    }
}

impl MediaBackend for FfmpegBackend {
    type Params = CodecParams;
    type Unit = FfmpegUnit;
    type Source = FfmpegSource;
    type Sink = FfmpegSink;

    fn open_source(
        &self,
        address: &str,
        cancel: &CancelToken,
    ) -> Result<FfmpegSource, MediaError> {
        let url = c_string("open-source", address)?;
        let mut ctx = unsafe { ffi::avformat_alloc_context() };
        if ctx.is_null() {
            return Err(MediaError::new("open-source", "could not allocate input context"));
        }
        // Set before opening so the connect and every later read can be aborted.
        unsafe {
            (*ctx).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_requested),
                opaque: cancel.as_flag_ptr() as *mut c_void,
            };
        }
        // On failure avformat_open_input frees the context itself.
        check("open-source", unsafe {
            ffi::avformat_open_input(&mut ctx, url.as_ptr(), ptr::null(), ptr::null_mut())
        })?;
        Ok(FfmpegSource {
            ctx,
            _interrupt: cancel.clone(),
        })
    }

    fn open_sink(&self, address: &str, container: &str) -> Result<FfmpegSink, MediaError> {
        let url = c_string("open-sink", address)?;
        let format = c_string("open-sink", container)?;
        let mut ctx: *mut ffi::AVFormatContext = ptr::null_mut();
        check("open-sink", unsafe {
            ffi::avformat_alloc_output_context2(
                &mut ctx,
                ptr::null(),
                format.as_ptr(),
                url.as_ptr(),
            )
        })?;
        if ctx.is_null() {
            return Err(MediaError::new("open-sink", "could not allocate output context"));
        }
        Ok(FfmpegSink {
            ctx,
            header_written: false,
            transport_open: false,
            interrupt: None,
        })
    }
}

/// Owned copy of a source stream's codec parameters.
pub struct CodecParams {
    ptr: *mut ffi::AVCodecParameters,
}

impl CodecParams {
    fn copy_from(src: *const ffi::AVCodecParameters) -> Result<Self, MediaError> {
        let ptr = unsafe { ffi::avcodec_parameters_alloc() };
        if ptr.is_null() {
            return Err(MediaError::new("probe", "out of memory"));
        }
        let params = Self { ptr };
        check("probe", unsafe { ffi::avcodec_parameters_copy(params.ptr, src) })?;
        Ok(params)
    }
}

impl Drop for CodecParams {
    fn drop(&mut self) {
        unsafe { ffi::avcodec_parameters_free(&mut self.ptr) };
    }
}

/// One demuxed packet.
pub struct FfmpegUnit {
    packet: *mut ffi::AVPacket,
}

impl Drop for FfmpegUnit {
    fn drop(&mut self) {
        unsafe { ffi::av_packet_free(&mut self.packet) };
    }
}

fn known(ts: i64) -> Option<i64> {
    (ts != ffi::AV_NOPTS_VALUE).then_some(ts)
}

impl DataUnit for FfmpegUnit {
    fn stream_index(&self) -> usize {
        unsafe { (*self.packet).stream_index as usize }
    }

    fn set_stream_index(&mut self, index: usize) {
        unsafe { (*self.packet).stream_index = index as c_int };
    }

    fn pts(&self) -> Option<i64> {
        known(unsafe { (*self.packet).pts })
    }

    fn dts(&self) -> Option<i64> {
        known(unsafe { (*self.packet).dts })
    }

    fn rescale_timestamps(&mut self, from: TimeBase, to: TimeBase) {
        unsafe { ffi::av_packet_rescale_ts(self.packet, to_rational(from), to_rational(to)) };
    }

    fn clear_position(&mut self) {
        unsafe { (*self.packet).pos = -1 };
    }

    fn size(&self) -> usize {
        unsafe { (*self.packet).size.max(0) as usize }
    }
}

/// An opened input format context.
pub struct FfmpegSource {
    ctx: *mut ffi::AVFormatContext,
    /// Keeps the flag behind the interrupt callback's opaque pointer alive.
    _interrupt: CancelToken,
}

impl FfmpegSource {
    fn release(&mut self) {
        if !self.ctx.is_null() {
            unsafe { ffi::avformat_close_input(&mut self.ctx) };
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

impl MediaSource for FfmpegSource {
    type Params = CodecParams;
    type Unit = FfmpegUnit;

    fn probe(&mut self) -> Result<Vec<StreamInfo<CodecParams>>, MediaError> {
        check("probe", unsafe {
            ffi::avformat_find_stream_info(self.ctx, ptr::null_mut())
        })?;

        let count = unsafe { (*self.ctx).nb_streams } as usize;
        let mut streams = Vec::with_capacity(count);
        for index in 0..count {
            let (time_base, codecpar) = unsafe {
                let stream = *(*self.ctx).streams.add(index);
                ((*stream).time_base, (*stream).codecpar)
            };
            let (kind, codec) = unsafe {
                let name = ffi::avcodec_get_name((*codecpar).codec_id);
                let codec = if name.is_null() {
                    String::from("unknown")
                } else {
                    CStr::from_ptr(name).to_string_lossy().into_owned()
                };
                (media_kind((*codecpar).codec_type), codec)
            };
            streams.push(StreamInfo {
                index,
                kind,
                time_base: from_rational(time_base),
                codec,
                params: CodecParams::copy_from(codecpar)?,
            });
        }
        Ok(streams)
    }

    fn read_unit(&mut self) -> Result<Option<FfmpegUnit>, MediaError> {
        let packet = unsafe { ffi::av_packet_alloc() };
        if packet.is_null() {
            return Err(MediaError::new("read-unit", "out of memory"));
        }
        let unit = FfmpegUnit { packet };
        match unsafe { ffi::av_read_frame(self.ctx, unit.packet) } {
            ret if ret == ffi::AVERROR_EOF => Ok(None),
            ret if ret < 0 => Err(MediaError::new("read-unit", error_string(ret))),
            _ => Ok(Some(unit)),
        }
    }

    fn close(mut self) -> Result<(), MediaError> {
        self.release();
        Ok(())
    }
}

/// An output format context plus, when the container needs one, its
/// transport.
pub struct FfmpegSink {
    ctx: *mut ffi::AVFormatContext,
    header_written: bool,
    transport_open: bool,
    /// Keeps the flag behind the interrupt callback's opaque pointer alive.
    interrupt: Option<CancelToken>,
}

impl FfmpegSink {
    fn release(&mut self) -> Result<(), MediaError> {
        if self.ctx.is_null() {
            return Ok(());
        }
        let mut result = Ok(());
        unsafe {
            if self.header_written {
                result = check("write-trailer", ffi::av_write_trailer(self.ctx)).map(|_| ());
                self.header_written = false;
            }
            if self.transport_open {
                ffi::avio_closep(&mut (*self.ctx).pb);
                self.transport_open = false;
            }
            ffi::avformat_free_context(self.ctx);
        }
        self.ctx = ptr::null_mut();
        result
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl MediaSink for FfmpegSink {
    type Params = CodecParams;
    type Unit = FfmpegUnit;

    fn mirror_stream(&mut self, stream: &StreamInfo<CodecParams>) -> Result<usize, MediaError> {
        unsafe {
            // 0 means the muxer rejects the codec. Muxers without a codec
            // table answer with a negative "unknown", which is let through.
            let supported = ffi::avformat_query_codec(
                (*self.ctx).oformat,
                (*stream.params.ptr).codec_id,
                ffi::FF_COMPLIANCE_NORMAL as c_int,
            );
            if supported == 0 {
                return Err(MediaError::new(
                    "mirror-stream",
                    format!("container cannot carry {} stream", stream.codec),
                ));
            }

            let out = ffi::avformat_new_stream(self.ctx, ptr::null());
            if out.is_null() {
                return Err(MediaError::new("mirror-stream", "could not allocate stream"));
            }
            check(
                "mirror-stream",
                ffi::avcodec_parameters_copy((*out).codecpar, stream.params.ptr),
            )?;
            // Let the destination container pick its own tag.
            (*(*out).codecpar).codec_tag = 0;
            (*out).time_base = to_rational(stream.time_base);
            Ok((*out).index as usize)
        }
    }

    fn install_interrupt(&mut self, cancel: CancelToken) {
        unsafe {
            (*self.ctx).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_requested),
                opaque: cancel.as_flag_ptr() as *mut c_void,
            };
        }
        self.interrupt = Some(cancel);
    }

    fn needs_transport(&self) -> bool {
        let flags = unsafe { (*(*self.ctx).oformat).flags };
        flags & ffi::AVFMT_NOFILE as c_int == 0
    }

    fn open_transport(
        &mut self,
        address: &str,
        options: &TransportOptions,
    ) -> Result<(), MediaError> {
        let url = c_string("open-transport", address)?;
        let mut dict: *mut ffi::AVDictionary = ptr::null_mut();
        for (key, value) in options.to_pairs() {
            let key = c_string("open-transport", key)?;
            let value = c_string("open-transport", &value)?;
            unsafe { ffi::av_dict_set(&mut dict, key.as_ptr(), value.as_ptr(), 0) };
        }

        let ret = unsafe {
            ffi::avio_open2(
                &mut (*self.ctx).pb,
                url.as_ptr(),
                ffi::AVIO_FLAG_WRITE as c_int,
                &(*self.ctx).interrupt_callback,
                &mut dict,
            )
        };
        if !dict.is_null() {
            trace!(destination = %address, "transport ignored some options");
            unsafe { ffi::av_dict_free(&mut dict) };
        }
        check("open-transport", ret)?;
        self.transport_open = true;
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), MediaError> {
        check("write-header", unsafe {
            ffi::avformat_write_header(self.ctx, ptr::null_mut())
        })?;
        self.header_written = true;
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Option<TimeBase> {
        unsafe {
            if index >= (*self.ctx).nb_streams as usize {
                return None;
            }
            let stream = *(*self.ctx).streams.add(index);
            Some(from_rational((*stream).time_base))
        }
    }

    fn write_unit(&mut self, unit: FfmpegUnit) -> Result<(), MediaError> {
        // The muxer takes the payload reference; `unit` frees the shell on drop.
        check("write-unit", unsafe {
            ffi::av_interleaved_write_frame(self.ctx, unit.packet)
        })
        .map(|_| ())
    }

    fn close(mut self) -> Result<(), MediaError> {
        self.release()
    }
}
