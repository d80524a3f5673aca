//! Scripted in-memory media backend.
//!
//! [`ScriptedBackend`] implements the media contract without a media
//! library. Each `open_source` call consumes the next [`AttemptPlan`] queued
//! for that source address (falling back to a default plan), and everything
//! the relay does to the handles is recorded in a [`BackendLog`]:
//! opens, closes, transport options, written units, trailers.
//!
//! The sink side of an attempt picks up the plan of the source opened on the
//! same thread, which matches how relays run: one attempt, one thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::cancel::CancelToken;
use crate::media::{
    DataUnit, MediaBackend, MediaError, MediaKind, MediaSink, MediaSource, StreamInfo,
    TransportOptions,
};
use crate::pacing::{TimeBase, rescale};

/// A unit produced by a scripted source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedUnit {
    pub stream: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub position: Option<i64>,
    pub payload: Vec<u8>,
}

impl ScriptedUnit {
    pub fn new(stream: usize, pts: Option<i64>) -> Self {
        Self {
            stream,
            pts,
            dts: pts,
            position: None,
            payload: vec![0; 188],
        }
    }

    pub fn with_dts(mut self, dts: Option<i64>) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }
}

impl DataUnit for ScriptedUnit {
    fn stream_index(&self) -> usize {
        self.stream
    }

    fn set_stream_index(&mut self, index: usize) {
        self.stream = index;
    }

    fn pts(&self) -> Option<i64> {
        self.pts
    }

    fn dts(&self) -> Option<i64> {
        self.dts
    }

    fn rescale_timestamps(&mut self, from: TimeBase, to: TimeBase) {
        self.pts = self.pts.map(|ts| rescale(ts, from, to));
        self.dts = self.dts.map(|ts| rescale(ts, from, to));
    }

    fn clear_position(&mut self) {
        self.position = None;
    }

    fn size(&self) -> usize {
        self.payload.len()
    }
}

/// A stream exposed by a scripted source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedStream {
    pub index: usize,
    pub kind: MediaKind,
    pub time_base: TimeBase,
    /// Whether the sink accepts this stream.
    pub mirrorable: bool,
}

impl ScriptedStream {
    fn new(index: usize, kind: MediaKind, time_base: TimeBase) -> Self {
        Self {
            index,
            kind,
            time_base,
            mirrorable: true,
        }
    }

    pub fn video(index: usize, time_base: TimeBase) -> Self {
        Self::new(index, MediaKind::Video, time_base)
    }

    pub fn audio(index: usize, time_base: TimeBase) -> Self {
        Self::new(index, MediaKind::Audio, time_base)
    }

    pub fn data(index: usize, time_base: TimeBase) -> Self {
        Self::new(index, MediaKind::Data, time_base)
    }

    pub fn unmirrorable(mut self) -> Self {
        self.mirrorable = false;
        self
    }
}

/// What a source does once its scripted units run out.
#[derive(Debug, Clone)]
pub enum PlanEnd {
    /// Clean end of stream.
    Exhausted,
    /// A read error.
    ReadError,
    /// Keep producing stream-0 units, `interval` apart, forever.
    Live { interval: i64 },
}

/// Behaviour of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptPlan {
    pub fail_open_source: bool,
    pub fail_probe: bool,
    pub streams: Vec<ScriptedStream>,
    pub fail_open_sink: bool,
    pub needs_transport: bool,
    pub fail_transport: bool,
    pub fail_header: bool,
    /// Destination time-base for every stream; `None` keeps the source's.
    pub dest_time_base: Option<TimeBase>,
    pub units: Vec<ScriptedUnit>,
    pub end: PlanEnd,
    /// Fail the write of the unit with this zero-based index.
    pub fail_write_at: Option<usize>,
    /// Closing the destination reports an error (trailer write aborted).
    pub fail_close: bool,
    /// Cancel the given token once this many units were read.
    pub cancel_after_reads: Option<(usize, CancelToken)>,
    pub panic_on_open: bool,
}

impl AttemptPlan {
    /// One 1/1000 video stream carrying `units`, then a clean end of stream.
    pub fn forwarding(units: Vec<ScriptedUnit>) -> Self {
        Self {
            fail_open_source: false,
            fail_probe: false,
            streams: vec![ScriptedStream::video(0, TimeBase::new(1, 1000))],
            fail_open_sink: false,
            needs_transport: true,
            fail_transport: false,
            fail_header: false,
            dest_time_base: None,
            units,
            end: PlanEnd::Exhausted,
            fail_write_at: None,
            fail_close: false,
            cancel_after_reads: None,
            panic_on_open: false,
        }
    }

    /// An endless source on one stream in `time_base`.
    pub fn live(time_base: TimeBase, interval: i64) -> Self {
        let mut plan = Self::forwarding(Vec::new());
        plan.streams = vec![ScriptedStream::video(0, time_base)];
        plan.end = PlanEnd::Live { interval };
        plan
    }

    pub fn open_failure() -> Self {
        let mut plan = Self::forwarding(Vec::new());
        plan.fail_open_source = true;
        plan
    }

    pub fn probe_failure() -> Self {
        let mut plan = Self::forwarding(Vec::new());
        plan.fail_probe = true;
        plan
    }

    pub fn panicking() -> Self {
        let mut plan = Self::forwarding(Vec::new());
        plan.panic_on_open = true;
        plan
    }

    pub fn with_streams(mut self, streams: Vec<ScriptedStream>) -> Self {
        self.streams = streams;
        self
    }

    pub fn with_dest_time_base(mut self, time_base: TimeBase) -> Self {
        self.dest_time_base = Some(time_base);
        self
    }

    pub fn fail_open_sink(mut self) -> Self {
        self.fail_open_sink = true;
        self
    }

    pub fn without_transport(mut self) -> Self {
        self.needs_transport = false;
        self
    }

    pub fn fail_transport(mut self) -> Self {
        self.fail_transport = true;
        self
    }

    pub fn fail_header(mut self) -> Self {
        self.fail_header = true;
        self
    }

    pub fn then_read_error(mut self) -> Self {
        self.end = PlanEnd::ReadError;
        self
    }

    pub fn fail_write_at(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn cancel_after_reads(mut self, reads: usize, cancel: CancelToken) -> Self {
        self.cancel_after_reads = Some((reads, cancel));
        self
    }
}

/// A unit as it reached the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenUnit {
    pub destination: String,
    pub stream: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub position: Option<i64>,
}

/// Everything the relay did to the scripted handles.
#[derive(Debug, Clone, Default)]
pub struct BackendLog {
    /// Every `open_source` call, successful or not, in call order.
    pub source_opens: Vec<String>,
    pub sources_opened: usize,
    pub sources_closed: usize,
    /// Every successful `open_sink` call as `(address, container)`.
    pub sink_opens: Vec<(String, String)>,
    pub sinks_opened: usize,
    pub sinks_closed: usize,
    pub transports: Vec<(String, TransportOptions)>,
    pub interrupts_installed: usize,
    pub trailers_written: usize,
    pub written: Vec<WrittenUnit>,
}

type SharedLog = Arc<Mutex<BackendLog>>;

fn lock(log: &SharedLog) -> MutexGuard<'_, BackendLog> {
    log.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory [`MediaBackend`] driven by [`AttemptPlan`]s.
pub struct ScriptedBackend {
    default_plan: AttemptPlan,
    queued: Mutex<HashMap<String, VecDeque<AttemptPlan>>>,
    active: Mutex<HashMap<ThreadId, AttemptPlan>>,
    log: SharedLog,
}

impl ScriptedBackend {
    /// A backend that runs `default_plan` for every attempt without a queued plan.
    pub fn new(default_plan: AttemptPlan) -> Self {
        Self {
            default_plan,
            queued: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            log: SharedLog::default(),
        }
    }

    /// Queue `plan` for the next attempt on `source`.
    pub fn push_plan(&self, source: &str, plan: AttemptPlan) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(source.to_string())
            .or_default()
            .push_back(plan);
    }

    /// Snapshot of the log.
    pub fn log(&self) -> BackendLog {
        lock(&self.log).clone()
    }

    fn next_plan(&self, source: &str) -> AttemptPlan {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(source)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_plan.clone())
    }
}

impl MediaBackend for ScriptedBackend {
    type Params = ScriptedStream;
    type Unit = ScriptedUnit;
    type Source = ScriptedSource;
    type Sink = ScriptedSink;

    fn open_source(
        &self,
        address: &str,
        cancel: &CancelToken,
    ) -> Result<ScriptedSource, MediaError> {
        let plan = self.next_plan(address);
        lock(&self.log).source_opens.push(address.to_string());

        if plan.panic_on_open {
            panic!("scripted panic opening {address}");
        }
        if plan.fail_open_source {
            return Err(MediaError::new("open-source", "No such file or directory"));
        }

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(thread::current().id(), plan.clone());
        lock(&self.log).sources_opened += 1;

        Ok(ScriptedSource {
            units: plan.units.clone().into(),
            plan,
            reads: 0,
            next_live_ts: 0,
            cancel: cancel.clone(),
            log: self.log.clone(),
        })
    }

    fn open_sink(&self, address: &str, container: &str) -> Result<ScriptedSink, MediaError> {
        let plan = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&thread::current().id())
            .cloned()
            .unwrap_or_else(|| self.default_plan.clone());

        if plan.fail_open_sink {
            return Err(MediaError::new("open-sink", "Protocol not found"));
        }

        let mut log = lock(&self.log);
        log.sinks_opened += 1;
        log.sink_opens
            .push((address.to_string(), container.to_string()));
        drop(log);

        Ok(ScriptedSink {
            destination: address.to_string(),
            plan,
            streams: Vec::new(),
            header_written: false,
            writes: 0,
            cancel: None,
            log: self.log.clone(),
        })
    }
}

pub struct ScriptedSource {
    plan: AttemptPlan,
    units: VecDeque<ScriptedUnit>,
    reads: usize,
    next_live_ts: i64,
    cancel: CancelToken,
    log: SharedLog,
}

impl MediaSource for ScriptedSource {
    type Params = ScriptedStream;
    type Unit = ScriptedUnit;

    fn probe(&mut self) -> Result<Vec<StreamInfo<ScriptedStream>>, MediaError> {
        if self.plan.fail_probe {
            return Err(MediaError::new("probe", "Invalid data found when processing input"));
        }
        Ok(self
            .plan
            .streams
            .iter()
            .map(|s| StreamInfo {
                index: s.index,
                kind: s.kind,
                time_base: s.time_base,
                codec: format!("{:?}", s.kind).to_lowercase(),
                params: s.clone(),
            })
            .collect())
    }

    fn read_unit(&mut self) -> Result<Option<ScriptedUnit>, MediaError> {
        if self.cancel.is_cancelled() {
            return Err(MediaError::new("read-unit", "Immediate exit requested"));
        }
        let unit = match self.units.pop_front() {
            Some(unit) => Some(unit),
            None => match self.plan.end {
                PlanEnd::Exhausted => return Ok(None),
                PlanEnd::ReadError => {
                    return Err(MediaError::new("read-unit", "Input/output error"));
                }
                PlanEnd::Live { interval } => {
                    let ts = self.next_live_ts;
                    self.next_live_ts += interval;
                    Some(ScriptedUnit::new(0, Some(ts)))
                }
            },
        };

        self.reads += 1;
        if let Some((after, cancel)) = &self.plan.cancel_after_reads {
            if self.reads >= *after {
                cancel.cancel();
            }
        }
        Ok(unit)
    }

    fn close(self) -> Result<(), MediaError> {
        lock(&self.log).sources_closed += 1;
        Ok(())
    }
}

pub struct ScriptedSink {
    destination: String,
    plan: AttemptPlan,
    streams: Vec<TimeBase>,
    header_written: bool,
    writes: usize,
    cancel: Option<CancelToken>,
    log: SharedLog,
}

impl MediaSink for ScriptedSink {
    type Params = ScriptedStream;
    type Unit = ScriptedUnit;

    fn mirror_stream(&mut self, stream: &StreamInfo<ScriptedStream>) -> Result<usize, MediaError> {
        if !stream.params.mirrorable {
            return Err(MediaError::new("mirror-stream", "Operation not permitted"));
        }
        self.streams
            .push(self.plan.dest_time_base.unwrap_or(stream.time_base));
        Ok(self.streams.len() - 1)
    }

    fn install_interrupt(&mut self, cancel: CancelToken) {
        self.cancel = Some(cancel);
        lock(&self.log).interrupts_installed += 1;
    }

    fn needs_transport(&self) -> bool {
        self.plan.needs_transport
    }

    fn open_transport(
        &mut self,
        address: &str,
        options: &TransportOptions,
    ) -> Result<(), MediaError> {
        lock(&self.log)
            .transports
            .push((address.to_string(), options.clone()));
        if self.plan.fail_transport {
            return Err(MediaError::new("open-transport", "Connection refused"));
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), MediaError> {
        if self.plan.fail_header {
            return Err(MediaError::new("write-header", "Broken pipe"));
        }
        self.header_written = true;
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Option<TimeBase> {
        self.streams.get(index).copied()
    }

    fn write_unit(&mut self, unit: ScriptedUnit) -> Result<(), MediaError> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(MediaError::new("write-unit", "Immediate exit requested"));
        }
        if self.plan.fail_write_at == Some(self.writes) {
            return Err(MediaError::new("write-unit", "Broken pipe"));
        }
        self.writes += 1;
        lock(&self.log).written.push(WrittenUnit {
            destination: self.destination.clone(),
            stream: unit.stream,
            pts: unit.pts,
            dts: unit.dts,
            position: unit.position,
        });
        Ok(())
    }

    fn close(self) -> Result<(), MediaError> {
        let mut log = lock(&self.log);
        log.sinks_closed += 1;
        if self.plan.fail_close {
            return Err(MediaError::new("write-trailer", "Immediate exit requested"));
        }
        if self.header_written {
            log.trailers_written += 1;
        }
        Ok(())
    }
}
