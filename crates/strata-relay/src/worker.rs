//! # Relay Worker
//!
//! Runs exactly one open → forward → close cycle for a [`RelayPair`] and
//! reports why it ended.
//!
//! ```text
//!   Opening ─► Negotiating ─► StreamMapping ─► Writing-Header ─► Forwarding
//!      │            │               │                 │               │
//!      └────────────┴───────────────┴─────────────────┴───────────────┴─► Closing
//! ```
//!
//! Handles are parked in an [`AttemptHandles`] guard as soon as they are
//! opened. Its `Drop` is the Closing step, so every exit path (early `?`
//! returns included) releases exactly what was acquired, once.

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::{RelayPair, RelaySettings};
use crate::error::TerminalReason;
use crate::media::{DataUnit, MediaBackend, MediaError, MediaSink, MediaSource};
use crate::pacing::{PacingClock, TimeBase, unit_timeline_us};

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub reason: TerminalReason,
    /// Media library diagnostic for the failure, if there was one.
    pub diagnostic: Option<String>,
    pub units_forwarded: u64,
    pub bytes_forwarded: u64,
    /// Units read from streams that have no destination counterpart.
    pub units_dropped: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct AttemptStats {
    units_forwarded: u64,
    bytes_forwarded: u64,
    units_dropped: u64,
}

/// Where units of one source stream go.
#[derive(Debug, Clone, Copy)]
struct Route {
    dest_index: usize,
    source_tb: TimeBase,
    dest_tb: TimeBase,
}

type Failure = (TerminalReason, MediaError);

fn fail(reason: TerminalReason) -> impl FnOnce(MediaError) -> Failure {
    move |err| (reason, err)
}

/// Resources held by one attempt. Dropping it is the Closing step.
struct AttemptHandles<'p, S: MediaSource, K: MediaSink> {
    pair: &'p RelayPair,
    cancel: &'p CancelToken,
    source: Option<S>,
    sink: Option<K>,
}

impl<S: MediaSource, K: MediaSink> Drop for AttemptHandles<'_, S, K> {
    fn drop(&mut self) {
        // Once cancelled, the interrupt callback aborts trailer and close I/O.
        let cancelled = self.cancel.is_cancelled();

        // Sink first so the trailer is flushed while the source is still open.
        if let Some(sink) = self.sink.take() {
            if let Err(e) = sink.close() {
                if cancelled {
                    debug!(destination = %self.pair.destination, error = %e, "failed to close destination");
                } else {
                    warn!(destination = %self.pair.destination, error = %e, "failed to close destination");
                }
            }
        }
        if let Some(source) = self.source.take() {
            if let Err(e) = source.close() {
                if cancelled {
                    debug!(source = %self.pair.source, error = %e, "failed to close source");
                } else {
                    warn!(source = %self.pair.source, error = %e, "failed to close source");
                }
            }
        }
    }
}

/// Drives one attempt for one relay pair.
pub struct RelayWorker<'a, B: MediaBackend> {
    pair: &'a RelayPair,
    backend: &'a B,
    settings: &'a RelaySettings,
    cancel: CancelToken,
}

impl<'a, B: MediaBackend> RelayWorker<'a, B> {
    pub fn new(
        pair: &'a RelayPair,
        backend: &'a B,
        settings: &'a RelaySettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            pair,
            backend,
            settings,
            cancel,
        }
    }

    /// Run one attempt to completion. Never panics on media failures and
    /// always closes whatever it opened.
    pub fn run_attempt(&self, attempt: u64) -> AttemptReport {
        info!(
            source = %self.pair.source,
            destination = %self.pair.destination,
            attempt,
            "starting relay"
        );

        let clock = PacingClock::started(self.settings.pacing.clone());
        let mut stats = AttemptStats::default();
        let mut handles = AttemptHandles {
            pair: self.pair,
            cancel: &self.cancel,
            source: None,
            sink: None,
        };

        let result = self.drive(&mut handles, &clock, &mut stats);
        drop(handles);

        let elapsed = clock.elapsed();
        let (reason, diagnostic) = match result {
            Ok(reason) => (reason, None),
            // The interrupt callback makes in-flight I/O fail once cancelled.
            Err((reason, err)) if self.cancel.is_cancelled() => {
                debug!(source = %self.pair.source, %reason, error = %err, "I/O aborted by cancellation");
                (TerminalReason::CancelledCleanly, None)
            }
            Err((reason, err)) => (reason, Some(err.to_string())),
        };

        match (&reason, &diagnostic) {
            (TerminalReason::CancelledCleanly, _) => info!(
                source = %self.pair.source,
                units = stats.units_forwarded,
                "relay cancelled"
            ),
            (_, Some(diag)) => warn!(
                source = %self.pair.source,
                destination = %self.pair.destination,
                %reason,
                error = %diag,
                "relay attempt failed"
            ),
            (_, None) => warn!(
                source = %self.pair.source,
                destination = %self.pair.destination,
                %reason,
                "relay attempt ended"
            ),
        }
        debug!(
            source = %self.pair.source,
            units = stats.units_forwarded,
            bytes = stats.bytes_forwarded,
            dropped = stats.units_dropped,
            elapsed_ms = elapsed.as_millis() as u64,
            "attempt totals"
        );

        AttemptReport {
            reason,
            diagnostic,
            units_forwarded: stats.units_forwarded,
            bytes_forwarded: stats.bytes_forwarded,
            units_dropped: stats.units_dropped,
            elapsed,
        }
    }

    fn drive(
        &self,
        handles: &mut AttemptHandles<'_, B::Source, B::Sink>,
        clock: &PacingClock,
        stats: &mut AttemptStats,
    ) -> Result<TerminalReason, Failure> {
        let pair = self.pair;

        // Opening
        let source = handles.source.insert(
            self.backend
                .open_source(&pair.source, &self.cancel)
                .map_err(fail(TerminalReason::OpenFailed))?,
        );

        // Negotiating
        let streams = source
            .probe()
            .map_err(fail(TerminalReason::NegotiationFailed))?;
        if streams.is_empty() {
            return Err((
                TerminalReason::NegotiationFailed,
                MediaError::new("probe", "source has no streams"),
            ));
        }

        // StreamMapping
        let output = &self.settings.output;
        let sink = handles.sink.insert(
            self.backend
                .open_sink(&pair.destination, &output.container)
                .map_err(fail(TerminalReason::OpenFailed))?,
        );

        let slots = streams.iter().map(|s| s.index + 1).max().unwrap_or(0);
        let mut mirrored: Vec<Option<(usize, TimeBase)>> = vec![None; slots];
        for stream in &streams {
            match sink.mirror_stream(stream) {
                Ok(dest_index) => {
                    debug!(
                        source = %pair.source,
                        index = stream.index,
                        dest_index,
                        kind = ?stream.kind,
                        codec = %stream.codec,
                        time_base = %stream.time_base,
                        "stream mirrored"
                    );
                    mirrored[stream.index] = Some((dest_index, stream.time_base));
                }
                Err(e) => warn!(
                    source = %pair.source,
                    index = stream.index,
                    kind = ?stream.kind,
                    error = %e,
                    "skipping stream that cannot be mirrored"
                ),
            }
        }
        if mirrored.iter().all(Option::is_none) {
            return Err((
                TerminalReason::NegotiationFailed,
                MediaError::new("mirror-stream", "no stream could be mirrored"),
            ));
        }

        sink.install_interrupt(self.cancel.clone());

        // Writing-Header
        if sink.needs_transport() {
            sink.open_transport(&pair.destination, &output.transport)
                .map_err(fail(TerminalReason::OpenFailed))?;
        }
        sink.write_header()
            .map_err(fail(TerminalReason::HeaderWriteFailed))?;

        let routes: Vec<Option<Route>> = mirrored
            .into_iter()
            .map(|slot| {
                slot.map(|(dest_index, source_tb)| Route {
                    dest_index,
                    source_tb,
                    dest_tb: sink.stream_time_base(dest_index).unwrap_or(source_tb),
                })
            })
            .collect();

        debug!(source = %pair.source, streams = routes.len(), "forwarding");

        // Forwarding
        let slice = clock.config().sleep_slice;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(TerminalReason::CancelledCleanly);
            }

            let mut unit = match source.read_unit() {
                Ok(Some(unit)) => unit,
                Ok(None) => return Ok(TerminalReason::SourceExhausted),
                Err(e) => return Err((TerminalReason::ReadFailed, e)),
            };

            let Some(route) = routes.get(unit.stream_index()).copied().flatten() else {
                trace!(source = %pair.source, index = unit.stream_index(), "dropping unit from unmapped stream");
                stats.units_dropped += 1;
                continue;
            };

            let position = unit_timeline_us(unit.pts(), unit.dts(), route.source_tb);
            let delay = clock.delay_now(position);
            if !delay.is_zero() && !self.cancel.sleep(delay, slice) {
                return Ok(TerminalReason::CancelledCleanly);
            }

            unit.rescale_timestamps(route.source_tb, route.dest_tb);
            unit.set_stream_index(route.dest_index);
            unit.clear_position();

            let size = unit.size() as u64;
            sink.write_unit(unit)
                .map_err(fail(TerminalReason::WriteFailed))?;
            stats.units_forwarded += 1;
            stats.bytes_forwarded += size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::PacingConfig;
    use crate::testing::{AttemptPlan, ScriptedBackend, ScriptedStream, ScriptedUnit};
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::Level;
    use tracing_subscriber::fmt::MakeWriter;

    fn pair() -> RelayPair {
        RelayPair::new("cam1.mp4", "rtmp://host/a")
    }

    fn fast_settings() -> RelaySettings {
        RelaySettings {
            pacing: PacingConfig {
                burst_allowance: Duration::from_secs(3600),
                sleep_slice: Duration::from_millis(10),
                ..PacingConfig::default()
            },
            cooldown: Duration::from_millis(10),
            stagger: Duration::from_millis(1),
            ..RelaySettings::default()
        }
    }

    fn run(backend: &ScriptedBackend, settings: &RelaySettings) -> AttemptReport {
        let pair = pair();
        RelayWorker::new(&pair, backend, settings, CancelToken::new()).run_attempt(1)
    }

    fn units(n: i64) -> Vec<ScriptedUnit> {
        (0..n).map(|i| ScriptedUnit::new(0, Some(i * 3000))).collect()
    }

    #[test]
    fn open_failure_closes_nothing() {
        let backend = ScriptedBackend::new(AttemptPlan::open_failure());
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::OpenFailed);
        assert!(report.diagnostic.unwrap().contains("open-source"));

        let log = backend.log();
        assert_eq!(log.sources_opened, 0);
        assert_eq!(log.sources_closed, 0);
        assert_eq!(log.sinks_opened, 0);
    }

    #[test]
    fn probe_failure_closes_source_once() {
        let backend = ScriptedBackend::new(AttemptPlan::probe_failure());
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::NegotiationFailed);

        let log = backend.log();
        assert_eq!(log.sources_opened, 1);
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_opened, 0);
        assert_eq!(log.sinks_closed, 0);
    }

    #[test]
    fn source_without_streams_is_negotiation_failure() {
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(vec![]).with_streams(vec![]));
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::NegotiationFailed);
        assert_eq!(backend.log().sources_closed, 1);
    }

    #[test]
    fn sink_open_failure_is_open_failed_and_releases_source() {
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(units(3)).fail_open_sink());
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::OpenFailed);

        let log = backend.log();
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_opened, 0);
    }

    #[test]
    fn transport_failure_releases_source_and_sink() {
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(units(3)).fail_transport());
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::OpenFailed);

        let log = backend.log();
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_closed, 1);
        assert_eq!(log.trailers_written, 0, "no trailer without a header");
    }

    #[test]
    fn header_failure_is_reported() {
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(units(3)).fail_header());
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::HeaderWriteFailed);
        let log = backend.log();
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_closed, 1);
    }

    #[test]
    fn transport_options_are_passed_through() {
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(units(1)));
        run(&backend, &fast_settings());
        let log = backend.log();
        assert_eq!(log.transports.len(), 1);
        assert_eq!(log.transports[0].0, "rtmp://host/a");
        assert!(log.transports[0].1.reconnect);
        assert!(log.transports[0].1.reconnect_streamed);
        assert_eq!(log.transports[0].1.reconnect_delay_max_s, 5);
        assert_eq!(log.sink_opens[0].1, "flv");
    }

    #[test]
    fn self_managed_container_skips_transport() {
        let backend =
            ScriptedBackend::new(AttemptPlan::forwarding(units(2)).without_transport());
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::SourceExhausted);
        assert!(backend.log().transports.is_empty());
        assert_eq!(report.units_forwarded, 2);
    }

    #[test]
    fn exhausted_source_forwards_everything_and_closes_once() {
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(units(5)));
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::SourceExhausted);
        assert!(report.diagnostic.is_none());
        assert_eq!(report.units_forwarded, 5);

        let log = backend.log();
        assert_eq!(log.written.len(), 5);
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_closed, 1);
        assert_eq!(log.trailers_written, 1);
        assert_eq!(log.interrupts_installed, 1);
    }

    #[test]
    fn read_failure_is_reported() {
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(units(2)).then_read_error());
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::ReadFailed);
        assert_eq!(report.units_forwarded, 2);
        assert!(report.diagnostic.unwrap().contains("read-unit"));
        assert_eq!(backend.log().sinks_closed, 1);
    }

    #[test]
    fn write_failure_stops_forwarding() {
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(units(5)).fail_write_at(2));
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::WriteFailed);
        assert_eq!(report.units_forwarded, 2);

        let log = backend.log();
        assert_eq!(log.written.len(), 2);
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_closed, 1);
    }

    #[test]
    fn timestamps_are_rescaled_and_positions_cleared() {
        let input = vec![
            ScriptedUnit::new(0, Some(0)).with_position(100),
            ScriptedUnit::new(0, Some(90_000)).with_position(200),
            ScriptedUnit::new(0, None).with_dts(Some(180_000)),
        ];
        let plan = AttemptPlan::forwarding(input)
            .with_streams(vec![ScriptedStream::video(0, TimeBase::new(1, 90_000))])
            .with_dest_time_base(TimeBase::new(1, 1000));
        let backend = ScriptedBackend::new(plan);
        run(&backend, &fast_settings());

        let written = backend.log().written;
        assert_eq!(written.len(), 3);
        assert_eq!(written[0].pts, Some(0));
        assert_eq!(written[1].pts, Some(1000));
        assert_eq!(written[2].pts, None);
        assert_eq!(written[2].dts, Some(2000));
        assert!(written.iter().all(|u| u.position.is_none()));
    }

    #[test]
    fn forwarded_timestamps_stay_non_decreasing() {
        let input: Vec<_> = (0..500)
            .map(|i| ScriptedUnit::new(0, Some(i * 1001 / 3)))
            .collect();
        let plan = AttemptPlan::forwarding(input)
            .with_streams(vec![ScriptedStream::video(0, TimeBase::new(1, 90_000))])
            .with_dest_time_base(TimeBase::new(1, 1000));
        let backend = ScriptedBackend::new(plan);
        run(&backend, &fast_settings());

        let written = backend.log().written;
        assert_eq!(written.len(), 500);
        for w in written.windows(2) {
            assert!(w[1].pts >= w[0].pts, "{:?} then {:?}", w[0].pts, w[1].pts);
        }
    }

    #[test]
    fn unmirrorable_stream_is_skipped_and_its_units_dropped() {
        let streams = vec![
            ScriptedStream::video(0, TimeBase::new(1, 1000)),
            ScriptedStream::data(1, TimeBase::new(1, 1000)).unmirrorable(),
            ScriptedStream::audio(2, TimeBase::new(1, 1000)),
        ];
        let input = vec![
            ScriptedUnit::new(0, Some(0)),
            ScriptedUnit::new(1, Some(0)),
            ScriptedUnit::new(2, Some(0)),
            ScriptedUnit::new(7, Some(0)),
        ];
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(input).with_streams(streams));
        let report = run(&backend, &fast_settings());

        assert_eq!(report.reason, TerminalReason::SourceExhausted);
        assert_eq!(report.units_forwarded, 2);
        assert_eq!(report.units_dropped, 2);

        let written = backend.log().written;
        // Destination indices are dense: source 2 lands on destination 1.
        assert_eq!(written[0].stream, 0);
        assert_eq!(written[1].stream, 1);
    }

    #[test]
    fn no_mirrorable_stream_is_negotiation_failure() {
        let streams = vec![ScriptedStream::video(0, TimeBase::new(1, 1000)).unmirrorable()];
        let backend =
            ScriptedBackend::new(AttemptPlan::forwarding(units(2)).with_streams(streams));
        let report = run(&backend, &fast_settings());
        assert_eq!(report.reason, TerminalReason::NegotiationFailed);
        let log = backend.log();
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_closed, 1);
    }

    #[test]
    fn cancellation_between_units_ends_cleanly() {
        let cancel = CancelToken::new();
        let plan = AttemptPlan::live(TimeBase::new(1, 1000), 1).cancel_after_reads(10, cancel.clone());
        let backend = ScriptedBackend::new(plan);
        let pair = pair();
        let settings = fast_settings();
        let report = RelayWorker::new(&pair, &backend, &settings, cancel).run_attempt(1);

        assert_eq!(report.reason, TerminalReason::CancelledCleanly);
        assert!(report.diagnostic.is_none());
        let log = backend.log();
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_closed, 1);
        assert_eq!(log.trailers_written, 1);
    }

    #[test]
    fn pacing_holds_units_to_the_source_timeline() {
        // 10 units, 20 ms apart, no burst allowance: about 180 ms of pacing.
        let input: Vec<_> = (0..10).map(|i| ScriptedUnit::new(0, Some(i * 20))).collect();
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(input));
        let settings = RelaySettings {
            pacing: PacingConfig {
                burst_allowance: Duration::ZERO,
                sleep_slice: Duration::from_millis(5),
                ..PacingConfig::default()
            },
            ..fast_settings()
        };
        let report = run(&backend, &settings);
        assert_eq!(report.units_forwarded, 10);
        assert!(
            report.elapsed >= Duration::from_millis(170),
            "forwarded too fast: {:?}",
            report.elapsed
        );
    }

    #[test]
    fn cancel_during_pacing_sleep_is_prompt() {
        let cancel = CancelToken::new();
        // A unit 4 s ahead of the clock with no burst allowance.
        let input = vec![ScriptedUnit::new(0, Some(4000))];
        let backend = ScriptedBackend::new(AttemptPlan::forwarding(input));
        let settings = RelaySettings {
            pacing: PacingConfig {
                burst_allowance: Duration::ZERO,
                sleep_slice: Duration::from_millis(100),
                ..PacingConfig::default()
            },
            ..fast_settings()
        };

        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });

        let pair = pair();
        let started = std::time::Instant::now();
        let report = RelayWorker::new(&pair, &backend, &settings, cancel).run_attempt(1);
        canceller.join().unwrap();

        assert_eq!(report.reason, TerminalReason::CancelledCleanly);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(backend.log().written.is_empty(), "pending unit must not be written");
    }

    /// Collects formatted log output for level assertions.
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn run_logged(plan: AttemptPlan, cancel: CancelToken) -> (AttemptReport, String) {
        let backend = ScriptedBackend::new(plan);
        let pair = pair();
        let settings = fast_settings();
        let captured = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .finish();
        let report = tracing::subscriber::with_default(subscriber, || {
            RelayWorker::new(&pair, &backend, &settings, cancel).run_attempt(1)
        });
        (report, captured.text())
    }

    fn close_failure_lines(log: &str) -> Vec<&str> {
        log.lines()
            .filter(|l| l.contains("failed to close destination"))
            .collect()
    }

    #[test]
    fn close_failure_after_cancellation_is_not_a_warning() {
        let cancel = CancelToken::new();
        let plan = AttemptPlan::live(TimeBase::new(1, 1000), 1)
            .cancel_after_reads(3, cancel.clone())
            .fail_close();
        let (report, log) = run_logged(plan, cancel);

        assert_eq!(report.reason, TerminalReason::CancelledCleanly);
        let lines = close_failure_lines(&log);
        assert_eq!(lines.len(), 1, "{log}");
        assert!(lines[0].contains("DEBUG"), "{}", lines[0]);
        assert!(!log.contains("WARN"), "{log}");
    }

    #[test]
    fn close_failure_without_cancellation_is_a_warning() {
        let plan = AttemptPlan::forwarding(units(2)).fail_close();
        let (report, log) = run_logged(plan, CancelToken::new());

        assert_eq!(report.reason, TerminalReason::SourceExhausted, "close failure must not change the reason");
        let lines = close_failure_lines(&log);
        assert_eq!(lines.len(), 1, "{log}");
        assert!(lines[0].contains("WARN"), "{}", lines[0]);
    }
}
