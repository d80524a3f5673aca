//! End-to-end relay lifecycle against the scripted backend: pair file in,
//! staggered fleet start, forwarding, cancellation, join.

use std::thread;
use std::time::{Duration, Instant};

use strata_relay::config::parse_pairs;
use strata_relay::testing::{AttemptPlan, ScriptedBackend};
use strata_relay::{
    CancelToken, Fleet, FleetReport, PacingConfig, RelayOutcome, RelaySettings, TerminalReason,
    TimeBase,
};

const PAIRS: &str = "\
cam1.mp4, rtmp://host/a
this line has no separator

cam2.mp4,rtmp://host/b
 , rtmp://host/orphan
cam3.ts ,  srt://host:9000?streamid=x,y
";

fn settings() -> RelaySettings {
    RelaySettings {
        // No burst allowance: live sources are paced from the first unit.
        pacing: PacingConfig {
            burst_allowance: Duration::ZERO,
            sleep_slice: Duration::from_millis(5),
            ..PacingConfig::default()
        },
        cooldown: Duration::from_millis(20),
        stagger: Duration::from_millis(10),
        ..RelaySettings::default()
    }
}

fn run_for(backend: &ScriptedBackend, settings: &RelaySettings, run: Duration) -> FleetReport {
    let pairs = parse_pairs(PAIRS);
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(run);
        remote.cancel();
    });
    let report = Fleet::new(backend, settings, cancel).run(&pairs);
    canceller.join().unwrap();
    report
}

#[test]
fn one_relay_per_well_formed_line_in_file_order() {
    let backend = ScriptedBackend::new(AttemptPlan::live(TimeBase::new(1, 1000), 10));
    let report = run_for(&backend, &settings(), Duration::from_millis(150));

    let sources: Vec<_> = report.relays.iter().map(|r| r.pair.source.as_str()).collect();
    assert_eq!(sources, vec!["cam1.mp4", "cam2.mp4", "cam3.ts"]);
    assert_eq!(report.relays[2].pair.destination, "srt://host:9000?streamid=x,y");

    let log = backend.log();
    assert_eq!(log.source_opens[..3], ["cam1.mp4", "cam2.mp4", "cam3.ts"]);
    for dest in ["rtmp://host/a", "rtmp://host/b", "srt://host:9000?streamid=x,y"] {
        assert!(log.written.iter().any(|w| w.destination == dest), "{dest} got nothing");
    }
}

#[test]
fn shutdown_joins_every_relay_and_releases_every_handle() {
    let backend = ScriptedBackend::new(AttemptPlan::live(TimeBase::new(1, 90_000), 3000));
    backend.push_plan("cam2.mp4", AttemptPlan::open_failure());
    backend.push_plan("cam2.mp4", AttemptPlan::probe_failure());

    let started = Instant::now();
    let report = run_for(&backend, &settings(), Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(2), "shutdown was not prompt");

    assert_eq!(report.relays.len(), 3);
    for relay in &report.relays {
        match &relay.outcome {
            RelayOutcome::Stopped(r) => {
                assert_eq!(r.last_reason, Some(TerminalReason::CancelledCleanly));
            }
            other => panic!("{} ended with {other:?}", relay.pair.source),
        }
    }
    match &report.relays[1].outcome {
        RelayOutcome::Stopped(r) => {
            assert_eq!(r.attempts, 3);
            assert_eq!(r.cooldowns, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    let log = backend.log();
    assert_eq!(log.sources_opened, log.sources_closed);
    assert_eq!(log.sinks_opened, log.sinks_closed);
    assert_eq!(log.trailers_written, 3);
}

#[test]
fn exhausted_sources_keep_cycling_until_cancelled() {
    let backend = ScriptedBackend::new(AttemptPlan::forwarding(Vec::new()));
    let report = run_for(&backend, &settings(), Duration::from_millis(200));

    assert_eq!(report.relays.len(), 3);
    for relay in &report.relays {
        let RelayOutcome::Stopped(r) = &relay.outcome else {
            panic!("{} did not stop cleanly", relay.pair.source);
        };
        assert!(r.attempts >= 2, "{} was not retried", relay.pair.source);
    }
    let log = backend.log();
    assert_eq!(log.sources_opened, log.sources_closed);
}
