//! # Fleet Manager
//!
//! Starts one [`Supervisor`] per [`RelayPair`], in file order, each on its own
//! named OS thread, waiting the configured stagger between starts. All
//! threads live inside one `std::thread::scope`, so `run` cannot return while
//! any relay is still running, and a panicking relay is joined and reported
//! like the others.

use std::any::Any;
use std::thread;

use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::config::{RelayPair, RelaySettings};
use crate::media::MediaBackend;
use crate::supervisor::{Supervisor, SupervisorReport};

/// How one relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Stopped(SupervisorReport),
    Panicked(String),
    SpawnFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResult {
    pub pair: RelayPair,
    pub outcome: RelayOutcome,
}

/// Results for every relay that was started, in start order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    pub relays: Vec<RelayResult>,
}

impl FleetReport {
    pub fn total_attempts(&self) -> u64 {
        self.relays
            .iter()
            .filter_map(|r| match &r.outcome {
                RelayOutcome::Stopped(report) => Some(report.attempts),
                _ => None,
            })
            .sum()
    }

    pub fn panicked(&self) -> usize {
        self.relays
            .iter()
            .filter(|r| matches!(r.outcome, RelayOutcome::Panicked(_)))
            .count()
    }
}

pub struct Fleet<'a, B: MediaBackend> {
    backend: &'a B,
    settings: &'a RelaySettings,
    cancel: CancelToken,
}

impl<'a, B: MediaBackend> Fleet<'a, B> {
    pub fn new(backend: &'a B, settings: &'a RelaySettings, cancel: CancelToken) -> Self {
        Self {
            backend,
            settings,
            cancel,
        }
    }

    /// Run every pair until cancellation and join them all.
    ///
    /// Pairs not yet started when cancellation is observed are never started
    /// and do not appear in the report.
    pub fn run(&self, pairs: &[RelayPair]) -> FleetReport {
        info!(relays = pairs.len(), "starting relay fleet");
        let slice = self.settings.pacing.sleep_slice;

        let relays = thread::scope(|scope| {
            let mut started = Vec::with_capacity(pairs.len());

            for (n, pair) in pairs.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    break;
                }

                let supervisor =
                    Supervisor::new(pair, self.backend, self.settings, self.cancel.clone());
                let spawned = thread::Builder::new()
                    .name(format!("relay-{n}"))
                    .spawn_scoped(scope, move || supervisor.run());

                match spawned {
                    Ok(handle) => started.push((pair, Ok(handle))),
                    Err(e) => {
                        error!(source = %pair.source, error = %e, "failed to spawn relay thread");
                        started.push((pair, Err(e.to_string())));
                    }
                }

                let last = n + 1 == pairs.len();
                if !last && !self.cancel.sleep(self.settings.stagger, slice) {
                    info!(
                        started = n + 1,
                        skipped = pairs.len() - n - 1,
                        "cancelled while starting relays"
                    );
                    break;
                }
            }

            started
                .into_iter()
                .map(|(pair, handle)| {
                    let outcome = match handle {
                        Err(msg) => RelayOutcome::SpawnFailed(msg),
                        Ok(handle) => match handle.join() {
                            Ok(report) => RelayOutcome::Stopped(report),
                            Err(payload) => {
                                let msg = panic_message(payload.as_ref());
                                error!(source = %pair.source, panic = %msg, "relay thread panicked");
                                RelayOutcome::Panicked(msg)
                            }
                        },
                    };
                    RelayResult {
                        pair: pair.clone(),
                        outcome,
                    }
                })
                .collect()
        });

        let report = FleetReport { relays };
        if report.panicked() > 0 {
            warn!(panicked = report.panicked(), "some relays ended abnormally");
        }
        info!(
            relays = report.relays.len(),
            attempts = report.total_attempts(),
            "relay fleet stopped"
        );
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
