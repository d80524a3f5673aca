//! # Supervisor Loop
//!
//! Keeps one relay pair alive until cancellation. Every attempt outcome,
//! clean end of input included, is followed by a fixed cooldown and a new
//! attempt. A live feed is expected to fail transiently (network blips,
//! encoder restarts), so the supervisor never gives up on its own.
//!
//! Lifecycle events can be observed through a `crossbeam_channel` sender;
//! the relay itself does not depend on anyone listening.

use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::info;

use crate::cancel::CancelToken;
use crate::config::{RelayPair, RelaySettings};
use crate::error::TerminalReason;
use crate::media::MediaBackend;
use crate::worker::RelayWorker;

/// Events emitted by a supervisor as it cycles through attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    AttemptStarted {
        attempt: u64,
    },
    AttemptEnded {
        attempt: u64,
        reason: TerminalReason,
    },
    /// A retry cooldown began after `attempt`.
    CooldownStarted {
        attempt: u64,
        delay: Duration,
    },
    Stopped {
        attempts: u64,
    },
}

/// Summary of a supervisor's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    pub attempts: u64,
    pub cooldowns: u64,
    pub last_reason: Option<TerminalReason>,
}

pub struct Supervisor<'a, B: MediaBackend> {
    pair: &'a RelayPair,
    backend: &'a B,
    settings: &'a RelaySettings,
    cancel: CancelToken,
    events: Option<Sender<SupervisorEvent>>,
}

impl<'a, B: MediaBackend> Supervisor<'a, B> {
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
            events: None,
        }
    }

    /// Publish lifecycle events to `tx`.
    pub fn with_events(mut self, tx: Sender<SupervisorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run attempts until cancellation is observed.
    pub fn run(self) -> SupervisorReport {
        let worker = RelayWorker::new(self.pair, self.backend, self.settings, self.cancel.clone());
        let cooldown = self.settings.cooldown;
        let slice = self.settings.pacing.sleep_slice;

        let mut report = SupervisorReport {
            attempts: 0,
            cooldowns: 0,
            last_reason: None,
        };

        while !self.cancel.is_cancelled() {
            report.attempts += 1;
            let attempt = report.attempts;
            self.emit(SupervisorEvent::AttemptStarted { attempt });

            let outcome = worker.run_attempt(attempt);
            report.last_reason = Some(outcome.reason);
            self.emit(SupervisorEvent::AttemptEnded {
                attempt,
                reason: outcome.reason,
            });

            if self.cancel.is_cancelled() {
                break;
            }

            info!(
                source = %self.pair.source,
                destination = %self.pair.destination,
                reason = %outcome.reason,
                cooldown_ms = cooldown.as_millis() as u64,
                "restarting relay after cooldown"
            );
            report.cooldowns += 1;
            self.emit(SupervisorEvent::CooldownStarted {
                attempt,
                delay: cooldown,
            });
            if !self.cancel.sleep(cooldown, slice) {
                break;
            }
        }

        info!(
            source = %self.pair.source,
            attempts = report.attempts,
            "relay stopped"
        );
        self.emit(SupervisorEvent::Stopped {
            attempts: report.attempts,
        });
        report
    }
}
