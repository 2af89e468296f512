use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::alarm::effects::AlarmEffects;
use crate::api::ApiSharedState;
use crate::engine::{CommandReply, EngineCommand, ReminderEngine};
use crate::storage::Storage;

/// A mutation forwarded from the API thread, with a channel for the answer.
pub struct CommandEnvelope {
    pub command: EngineCommand,
    pub reply: Sender<CommandReply>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub poll_interval: Duration,
    pub max_ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceSummary {
    pub ticks: u64,
    pub commands: u64,
}

/// Owns the engine for the lifetime of the process. Commands and ticks are
/// interleaved on this thread only.
pub fn run_service<S: Storage, E: AlarmEffects>(
    engine: &mut ReminderEngine<S, E>,
    commands: &Receiver<CommandEnvelope>,
    published: Option<&Arc<Mutex<ApiSharedState>>>,
    config: &ServiceConfig,
) -> ServiceSummary {
    let mut summary = ServiceSummary::default();
    let mut next_tick = Instant::now();
    publish(engine, published);
    info!(
        poll_ms = config.poll_interval.as_millis() as u64,
        "reminder service running"
    );

    loop {
        if config.max_ticks.is_some_and(|max| summary.ticks >= max) {
            info!(ticks = summary.ticks, "tick limit reached");
            break;
        }

        let wait = next_tick.saturating_duration_since(Instant::now());
        match commands.recv_timeout(wait) {
            Ok(envelope) => {
                debug!(command = ?envelope.command, "applying command");
                let reply = engine.handle(envelope.command, Utc::now());
                summary.commands += 1;
                publish(engine, published);
                if envelope.reply.send(reply).is_err() {
                    debug!("command sender went away before the reply");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("command channel closed, stopping");
                break;
            }
        }

        // Reached after commands as well as timeouts.
        let now = Instant::now();
        if now < next_tick {
            continue;
        }
        let outcome = engine.tick(Utc::now());
        summary.ticks += 1;
        if !outcome.is_quiet() {
            info!(
                triggered = outcome.triggered,
                expired = outcome.expired,
                missed_logged = outcome.missed_logged,
                "tick"
            );
        }
        next_tick = advance_deadline(next_tick, now, config.poll_interval);
        publish(engine, published);
    }

    summary
}

/// Next tick after `now`, dropping any ticks that were overrun.
fn advance_deadline(previous: Instant, now: Instant, interval: Duration) -> Instant {
    let mut next = previous + interval;
    while next <= now {
        next += interval;
    }
    next
}

fn publish<S: Storage, E: AlarmEffects>(
    engine: &ReminderEngine<S, E>,
    published: Option<&Arc<Mutex<ApiSharedState>>>,
) {
    let Some(state) = published else {
        return;
    };
    let snapshot = engine.snapshot(Utc::now());
    match state.lock() {
        Ok(mut guard) => guard.snapshot = snapshot,
        Err(_) => warn!("api state lock poisoned, snapshot not published"),
    }
}
