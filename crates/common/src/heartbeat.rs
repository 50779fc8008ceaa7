//! Heartbeat liveness monitoring.
//!
//! Both ends of a connection run [`run_heartbeat`]: every interval it checks
//! whether anything arrived from the peer since the previous tick, then
//! delivers a fresh probe within a bounded timeout. Too many silent
//! intervals in a row, or a probe that cannot be delivered in time, end the
//! loop; callers treat either outcome as a fatal transport error.

use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use {
    tokio::time::{self, Instant, MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

/// Tracks whether the peer has shown any sign of life since the last check.
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
        }
    }

    /// Record activity from the peer (any frame, including pongs).
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Returns `true` if the peer was active since the previous call, and
    /// resets the flag.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Time between probes.
    pub interval: Duration,
    /// Upper bound for delivering one probe.
    pub timeout: Duration,
    /// Consecutive silent intervals tolerated before the peer is dead.
    pub max_missed: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_missed: 3,
        }
    }
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stayed silent for `max_missed` intervals.
    TimedOut,
    /// A probe could not be delivered within the timeout.
    ProbeFailed,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Run heartbeat probes until the peer looks dead or `cancel` fires.
///
/// `probe` delivers one probe and resolves to `false` if delivery failed.
/// The first probe goes out one `interval` after the call.
pub async fn run_heartbeat<F, Fut>(
    liveness: &Liveness,
    settings: HeartbeatSettings,
    mut probe: F,
    cancel: CancellationToken,
) -> HeartbeatResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut ticker = time::interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_missed = settings.max_missed.max(1);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if liveness.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    debug!(missed, max_missed, "heartbeat: peer silent");
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
                let delivered = tokio::select! {
                    res = time::timeout(settings.timeout, probe()) => matches!(res, Ok(true)),
                    () = cancel.cancelled() => return HeartbeatResult::Cancelled,
                };
                if !delivered {
                    return HeartbeatResult::ProbeFailed;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
