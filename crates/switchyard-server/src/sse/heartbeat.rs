//! Periodic keep-alive for every connected session.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why the heartbeat loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The owner went away (the beat callback returned `false`).
    OwnerGone,
    /// The heartbeat was cancelled.
    Cancelled,
}

/// Call `beat` every `interval` until it returns `false` or `cancel` fires.
///
/// The first beat happens one full interval after the call.
pub async fn run_heartbeat<F>(interval: Duration, cancel: CancellationToken, mut beat: F) -> HeartbeatResult
where
    F: FnMut() -> bool,
{
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {
                if !beat() {
                    return HeartbeatResult::OwnerGone;
                }
            }
        }
    }
}

/// A running heartbeat task.
pub struct HeartbeatScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<HeartbeatResult>,
}

impl HeartbeatScheduler {
    /// Spawn [`run_heartbeat`] on the current runtime.
    pub fn spawn<F>(interval: Duration, beat: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(interval, cancel.clone(), beat));
        debug!(interval_ms = interval.as_millis(), "heartbeat started");
        Self { cancel, handle }
    }

    /// Cancel the task and wait for it to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        match self.handle.await {
            Ok(result) => debug!(?result, "heartbeat stopped"),
            Err(error) => warn!(%error, "heartbeat task ended abnormally"),
        }
    }
}
