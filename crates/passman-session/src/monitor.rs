//! Inactivity monitor.
//!
//! One coordinating task per execution context. Views report interaction
//! through a cloneable [`ActivitySender`]; the task coalesces those signals
//! into at most one timestamp write per window and, on a fixed poll
//! interval, asks the coordinator to check the shared timestamp against the
//! idle threshold. Both only happen while the state is `Unlocked`.
//!
//! The timestamp lives in the device-scoped tier, so activity seen by one
//! context keeps every other context on the device alive, and a reload reads
//! the same value it left behind.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SessionConfig;
use crate::coordinator::AccessCoordinator;
use crate::error::Result;
use crate::state::AccessState;

/// A kind of user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    PointerMove,
    KeyPress,
    Click,
    Scroll,
    Touch,
}

/// Handle views use to report interaction to the monitor.
#[derive(Debug, Clone)]
pub struct ActivitySender {
    tx: mpsc::Sender<ActivitySignal>,
}

impl ActivitySender {
    /// Report one interaction. Never blocks; when the buffer is full the
    /// signal is dropped, which the coalescing window would do anyway.
    pub fn record(&self, signal: ActivitySignal) {
        if self.tx.try_send(signal).is_err() {
            tracing::trace!(signal = ?signal, "activity signal dropped");
        }
    }
}

/// Running monitor task.
pub struct InactivityMonitor {
    activity: ActivitySender,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl InactivityMonitor {
    /// Spawn the monitor for `coordinator` on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`](crate::error::SessionError::InvalidConfig)
    /// if any interval or the channel capacity is zero.
    pub fn spawn(coordinator: AccessCoordinator, config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.activity_channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Worker {
            coordinator,
            signals: rx,
            shutdown: shutdown_rx,
            coalesce: config.activity_coalesce(),
            poll: config.idle_poll(),
        };
        let task = tokio::spawn(worker.run());

        Ok(Self {
            activity: ActivitySender { tx },
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn activity_sender(&self) -> ActivitySender {
        self.activity.clone()
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "inactivity monitor task failed");
        }
    }
}

impl Drop for InactivityMonitor {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct Worker {
    coordinator: AccessCoordinator,
    signals: mpsc::Receiver<ActivitySignal>,
    shutdown: oneshot::Receiver<()>,
    coalesce: Duration,
    poll: Duration,
}

impl Worker {
    async fn run(mut self) {
        let mut state_rx = self.coordinator.subscribe();
        let mut poll = tokio::time::interval(self.poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_write: Option<Instant> = None;

        tracing::debug!(poll_ms = self.poll.as_millis() as u64, "inactivity monitor started");

        loop {
            let unlocked = *state_rx.borrow_and_update() == AccessState::Unlocked;

            tokio::select! {
                biased;

                _ = &mut self.shutdown => break,

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *state_rx.borrow() == AccessState::Unlocked {
                        // Check right away: a restored session may already be stale.
                        poll.reset_immediately();
                    }
                }

                Some(signal) = self.signals.recv() => {
                    if !unlocked {
                        continue;
                    }
                    if last_write.is_some_and(|at| at.elapsed() < self.coalesce) {
                        continue;
                    }
                    match self.coordinator.activity().touch().await {
                        Ok(()) => last_write = Some(Instant::now()),
                        Err(e) => tracing::warn!(signal = ?signal, error = %e, "failed to record activity"),
                    }
                }

                _ = poll.tick(), if unlocked => {
                    if let Err(e) = self.coordinator.check_idle().await {
                        tracing::warn!(error = %e, "idle check failed");
                    }
                }
            }
        }

        tracing::debug!("inactivity monitor stopped");
    }
}
