//! Presenting side of the check-in protocol.
//!
//! A [`QrDisplay`] owns one background task that regenerates the token once
//! per window and publishes a per-second countdown. Frames are observed
//! through a `watch` channel. Dropping the display (or calling
//! [`QrDisplay::close`]) cancels the task, so no timer outlives its view.

use super::token::{countdown_secs, QrProtocol, QrToken};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Countdown resolution.
const TICK: Duration = Duration::from_secs(1);

/// Source of wall-clock milliseconds for token issuance.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// What the screen should show right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrFrame {
    pub token: QrToken,
    /// Whole seconds until the token is replaced.
    pub seconds_remaining: u64,
}

/// A live, self-refreshing QR code for one subject.
pub struct QrDisplay {
    frames: watch::Receiver<QrFrame>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl QrDisplay {
    /// Issue the first token immediately and start the refresh task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        subject_id: impl Into<String>,
        protocol: Arc<QrProtocol>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let subject_id = subject_id.into();
        let window = Duration::from_millis(u64::try_from(protocol.window_ms()).unwrap_or(0));

        let first = QrFrame {
            token: protocol.generate(&subject_id, clock.now_ms()),
            seconds_remaining: countdown_secs(0, protocol.window_ms()),
        };
        let (tx, rx) = watch::channel(first);
        let cancel = CancellationToken::new();

        tracing::debug!(subject_id = %subject_id, "QR display started");

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let start = Instant::now();
            let mut issued = start;

            let mut regen = tokio::time::interval_at(start + window, window);
            regen.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut countdown = tokio::time::interval_at(start + TICK, TICK);
            countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => break,
                    _ = regen.tick() => {
                        issued = Instant::now();
                        let frame = QrFrame {
                            token: protocol.generate(&subject_id, clock.now_ms()),
                            seconds_remaining: countdown_secs(0, protocol.window_ms()),
                        };
                        tracing::debug!(
                            subject_id = %subject_id,
                            issued_at_ms = frame.token.issued_at_ms,
                            "QR token regenerated"
                        );
                        tx.send_replace(frame);
                    }
                    _ = countdown.tick() => {
                        let elapsed_ms =
                            i64::try_from(issued.elapsed().as_millis()).unwrap_or(i64::MAX);
                        let remaining = countdown_secs(elapsed_ms, protocol.window_ms());
                        tx.send_if_modified(|frame| {
                            if frame.seconds_remaining == remaining {
                                return false;
                            }
                            frame.seconds_remaining = remaining;
                            true
                        });
                    }
                }
            }

            tracing::debug!(subject_id = %subject_id, "QR display stopped");
        });

        Self {
            frames: rx,
            cancel,
            task: Some(task),
        }
    }

    /// Latest frame.
    pub fn current(&self) -> QrFrame {
        self.frames.borrow().clone()
    }

    /// Independent observer of the frame stream.
    pub fn subscribe(&self) -> watch::Receiver<QrFrame> {
        self.frames.clone()
    }

    /// Wait for the next frame. `None` once the display has stopped.
    pub async fn next_frame(&mut self) -> Option<QrFrame> {
        self.frames.changed().await.ok()?;
        Some(self.frames.borrow_and_update().clone())
    }

    /// Stop the refresh task and wait for it to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for QrDisplay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
