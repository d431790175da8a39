//! Cancellable one-shot timers
//!
//! A [`Deferred`] never touches session state itself. When it expires it
//! posts a message back into the session inbox, tagged with an epoch; any
//! reschedule or cancel bumps the epoch so a message that was already queued
//! is recognised as stale and dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Delayed scan start after returning from the background
    ScanRestart,
    /// Replay of the last unacknowledged write
    WriteReplay,
    /// Status check that follows a turn ack
    StatusVerification,
}

#[derive(Debug)]
pub struct Deferred {
    timer: Timer,
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

impl Deferred {
    pub fn new(timer: Timer) -> Self {
        Self {
            timer,
            epoch: 0,
            task: None,
        }
    }

    pub fn timer(&self) -> Timer {
        self.timer
    }

    /// Replace any pending expiry with one `delay` from now
    pub fn schedule<T, F>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<T>, message: F)
    where
        T: Send + 'static,
        F: FnOnce(Timer, u64) -> T,
    {
        self.cancel();
        let msg = message(self.timer, self.epoch);
        let tx = tx.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.epoch += 1;
    }

    /// Accept an expiry. False when it was cancelled or superseded.
    pub fn fire(&mut self, epoch: u64) -> bool {
        if self.task.is_some() && epoch == self.epoch {
            self.task = None;
            self.epoch += 1;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
