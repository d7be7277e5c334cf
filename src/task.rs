//! Background tasks with cooperative cancellation
//!
//! A task is a named thread plus a stop channel. Stopping drops the sender,
//! which the task observes as a disconnected channel at its next check; the
//! caller then joins the thread. Nothing is killed mid-iteration.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{KeystackError, Result};

/// Handed to a task body to poll for cancellation
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected) | Ok(()))
    }

    /// Sleep for up to `timeout`, waking early on stop.
    /// Returns true if the task was asked to stop.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// Handle to a running background thread
pub struct BackgroundTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `body` once on a new thread
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, rx) = channel::bounded(1);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(StopSignal { rx }))
            .map_err(|e| {
                KeystackError::BackendUnavailable(format!("Failed to spawn task {}: {}", name, e))
            })?;

        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Run `tick` every `interval` until stopped or `tick` returns false
    pub fn periodic<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(name, move |stop| {
            while !stop.wait(interval) {
                if !tick() {
                    break;
                }
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the task and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // stopped from inside its own body; it exits on its next check
                return;
            }
            if handle.join().is_err() {
                tracing::error!(task = %self.name, "Background task panicked");
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}
