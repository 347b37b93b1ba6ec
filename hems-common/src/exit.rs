// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The process-wide exit latch and signal handlers, grounded on
//! `original_source/include/hems/common/exit.h` (`exit_sem`, `exit_status`,
//! `signal_handler`). The original used a binary semaphore and a
//! `sig_atomic_t`; this uses a `tokio::sync::Notify` latch and a mutex-
//! guarded `Option<i32>` so the first caller to set a status wins.

use std::sync::Mutex;
use tokio::sync::Notify;

use crate::error::Error;

/// A one-shot latch: the first call to `exit()` records a status and wakes
/// every task blocked in `wait()`. Later calls are no-ops.
pub struct ExitLatch {
    status: Mutex<Option<i32>>,
    notify: Notify,
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitLatch {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Requests a shutdown with the given status. Only the first call takes
    /// effect; subsequent calls are ignored so a racing watcher and signal
    /// handler cannot overwrite each other's status.
    pub fn exit(&self, status: i32) {
        let mut guard = self.status.lock().unwrap();
        if guard.is_none() {
            *guard = Some(status);
            drop(guard);
            self.notify.notify_waiters();
        }
    }

    pub fn status(&self) -> Option<i32> {
        *self.status.lock().unwrap()
    }

    pub fn has_fired(&self) -> bool {
        self.status().is_some()
    }

    /// Blocks until `exit()` has been called, then returns the recorded
    /// status. Safe to call from multiple tasks.
    pub async fn wait(&self) -> i32 {
        loop {
            let notified = self.notify.notified();
            if let Some(status) = self.status() {
                return status;
            }
            notified.await;
        }
    }
}

/// Installs handlers for `SIGTERM`, `SIGINT` and `SIGQUIT` that all call
/// `latch.exit(0)`, matching `signal_handler()` in the original. Spawns a
/// background task; the returned `JoinHandle` lives as long as the process
/// typically does and does not need to be awaited.
pub fn install_signal_handlers(latch: std::sync::Arc<ExitLatch>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()).map_err(Error::Io) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()).map_err(Error::Io) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut quit = match signal(SignalKind::quit()).map_err(Error::Io) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGQUIT handler");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => tracing::info!("received SIGTERM"),
            _ = int.recv() => tracing::info!("received SIGINT"),
            _ = quit.recv() => tracing::info!("received SIGQUIT"),
        }
        latch.exit(0);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_returns_after_exit() {
        let latch = Arc::new(ExitLatch::new());
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        tokio::task::yield_now().await;
        latch.exit(7);

        let status = waiter.await.unwrap();
        assert_eq!(status, 7);
    }

    #[tokio::test]
    async fn first_call_wins() {
        let latch = ExitLatch::new();
        latch.exit(1);
        latch.exit(2);
        assert_eq!(latch.status(), Some(1));
    }

    #[tokio::test]
    async fn wait_returns_immediately_if_already_fired() {
        let latch = ExitLatch::new();
        latch.exit(3);
        assert_eq!(latch.wait().await, 3);
    }
}
