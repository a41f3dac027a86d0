// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Graceful termination.
//!
//! Every invocation running in this process holds an [`InFlightGuard`]. Once
//! shutdown starts no new guard is handed out, the watchdog token is
//! cancelled, and [`ShutdownCoordinator::shutdown`] waits for the guards that
//! are still out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct State {
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Tracks in-flight invocations and gates new ones.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<State>,
    token: CancellationToken,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator that accepts work.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub(crate) fn with_token(token: CancellationToken) -> Self {
        Self {
            state: Arc::new(State::default()),
            token,
        }
    }

    /// Register one in-flight invocation. `None` once shutdown has started.
    pub fn enter(&self) -> Option<InFlightGuard> {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.state.shutting_down.load(Ordering::SeqCst) {
            self.release();
            return None;
        }
        Some(InFlightGuard {
            state: self.state.clone(),
        })
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.state.shutting_down.load(Ordering::SeqCst)
    }

    /// Number of invocations currently running.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Token cancelled when shutdown starts. Background loops select on it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stop accepting work and wait up to `timeout` for in-flight invocations.
    ///
    /// Returns `true` when everything finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        self.token.cancel();

        let remaining = self.in_flight();
        info!(in_flight = remaining, "Shutdown started");

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking, so a release in between is not lost.
            let drained = self.state.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.in_flight() == 0 {
                info!("Shutdown complete");
                return true;
            }

            tokio::select! {
                biased;

                _ = &mut drained => {
                    debug!(in_flight = self.in_flight(), "In-flight invocation finished");
                }

                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        in_flight = self.in_flight(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Shutdown timed out with invocations still running"
                    );
                    return false;
                }
            }
        }
    }

    fn release(&self) {
        release(&self.state);
    }
}

fn release(state: &State) {
    if state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        state.drained.notify_waiters();
    }
}

/// Held for the lifetime of one invocation.
pub struct InFlightGuard {
    state: Arc<State>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        release(&self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_without_work_completes_immediately() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.shutdown(Duration::from_millis(10)).await);
        assert!(coordinator.is_shutting_down());
        assert!(coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_enter_refused_after_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown(Duration::from_millis(10)).await;
        assert!(coordinator.enter().is_none());
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_guards() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.enter().unwrap();
        assert_eq!(coordinator.in_flight(), 1);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(coordinator.shutdown(Duration::from_secs(5)).await);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_times_out() {
        let coordinator = ShutdownCoordinator::new();
        let _guard = coordinator.enter().unwrap();

        assert!(!coordinator.shutdown(Duration::from_millis(30)).await);
        assert_eq!(coordinator.in_flight(), 1);
    }
}
