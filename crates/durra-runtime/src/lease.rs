// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease renewal for a running invocation.
//!
//! The renewer extends the lease every half lease length through a
//! compare-and-swap on `(flow_id, epoch)`. A rejected renewal means another
//! executor owns the flow; a lease that runs out without a renewal means
//! someone else may own it soon. Either way the invocation is superseded and
//! must not write again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use durra_core::{FlowId, FunctionStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared view of the lease, consulted before every write from flow code.
#[derive(Debug)]
pub(crate) struct LeaseState {
    superseded: AtomicBool,
    expires_at_ms: AtomicI64,
}

impl LeaseState {
    pub(crate) fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            superseded: AtomicBool::new(false),
            expires_at_ms: AtomicI64::new(expires_at.timestamp_millis()),
        }
    }

    pub(crate) fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
            || Utc::now().timestamp_millis() > self.expires_at_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_superseded(&self) {
        self.superseded.store(true, Ordering::SeqCst);
    }

    fn extend(&self, expires_at: DateTime<Utc>) {
        self.expires_at_ms
            .store(expires_at.timestamp_millis(), Ordering::SeqCst);
    }
}

/// Background renewer; stops when dropped.
pub(crate) struct Lease {
    state: Arc<LeaseState>,
    token: CancellationToken,
}

impl Lease {
    /// Start renewing a lease that currently runs until `expires_at`.
    ///
    /// `parent` is the registry-wide token; cancelling it stops every renewer.
    pub(crate) fn start(
        store: Arc<dyn FunctionStore>,
        flow_id: FlowId,
        epoch: i32,
        expires_at: DateTime<Utc>,
        lease_length: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let state = Arc::new(LeaseState::new(expires_at));
        let token = parent.child_token();
        let interval = (lease_length / 2).max(Duration::from_millis(1));

        let task_state = state.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            debug!(flow_id = %flow_id, epoch, "Lease renewer started");

            loop {
                tokio::select! {
                    biased;

                    _ = task_token.cancelled() => {
                        debug!(flow_id = %flow_id, epoch, "Lease renewer stopped");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        let expires_at = crate::time::from_now(lease_length);
                        match store.renew_lease(&flow_id, epoch, expires_at).await {
                            Ok(true) => task_state.extend(expires_at),
                            Ok(false) => {
                                warn!(flow_id = %flow_id, epoch, "Lease renewal rejected, flow was taken over");
                                task_state.mark_superseded();
                                break;
                            }
                            Err(e) => {
                                warn!(flow_id = %flow_id, epoch, error = %e, "Failed to renew lease");
                            }
                        }
                    }
                }
            }
        });

        Self { state, token }
    }

    pub(crate) fn state(&self) -> Arc<LeaseState> {
        self.state.clone()
    }

    pub(crate) fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
