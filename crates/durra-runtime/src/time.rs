// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conversions between wall-clock instants and std durations.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// `now + duration`, saturating at the largest representable time.
pub(crate) fn from_now(duration: Duration) -> DateTime<Utc> {
    after(Utc::now(), duration)
}

/// `start + duration`, saturating at the largest representable time.
pub(crate) fn after(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time left until `target`, zero when it has passed.
pub(crate) fn until(target: DateTime<Utc>) -> Duration {
    (target - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
