// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON encoding of parameters, results, effect values and messages.

use durra_core::CoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub(crate) fn encode<T: Serialize + ?Sized>(context: &str, value: &T) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value).map_err(|e| CoreError::serialization(context, e))
}

/// Decode stored bytes; an absent payload decodes as JSON `null`.
pub(crate) fn decode<T: DeserializeOwned>(context: &str, bytes: Option<&[u8]>) -> Result<T, CoreError> {
    serde_json::from_slice(bytes.unwrap_or(b"null")).map_err(|e| CoreError::serialization(context, e))
}
