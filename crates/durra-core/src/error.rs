// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for durra-core.
//!
//! Store-contract outcomes (duplicate create, stale epoch) are reported as
//! `bool`/`Option` sentinels by the store traits. `CoreError` is reserved for
//! infrastructure failures and malformed data.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by stores and by the data model.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Function was not found in the store.
    FunctionNotFound {
        /// The flow id (`type/instance`) that was not found.
        flow_id: String,
    },

    /// Function already exists.
    FunctionAlreadyExists {
        /// The flow id that already exists.
        flow_id: String,
    },

    /// Function is in an invalid state for the requested operation.
    InvalidFunctionState {
        /// The flow id.
        flow_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// A payload could not be encoded or decoded.
    Serialization {
        /// What was being (de)serialized.
        context: String,
        /// Error details.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FunctionNotFound { .. } => "FUNCTION_NOT_FOUND",
            Self::FunctionAlreadyExists { .. } => "FUNCTION_ALREADY_EXISTS",
            Self::InvalidFunctionState { .. } => "INVALID_FUNCTION_STATE",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Shorthand for a serialization failure.
    pub fn serialization(context: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::Serialization {
            context: context.into(),
            details: details.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FunctionNotFound { flow_id } => {
                write!(f, "Function '{}' not found", flow_id)
            }
            Self::FunctionAlreadyExists { flow_id } => {
                write!(f, "Function '{}' already exists", flow_id)
            }
            Self::InvalidFunctionState {
                flow_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Function '{}' is in invalid state: expected '{}', got '{}'",
                    flow_id, expected, actual
                )
            }
            Self::Serialization { context, details } => {
                write!(f, "Serialization error for '{}': {}", context, details)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            context: "json".to_string(),
            details: err.to_string(),
        }
    }
}
