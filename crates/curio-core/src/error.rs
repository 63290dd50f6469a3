// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for curio-core.
//!
//! Business errors (unknown factory, unknown artifact, checksum failures,
//! ...) are recoverable and map to a machine-readable reason string via
//! [`EngineError::error_code`]. Protocol misuse is fatal for the current
//! request only and is distinguished by [`EngineError::is_protocol_violation`].

use std::fmt;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors that can occur during request processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// No factory is registered under the requested name.
    NoSuchFactory {
        /// The factory name that was not found.
        factory: String,
    },

    /// No service is registered under the requested name.
    NoSuchService {
        /// The service name that was not found.
        service: String,
    },

    /// Artifact was not found (invalid identifier, missing row, or
    /// unresolvable factory; the three cases are intentionally
    /// indistinguishable at this surface).
    NoSuchArtifact {
        /// The identifier that did not resolve.
        id: String,
    },

    /// Collection was not found.
    NoSuchCollection {
        /// The identifier that did not resolve.
        id: String,
    },

    /// User was not found.
    NoSuchUser {
        /// The identifier that did not resolve.
        id: String,
    },

    /// A factory failed to construct an artifact.
    CreationFailed {
        /// The factory that failed.
        factory: String,
        /// The reason for failure.
        reason: String,
    },

    /// A transfer document's checksum field is absent or malformed.
    InvalidChecksum,

    /// A transfer document's checksum does not match its payload.
    ChecksumMismatch,

    /// A transfer document carries an empty payload.
    NoData,

    /// A payload could not be decoded or deserialized.
    InvalidPayload {
        /// The reason the payload was rejected.
        reason: String,
    },

    /// A user operation is missing the display name.
    MissingUsername,

    /// A user operation is missing the account name.
    MissingAccount,

    /// The call protocol was misused (e.g. background completion for a
    /// target that is not backgrounded). Fatal for the current request.
    ProtocolViolation {
        /// What was violated.
        message: String,
    },

    /// A storage operation failed. The unit of work was aborted; callers
    /// must re-submit, there is no automatic retry.
    StoreFailed {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the machine-readable reason string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSuchFactory { .. } => "NO_SUCH_FACTORY",
            Self::NoSuchService { .. } => "NO_SUCH_SERVICE",
            Self::NoSuchArtifact { .. } => "NO_SUCH_ARTIFACT",
            Self::NoSuchCollection { .. } => "NO_SUCH_COLLECTION",
            Self::NoSuchUser { .. } => "NO_SUCH_USER",
            Self::CreationFailed { .. } => "CREATION_FAILED",
            Self::InvalidChecksum => "INVALID_CHECKSUM",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::NoData => "NO_DATA",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::MissingUsername => "MISSING_USERNAME",
            Self::MissingAccount => "MISSING_ACCOUNT",
            Self::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Self::StoreFailed { .. } => "STORE_FAILED",
        }
    }

    /// Whether this error is protocol misuse rather than a business error.
    ///
    /// Protocol violations map to a 5xx-style outcome with no payload at
    /// the API boundary; everything else maps to a 4xx-style outcome with
    /// the [`error_code`](Self::error_code) reason string.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchFactory { factory } => {
                write!(f, "No factory registered under '{}'", factory)
            }
            Self::NoSuchService { service } => {
                write!(f, "No service registered under '{}'", service)
            }
            Self::NoSuchArtifact { id } => write!(f, "Artifact '{}' not found", id),
            Self::NoSuchCollection { id } => write!(f, "Collection '{}' not found", id),
            Self::NoSuchUser { id } => write!(f, "User '{}' not found", id),
            Self::CreationFailed { factory, reason } => {
                write!(f, "Factory '{}' failed to create artifact: {}", factory, reason)
            }
            Self::InvalidChecksum => write!(f, "Transfer checksum is absent or malformed"),
            Self::ChecksumMismatch => write!(f, "Transfer checksum does not match payload"),
            Self::NoData => write!(f, "Transfer payload is empty"),
            Self::InvalidPayload { reason } => write!(f, "Invalid payload: {}", reason),
            Self::MissingUsername => write!(f, "Display name is required"),
            Self::MissingAccount => write!(f, "Account name is required"),
            Self::ProtocolViolation { message } => {
                write!(f, "Call protocol violation: {}", message)
            }
            Self::StoreFailed { operation, details } => {
                write!(f, "Store error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::StoreFailed {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InvalidPayload {
            reason: err.to_string(),
        }
    }
}
