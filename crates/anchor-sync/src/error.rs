//! Anchor Error Types
//!
//! Unified error handling for the anchor engine. Synchronous registry and
//! precondition failures are returned directly; asynchronous cloud failures
//! arrive wrapped in [`AnchorError::Cloud`] and are relayed to the caller.

use serde::{Deserialize, Serialize};

use crate::cloud::CloudFailure;

/// Engine error type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum AnchorError {
    /// An anchor with this name is already registered
    #[error("Anchor '{name}' already exists")]
    DuplicateName {
        /// Conflicting anchor name
        name: String,
    },

    /// No anchor with this name is registered
    #[error("Anchor '{name}' not found")]
    AnchorNotFound {
        /// Requested anchor name
        name: String,
    },

    /// Malformed caller input
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the input
        message: String,
    },

    /// Requested time-to-live outside the accepted range
    #[error("Invalid time-to-live: {ttl_days} days (allowed 1..={max_days})")]
    InvalidTtl {
        /// Requested TTL in days
        ttl_days: u32,
        /// Largest accepted TTL in days
        max_days: u32,
    },

    /// The token provider could not produce a credential
    #[error("Error generating authentication token: {reason}")]
    TokenGenerationFailed {
        /// Provider failure description
        reason: String,
    },

    /// Cloud mode is not available
    #[error("Cloud session not initialized: {reason}")]
    CloudSessionInitFailed {
        /// Why the cloud session is unavailable
        reason: String,
    },

    /// The cloud service reported a failure
    #[error(transparent)]
    Cloud(#[from] CloudFailure),

    /// The tracking session never attached a node to a new anchor
    #[error("Timed out after {waited_ms}ms waiting for anchor '{name}' to attach")]
    AttachmentTimeout {
        /// Anchor that never attached
        name: String,
        /// How long the gate waited
        waited_ms: u64,
    },

    /// The caller did not accept a resolved anchor
    #[error("Error while registering downloaded anchor {cloud_id}: {reason}")]
    RegistrationRejected {
        /// Cloud identifier of the discarded anchor
        cloud_id: String,
        /// Why registration did not happen
        reason: String,
    },

    /// The caller stopped waiting for a cloud task
    #[error("Cloud task timed out after {waited_ms}ms")]
    CloudTaskTimeout {
        /// How long the relay waited
        waited_ms: u64,
    },

    /// The session was disposed while the operation was in flight
    #[error("Session closed")]
    SessionClosed,

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem
        message: String,
    },
}

/// Engine result type
pub type AnchorResult<T> = std::result::Result<T, AnchorError>;

impl AnchorError {
    /// Create a duplicate name error
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Create a not found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::AnchorNotFound { name: name.into() }
    }

    /// Create an invalid argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a token generation error
    pub fn token(reason: impl Into<String>) -> Self {
        Self::TokenGenerationFailed {
            reason: reason.into(),
        }
    }

    /// Create a cloud session init error
    pub fn cloud_unavailable(reason: impl Into<String>) -> Self {
        Self::CloudSessionInitFailed {
            reason: reason.into(),
        }
    }

    /// Create a registration rejected error
    pub fn rejected(cloud_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegistrationRejected {
            cloud_id: cloud_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Short machine-readable code, used as the error code on the method channel
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateName { .. } => "DuplicateName",
            Self::AnchorNotFound { .. } => "AnchorNotFound",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::InvalidTtl { .. } => "InvalidTtl",
            Self::TokenGenerationFailed { .. } => "TokenGenerationFailed",
            Self::CloudSessionInitFailed { .. } => "CloudSessionInitFailed",
            Self::Cloud(failure) => failure.code(),
            Self::AttachmentTimeout { .. } => "AttachmentTimeout",
            Self::RegistrationRejected { .. } => "RegistrationRejected",
            Self::CloudTaskTimeout { .. } => "CloudTaskTimeout",
            Self::SessionClosed => "SessionClosed",
            Self::Config { .. } => "Config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_failure_is_transparent() {
        let err: AnchorError = CloudFailure::CloudIdNotFound.into();
        assert_eq!(err.to_string(), "Cloud anchor id not found");
        assert_eq!(err.code(), "CloudIdNotFound");
    }

    #[test]
    fn test_messages_name_the_anchor() {
        let err = AnchorError::duplicate("plane1");
        assert!(err.to_string().contains("plane1"));
        assert_eq!(err.code(), "DuplicateName");

        let err = AnchorError::rejected("abc123", "no name returned");
        assert!(err.to_string().starts_with("Error while registering downloaded anchor"));
    }
}
