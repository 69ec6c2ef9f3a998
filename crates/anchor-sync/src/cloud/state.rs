//! Cloud anchor task states and the failure taxonomy derived from them.

use serde::{Deserialize, Serialize};

/// Task state reported by the cloud anchor service.
///
/// Mirrors the service's numeric state codes. Codes the engine does not know
/// are kept as [`CloudAnchorState::Unknown`] so they can be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloudAnchorState {
    /// No cloud task associated
    None,
    /// Host or resolve still running
    TaskInProgress,
    /// Task finished successfully
    Success,
    /// Internal service error
    ErrorInternal,
    /// Credential rejected
    ErrorNotAuthorized,
    /// Service unreachable
    ErrorServiceUnavailable,
    /// Quota exceeded
    ErrorResourceExhausted,
    /// Not enough visual features to host
    ErrorHostingDatasetProcessingFailed,
    /// Unknown cloud identifier
    ErrorCloudIdNotFound,
    /// Could not localize against the hosted anchor
    ErrorResolvingLocalizationNoMatch,
    /// Anchor was hosted by an older SDK than this one supports
    ErrorResolvingSdkVersionTooOld,
    /// Anchor was hosted by a newer SDK than this one supports
    ErrorResolvingSdkVersionTooNew,
    /// Hosting backend unreachable
    ErrorHostingServiceUnavailable,
    /// Code the engine does not recognise
    Unknown(i32),
}

impl CloudAnchorState {
    /// Decode a numeric state code
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::TaskInProgress,
            2 => Self::Success,
            -1 => Self::ErrorInternal,
            -2 => Self::ErrorNotAuthorized,
            -3 => Self::ErrorServiceUnavailable,
            -4 => Self::ErrorResourceExhausted,
            -5 => Self::ErrorHostingDatasetProcessingFailed,
            -6 => Self::ErrorCloudIdNotFound,
            -7 => Self::ErrorResolvingLocalizationNoMatch,
            -8 => Self::ErrorResolvingSdkVersionTooOld,
            -9 => Self::ErrorResolvingSdkVersionTooNew,
            -10 => Self::ErrorHostingServiceUnavailable,
            other => Self::Unknown(other),
        }
    }

    /// Numeric state code
    pub fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::TaskInProgress => 1,
            Self::Success => 2,
            Self::ErrorInternal => -1,
            Self::ErrorNotAuthorized => -2,
            Self::ErrorServiceUnavailable => -3,
            Self::ErrorResourceExhausted => -4,
            Self::ErrorHostingDatasetProcessingFailed => -5,
            Self::ErrorCloudIdNotFound => -6,
            Self::ErrorResolvingLocalizationNoMatch => -7,
            Self::ErrorResolvingSdkVersionTooOld => -8,
            Self::ErrorResolvingSdkVersionTooNew => -9,
            Self::ErrorHostingServiceUnavailable => -10,
            Self::Unknown(code) => code,
        }
    }

    /// Whether the task is finished (successfully or not)
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::None | Self::TaskInProgress)
    }

    /// Human-readable description
    pub fn describe(self) -> &'static str {
        match self {
            Self::None => "Empty state",
            Self::TaskInProgress => "Task in progress",
            Self::Success => "Success",
            Self::ErrorInternal => "Internal error",
            Self::ErrorNotAuthorized => "Authentication failed: Not Authorized",
            Self::ErrorServiceUnavailable => "Cloud Anchor Service unavailable",
            Self::ErrorResourceExhausted => "Resource exhausted",
            Self::ErrorHostingDatasetProcessingFailed => {
                "Dataset processing failed, feature map insufficient"
            }
            Self::ErrorCloudIdNotFound => "Cloud anchor id not found",
            Self::ErrorResolvingLocalizationNoMatch => "No match",
            Self::ErrorResolvingSdkVersionTooOld => "Resolving Sdk version too old",
            Self::ErrorResolvingSdkVersionTooNew => "Resolving Sdk version too new",
            Self::ErrorHostingServiceUnavailable => "Hosting service unavailable",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// Failure this state represents, or `None` for non-failure states
    pub fn failure(self) -> Option<CloudFailure> {
        let failure = match self {
            Self::None | Self::TaskInProgress | Self::Success => return None,
            Self::ErrorInternal => CloudFailure::Internal {
                raw_state: Some(self.code()),
            },
            Self::ErrorNotAuthorized => CloudFailure::NotAuthorized,
            Self::ErrorServiceUnavailable | Self::ErrorHostingServiceUnavailable => {
                CloudFailure::ServiceUnavailable
            }
            Self::ErrorResourceExhausted => CloudFailure::ResourceExhausted,
            Self::ErrorHostingDatasetProcessingFailed => CloudFailure::HostingDatasetInsufficient,
            Self::ErrorCloudIdNotFound => CloudFailure::CloudIdNotFound,
            Self::ErrorResolvingLocalizationNoMatch => CloudFailure::NoLocalizationMatch,
            Self::ErrorResolvingSdkVersionTooOld => {
                CloudFailure::SdkVersionMismatch { too_new: false }
            }
            Self::ErrorResolvingSdkVersionTooNew => {
                CloudFailure::SdkVersionMismatch { too_new: true }
            }
            Self::Unknown(code) => CloudFailure::Internal {
                raw_state: Some(code),
            },
        };
        Some(failure)
    }
}

/// Cloud task failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CloudFailure {
    /// The cloud identifier does not exist or expired
    #[error("Cloud anchor id not found")]
    CloudIdNotFound,

    /// Not enough visual data around the anchor to host it
    #[error("Dataset processing failed, feature map insufficient")]
    HostingDatasetInsufficient,

    /// Cloud service or hosting backend unreachable
    #[error("Cloud Anchor Service unavailable")]
    ServiceUnavailable,

    /// Internal or unrecognised service failure
    #[error("Internal error (state {})", display_raw(.raw_state))]
    Internal {
        /// Raw state code, kept for diagnostics
        raw_state: Option<i32>,
    },

    /// The credential was rejected
    #[error("Authentication failed: Not Authorized")]
    NotAuthorized,

    /// Anchor was hosted with an incompatible SDK
    #[error("Resolving Sdk version too {}", if *.too_new { "new" } else { "old" })]
    SdkVersionMismatch {
        /// Whether the hosting SDK is newer than this one
        too_new: bool,
    },

    /// Service quota exhausted
    #[error("Resource exhausted")]
    ResourceExhausted,

    /// Could not localize against the hosted anchor
    #[error("No match")]
    NoLocalizationMatch,
}

fn display_raw(raw: &Option<i32>) -> String {
    raw.map_or_else(|| "unknown".to_string(), |code| code.to_string())
}

impl CloudFailure {
    /// Internal failure without a state code
    pub fn internal() -> Self {
        Self::Internal { raw_state: None }
    }

    /// Short machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::CloudIdNotFound => "CloudIdNotFound",
            Self::HostingDatasetInsufficient => "HostingDatasetInsufficient",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::Internal { .. } => "InternalError",
            Self::NotAuthorized => "NotAuthorized",
            Self::SdkVersionMismatch { .. } => "SdkVersionMismatch",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::NoLocalizationMatch => "NoLocalizationMatch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_for_known_states() {
        for code in -10..=2 {
            assert_eq!(CloudAnchorState::from_code(code).code(), code);
        }
        assert_eq!(CloudAnchorState::from_code(-42), CloudAnchorState::Unknown(-42));
    }

    #[test]
    fn test_unknown_state_keeps_raw_code() {
        let failure = CloudAnchorState::from_code(-42).failure().unwrap();
        assert_eq!(failure, CloudFailure::Internal { raw_state: Some(-42) });
        assert!(failure.to_string().contains("-42"));
    }

    #[test]
    fn test_non_terminal_states() {
        assert!(!CloudAnchorState::None.is_terminal());
        assert!(!CloudAnchorState::TaskInProgress.is_terminal());
        assert!(CloudAnchorState::Success.is_terminal());
        assert!(CloudAnchorState::ErrorInternal.is_terminal());
        assert!(CloudAnchorState::Success.failure().is_none());
    }

    #[test]
    fn test_failure_mapping() {
        assert_eq!(
            CloudAnchorState::ErrorHostingServiceUnavailable.failure(),
            Some(CloudFailure::ServiceUnavailable)
        );
        assert_eq!(
            CloudAnchorState::ErrorResolvingSdkVersionTooNew.failure(),
            Some(CloudFailure::SdkVersionMismatch { too_new: true })
        );
        assert_eq!(
            CloudFailure::SdkVersionMismatch { too_new: false }.to_string(),
            "Resolving Sdk version too old"
        );
        assert_eq!(
            CloudAnchorState::ErrorHostingDatasetProcessingFailed.describe(),
            "Dataset processing failed, feature map insufficient"
        );
    }
}
