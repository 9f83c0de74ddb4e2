use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::audio::AssemblyError;
use crate::protocol::CodecError;
use crate::transport::ConnectionState;

/// Stable reason code carried in `syncRejected` / `syncFailed` and surfaced to observers
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "String", from = "String")]
pub enum FailureReason {
    Timeout,
    ChecksumMismatch,
    CallbackNotSet,
    PersistenceFailure,
    AppNotReady,
    InsufficientStorage,
    Cancelled,
    ConnectionLost,
    LeaseExpired,
    /// Any code this side does not know, kept verbatim
    Other(String),
}

impl FailureReason {
    pub fn code(&self) -> &str {
        match self {
            Self::Timeout => "timeout",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::CallbackNotSet => "callback_not_set",
            Self::PersistenceFailure => "persistence_failure",
            Self::AppNotReady => "app_not_ready",
            Self::InsufficientStorage => "insufficient_storage",
            Self::Cancelled => "cancelled",
            Self::ConnectionLost => "connection_lost",
            Self::LeaseExpired => "lease_expired",
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "timeout" => Self::Timeout,
            "checksum_mismatch" => Self::ChecksumMismatch,
            "callback_not_set" => Self::CallbackNotSet,
            "persistence_failure" => Self::PersistenceFailure,
            "app_not_ready" => Self::AppNotReady,
            "insufficient_storage" => Self::InsufficientStorage,
            "cancelled" => Self::Cancelled,
            "connection_lost" => Self::ConnectionLost,
            "lease_expired" => Self::LeaseExpired,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        reason.code().to_string()
    }
}

impl From<String> for FailureReason {
    fn from(code: String) -> Self {
        Self::from_code(&code)
    }
}

/// Errors from the sync protocol
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport cannot carry messages right now; retried on reachability change
    #[error("connection unavailable ({0})")]
    ConnectionUnavailable(ConnectionState),

    #[error("peer rejected the transfer: {reason}")]
    Rejected {
        reason: FailureReason,
        retry_after: Option<Duration>,
    },

    #[error("checksum mismatch: expected {expected}, received {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("operation timed out")]
    Timeout,

    #[error("no artifact sink registered; received data cannot be persisted")]
    CallbackNotConfigured,

    #[error("persistence failed: {0}")]
    PersistenceFailure(String),

    #[error(
        "partial data: {} chunks silence-filled{}",
        missing.len(),
        if *end_seen { "" } else { ", last chunk never arrived" }
    )]
    PartialData { missing: Vec<u32>, end_seen: bool },

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection lost during transfer")]
    ConnectionLost,

    #[error("background execution lease expired")]
    LeaseExpired,

    #[error("peer reported failure: {0}")]
    PeerFailed(FailureReason),

    #[error("a sync for recording {0} is already in flight")]
    AlreadyInFlight(String),

    #[error("no sync operation for recording {0}")]
    UnknownRecording(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error("sync service has stopped")]
    ServiceStopped,
}

impl SyncError {
    /// Wire reason for a terminal failure
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Rejected { reason, .. } | Self::PeerFailed(reason) => reason.clone(),
            Self::ChecksumMismatch { .. } => FailureReason::ChecksumMismatch,
            Self::Timeout => FailureReason::Timeout,
            Self::CallbackNotConfigured => FailureReason::CallbackNotSet,
            Self::PersistenceFailure(_) => FailureReason::PersistenceFailure,
            Self::Cancelled => FailureReason::Cancelled,
            Self::ConnectionLost | Self::ConnectionUnavailable(_) => FailureReason::ConnectionLost,
            Self::LeaseExpired => FailureReason::LeaseExpired,
            Self::PartialData { .. } => FailureReason::Other("partial_data".to_string()),
            Self::AlreadyInFlight(_) => FailureReason::Other("already_in_flight".to_string()),
            Self::UnknownRecording(_) => FailureReason::Other("unknown_recording".to_string()),
            Self::Codec(_) => FailureReason::Other("malformed_message".to_string()),
            Self::Assembly(_) => FailureReason::Other("assembly_error".to_string()),
            Self::ServiceStopped => FailureReason::Other("service_stopped".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_round_trip_through_strings() {
        for reason in [
            FailureReason::Timeout,
            FailureReason::ChecksumMismatch,
            FailureReason::CallbackNotSet,
            FailureReason::PersistenceFailure,
            FailureReason::AppNotReady,
            FailureReason::InsufficientStorage,
            FailureReason::LeaseExpired,
        ] {
            assert_eq!(FailureReason::from_code(reason.code()), reason);
        }
        assert_eq!(
            FailureReason::from_code("disk_on_fire"),
            FailureReason::Other("disk_on_fire".to_string())
        );
    }

    #[test]
    fn callback_missing_has_distinct_code() {
        assert_eq!(SyncError::CallbackNotConfigured.reason().code(), "callback_not_set");
        assert_eq!(
            SyncError::PersistenceFailure("disk full".to_string()).reason().code(),
            "persistence_failure"
        );
    }

    #[test]
    fn partial_data_says_whether_the_end_was_seen() {
        let gaps = SyncError::PartialData {
            missing: vec![2, 5],
            end_seen: true,
        };
        assert_eq!(gaps.to_string(), "partial data: 2 chunks silence-filled");
        assert_eq!(gaps.reason().code(), "partial_data");

        let truncated = SyncError::PartialData {
            missing: Vec::new(),
            end_seen: false,
        };
        assert_eq!(
            truncated.to_string(),
            "partial data: 0 chunks silence-filled, last chunk never arrived"
        );
    }
}
