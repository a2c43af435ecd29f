use thiserror::Error;

use crate::db::models::JobState;

/// Failures reported by a scoreboard gateway. Retrying is the caller's call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("scoreboard unavailable: {0}")]
    Unavailable(String),

    #[error("scoreboard rate limited: {0}")]
    RateLimited(String),

    #[error("scoreboard returned a bad response: {0}")]
    BadResponse(String),
}

impl GatewayError {
    /// Outages and rate limits may clear on their own; bad payloads will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::RateLimited(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::BadResponse(_) => "bad_response",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("stored credential cannot be decrypted with the current secret")]
    InvalidCredential,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("pick job #{job_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        job_id: i64,
        from: JobState,
        to: JobState,
    },

    #[error("pick job #{job_id}: claim held by {owner:?}, not by us")]
    ClaimLost { job_id: i64, owner: Option<String> },

    #[error("pick job #{0} not found")]
    NotFound(i64),
}

/// Outcome of a failed pick-generation call.
#[derive(Debug, Error)]
pub enum PickError {
    /// Timeouts, rate limits, upstream 5xx: worth another attempt.
    #[error("transient pick failure: {0}")]
    Transient(String),

    /// Bad key, malformed request: retrying cannot help.
    #[error("permanent pick failure: {0}")]
    Permanent(String),
}

impl PickError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PickError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_retryable_kinds() {
        assert!(GatewayError::Unavailable("timeout".into()).is_retryable());
        assert!(GatewayError::RateLimited("429".into()).is_retryable());
        assert!(!GatewayError::BadResponse("not json".into()).is_retryable());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = QueueError::InvalidTransition {
            job_id: 7,
            from: JobState::Succeeded,
            to: JobState::Claimed,
        };
        assert_eq!(err.to_string(), "pick job #7: illegal transition succeeded -> claimed");
    }
}
