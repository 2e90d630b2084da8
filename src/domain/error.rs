use serde::Serialize;
use thiserror::Error;

use super::mode::DeviceMode;

/// Per-device failure. Never fatal to the process; surfaces as a per-device outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceError {
    #[error("{method} timed out after {attempts} attempt(s)")]
    Timeout { method: String, attempts: u32 },
    #[error("{method} rejected after {attempts} attempt(s) (code {code}): {message}")]
    Rejected {
        method: String,
        attempts: u32,
        code: i64,
        message: String,
    },
    #[error("device unreachable: {detail}")]
    Unreachable { detail: String },
    #[error("malformed reply to {method}: {detail}")]
    Decode { method: String, detail: String },
    #[error("mode did not converge: expected {expected}, device reports {actual}")]
    VerificationFailed {
        expected: DeviceMode,
        actual: DeviceMode,
    },
}

impl DeviceError {
    pub fn decode(method: &str, detail: impl Into<String>) -> Self {
        DeviceError::Decode {
            method: method.to_string(),
            detail: detail.into(),
        }
    }

    /// Only timeouts and rejections are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeviceError::Timeout { .. } | DeviceError::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_and_rejected_retry() {
        let timeout = DeviceError::Timeout { method: "ES.GetMode".into(), attempts: 1 };
        let rejected = DeviceError::Rejected {
            method: "ES.SetMode".into(),
            attempts: 1,
            code: -1,
            message: "busy".into(),
        };
        assert!(timeout.is_retryable());
        assert!(rejected.is_retryable());
        assert!(!DeviceError::Unreachable { detail: "refused".into() }.is_retryable());
        assert!(!DeviceError::decode("ES.GetMode", "bad json").is_retryable());
    }
}
