// ABOUTME: Typed gateway errors surfaced on both transports.
// ABOUTME: Wire shape is {code, message, retryable?, retryAfterMs?}.

use serde::{Deserialize, Serialize};

/// Error codes shared by the socket and bridge protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Caller (bridge node) is not paired/verified.
    #[serde(rename = "NOT_LINKED")]
    NotLinked,
    /// agent.wait (or a transport-level wait) expired before the run finished.
    #[serde(rename = "AGENT_TIMEOUT")]
    AgentTimeout,
    /// Malformed params or a request that fails validation.
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    /// The gateway cannot serve the request right now.
    #[serde(rename = "UNAVAILABLE")]
    Unavailable,
    /// Send policy denied the request.
    #[serde(rename = "SEND_BLOCKED")]
    SendBlocked,
    /// Cross-run conflict on one session (queue full).
    #[serde(rename = "CONFLICT")]
    Conflict,
}

/// A structured, wire-serializable gateway error.
///
/// Validation errors never create run records; policy denials are surfaced in
/// the response, never silently dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn send_blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SendBlocked, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn not_linked(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotLinked, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            retryable: Some(true),
            ..Self::new(ErrorCode::Unavailable, message)
        }
    }

    pub fn agent_timeout(message: impl Into<String>) -> Self {
        Self {
            retryable: Some(true),
            ..Self::new(ErrorCode::AgentTimeout, message)
        }
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retryable = Some(true);
        self.retry_after_ms = Some(ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let err = GatewayError::agent_timeout("run did not finish").with_retry_after(1500);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "AGENT_TIMEOUT");
        assert_eq!(json["retryable"], true);
        assert_eq!(json["retryAfterMs"], 1500);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let err = GatewayError::invalid_request("bad params");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "INVALID_REQUEST");
        assert!(json.get("retryable").is_none());
        assert!(json.get("retryAfterMs").is_none());
    }
}
