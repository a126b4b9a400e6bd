//! Error payloads exchanged with peers.
//!
//! Every fatal protocol condition is reported to the peer as an
//! [`ErrorPayload`] before the connection is closed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolErrorCode {
    // Handshake
    VersionIncompatible,
    HandshakeRequired,
    HandshakeTimeout,
    SessionSuperseded,

    // Channel
    SequenceViolation,
    GapOverflow,
    GapTimeout,

    // Operational
    Overloaded,
    Shutdown,
    Internal,

    // Request / framing
    InvalidRequest,
    MalformedPayload,
    FrameTooLarge,

    // Application
    TransactionFailed,
    LockProtocol,
}

impl ProtocolErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolErrorCode::VersionIncompatible => "version_incompatible",
            ProtocolErrorCode::HandshakeRequired => "handshake_required",
            ProtocolErrorCode::HandshakeTimeout => "handshake_timeout",
            ProtocolErrorCode::SessionSuperseded => "session_superseded",
            ProtocolErrorCode::SequenceViolation => "sequence_violation",
            ProtocolErrorCode::GapOverflow => "gap_overflow",
            ProtocolErrorCode::GapTimeout => "gap_timeout",
            ProtocolErrorCode::Overloaded => "overloaded",
            ProtocolErrorCode::Shutdown => "shutdown",
            ProtocolErrorCode::Internal => "internal",
            ProtocolErrorCode::InvalidRequest => "invalid_request",
            ProtocolErrorCode::MalformedPayload => "malformed_payload",
            ProtocolErrorCode::FrameTooLarge => "frame_too_large",
            ProtocolErrorCode::TransactionFailed => "transaction_failed",
            ProtocolErrorCode::LockProtocol => "lock_protocol",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let code = match raw {
            "version_incompatible" => ProtocolErrorCode::VersionIncompatible,
            "handshake_required" => ProtocolErrorCode::HandshakeRequired,
            "handshake_timeout" => ProtocolErrorCode::HandshakeTimeout,
            "session_superseded" => ProtocolErrorCode::SessionSuperseded,
            "sequence_violation" => ProtocolErrorCode::SequenceViolation,
            "gap_overflow" => ProtocolErrorCode::GapOverflow,
            "gap_timeout" => ProtocolErrorCode::GapTimeout,
            "overloaded" => ProtocolErrorCode::Overloaded,
            "shutdown" => ProtocolErrorCode::Shutdown,
            "internal" => ProtocolErrorCode::Internal,
            "invalid_request" => ProtocolErrorCode::InvalidRequest,
            "malformed_payload" => ProtocolErrorCode::MalformedPayload,
            "frame_too_large" => ProtocolErrorCode::FrameTooLarge,
            "transaction_failed" => ProtocolErrorCode::TransactionFailed,
            "lock_protocol" => ProtocolErrorCode::LockProtocol,
            _ => return None,
        };
        Some(code)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ProtocolErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: ProtocolErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            details: None,
        }
    }

    pub fn with_details<T: Serialize>(mut self, details: T) -> Self {
        self.details = match serde_json::to_value(details) {
            Ok(Value::Null) | Err(_) => None,
            Ok(value) => Some(value),
        };
        self
    }

    pub fn details_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.details {
            Some(value) => serde_json::from_value(value.clone()).map(Some),
            None => Ok(None),
        }
    }
}

pub mod details {
    //! Structured `details` bodies attached to error payloads.

    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct VersionIncompatibleDetails {
        pub client_version: String,
        pub server_version: String,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FrameTooLargeDetails {
        pub max_frame_bytes: u64,
        pub got_bytes: u64,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InvalidRequestDetails {
        pub field: Option<String>,
        pub reason: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SequenceViolationDetails {
        pub expected_at_least: u64,
        pub got: u64,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TransactionFailedDetails {
        pub txn_id: u64,
        pub sequence_id: u64,
    }
}
