//! Protocol frame model shared by the codec and the dispatchers.
//!
//! A [`ProtocolMessage`] is the unit exchanged with the realtime endpoint:
//! an action tag, optional serials, and an optional payload batch. Frames
//! whose action requires a server `Ack`/`Nack` are classified by
//! [`Action::ack_required`]; that classification drives the pending-queue
//! accounting in the connection subsystem.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Action tag carried by every protocol frame.
///
/// Encoded on the wire as an integer. Values the client does not know are
/// preserved as [`Action::Unknown`] so newer peers never break framing; the
/// incoming dispatcher logs and skips them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    /// An action code this client version does not understand.
    Unknown(u8),
}

impl Action {
    /// Wire code for this action.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Heartbeat => 0,
            Self::Ack => 1,
            Self::Nack => 2,
            Self::Connect => 3,
            Self::Connected => 4,
            Self::Disconnect => 5,
            Self::Disconnected => 6,
            Self::Close => 7,
            Self::Closed => 8,
            Self::Error => 9,
            Self::Attach => 10,
            Self::Attached => 11,
            Self::Detach => 12,
            Self::Detached => 13,
            Self::Presence => 14,
            Self::Message => 15,
            Self::Sync => 16,
            Self::Unknown(code) => code,
        }
    }

    /// Map a wire code back to an action, preserving unknown values.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Heartbeat,
            1 => Self::Ack,
            2 => Self::Nack,
            3 => Self::Connect,
            4 => Self::Connected,
            5 => Self::Disconnect,
            6 => Self::Disconnected,
            7 => Self::Close,
            8 => Self::Closed,
            9 => Self::Error,
            10 => Self::Attach,
            11 => Self::Attached,
            12 => Self::Detach,
            13 => Self::Detached,
            14 => Self::Presence,
            15 => Self::Message,
            16 => Self::Sync,
            other => Self::Unknown(other),
        }
    }

    /// Whether frames carrying this action must be acknowledged by the
    /// server with an `Ack` or `Nack`.
    #[must_use]
    pub const fn ack_required(self) -> bool {
        matches!(
            self,
            Self::Message | Self::Presence | Self::Close | Self::Attach | Self::Detach
        )
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_code)
    }
}

/// Error record attached to frames and state-change events.
///
/// Cloneable so a single failure can reject every awaiter it affects; the
/// numeric `code` follows the service's error code ranges (4xxxx request
/// errors, 5xxxx server errors, 8xxxx connection lifecycle).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Service-assigned error code.
    pub code: u32,
    /// HTTP-equivalent status code, when the server supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Human-readable description.
    pub message: String,
}

impl ErrorInfo {
    /// Build an error record from a code and message.
    #[must_use]
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code: None,
            message: message.into(),
        }
    }

    /// Request-class error (code 40000).
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(40000, message)
    }

    /// Authentication failure (code 40101).
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            code: 40101,
            status_code: Some(401),
            message: message.into(),
        }
    }

    /// Server-side failure (code 50000).
    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self {
            code: 50000,
            status_code: Some(500),
            message: message.into(),
        }
    }

    /// Transport-level connection failure (code 80000).
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(80000, message)
    }

    /// Connection dropped, retryable (code 80003).
    #[must_use]
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(80003, message)
    }

    /// Connection suspended after exhausted retries (code 80002).
    #[must_use]
    pub fn suspended(message: impl Into<String>) -> Self {
        Self::new(80002, message)
    }

    /// Pending traffic rejected by a generation change (code 80008).
    #[must_use]
    pub fn reset(message: impl Into<String>) -> Self {
        Self::new(80008, message)
    }

    /// Connection closed (code 80017).
    #[must_use]
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(80017, message)
    }

    /// Deadline elapsed (code 80014).
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(80014, message)
    }

    /// Whether the error is a request-class failure that retrying on another
    /// host cannot fix (authentication, malformed request).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        (40000..50000).contains(&self.code)
    }

    /// Whether the error indicates rejected credentials.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        (40100..40200).contains(&self.code)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for ErrorInfo {}

/// A single payload entry within a `Message`, `Presence` or `Sync` frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A protocol frame as sent to or received from the realtime endpoint.
///
/// All fields other than `action` are optional; absent fields are omitted on
/// encode and unknown inbound fields are accepted, so the type round-trips
/// through both negotiated wire formats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Client-assigned serial, present on ack-required frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    /// Server-assigned serial, present on every server frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Number of serials covered by an `Ack`/`Nack`, defaulting to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<PayloadMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ProtocolMessage {
    /// Create a frame with the given action and no other fields.
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            id: None,
            channel: None,
            msg_serial: None,
            connection_serial: None,
            connection_id: None,
            connection_key: None,
            count: None,
            timestamp: None,
            messages: None,
            error: None,
        }
    }

    /// Create a channel `Message` frame carrying a single payload.
    #[must_use]
    pub fn message(channel: impl Into<String>, payload: PayloadMessage) -> Self {
        let mut frame = Self::new(Action::Message);
        frame.channel = Some(channel.into());
        frame.messages = Some(vec![payload]);
        frame
    }

    /// Whether this frame must be acknowledged by the server.
    #[must_use]
    pub fn ack_required(&self) -> bool {
        self.action.ack_required()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Action::Heartbeat, false)]
    #[case(Action::Ack, false)]
    #[case(Action::Connected, false)]
    #[case(Action::Message, true)]
    #[case(Action::Presence, true)]
    #[case(Action::Close, true)]
    #[case(Action::Attach, true)]
    #[case(Action::Detach, true)]
    #[case(Action::Sync, false)]
    fn ack_classification_follows_action(#[case] action: Action, #[case] expected: bool) {
        assert_eq!(action.ack_required(), expected);
    }

    #[rstest]
    fn action_codes_round_trip() {
        for code in 0..=20u8 {
            assert_eq!(Action::from_code(code).code(), code);
        }
    }

    #[rstest]
    fn unrecognised_code_is_preserved() {
        assert_eq!(Action::from_code(200), Action::Unknown(200));
        assert!(!Action::Unknown(200).ack_required());
    }

    #[rstest]
    fn auth_errors_are_fatal() {
        let err = ErrorInfo::auth("token rejected");
        assert!(err.is_fatal());
        assert!(err.is_auth_error());
        assert!(!ErrorInfo::disconnected("gone").is_fatal());
    }
}
