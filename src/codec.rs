//! Negotiated wire-format encoding for protocol frames.
//!
//! The handshake negotiates one of two formats for the whole session; every
//! frame on the transport is a single [`ProtocolMessage`] encoded in that
//! format. Both formats satisfy `decode(f, &encode(f, m)) == m` and accept
//! unknown fields from newer servers.

use bytes::Bytes;

use crate::{error::Error, protocol::ProtocolMessage};

/// Wire format negotiated during the connection handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// MessagePack binary frames.
    MsgPack,
}

impl WireFormat {
    /// Value sent in the `format` handshake parameter.
    #[must_use]
    pub const fn query_value(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        }
    }
}

/// Encode a frame in the given format.
///
/// # Errors
///
/// Returns [`Error::ProtocolViolation`] if the frame cannot be serialized.
pub fn encode(format: WireFormat, message: &ProtocolMessage) -> Result<Bytes, Error> {
    let bytes = match format {
        WireFormat::Json => serde_json::to_vec(message)
            .map_err(|err| Error::ProtocolViolation(format!("json encode failed: {err}")))?,
        WireFormat::MsgPack => rmp_serde::to_vec_named(message)
            .map_err(|err| Error::ProtocolViolation(format!("msgpack encode failed: {err}")))?,
    };
    Ok(Bytes::from(bytes))
}

/// Decode a frame in the given format.
///
/// # Errors
///
/// Returns [`Error::ProtocolViolation`] if the bytes are not a valid frame.
pub fn decode(format: WireFormat, bytes: &[u8]) -> Result<ProtocolMessage, Error> {
    match format {
        WireFormat::Json => serde_json::from_slice(bytes)
            .map_err(|err| Error::ProtocolViolation(format!("json decode failed: {err}"))),
        WireFormat::MsgPack => rmp_serde::from_slice(bytes)
            .map_err(|err| Error::ProtocolViolation(format!("msgpack decode failed: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::protocol::{Action, ErrorInfo, PayloadMessage};

    fn sample_frame() -> ProtocolMessage {
        let mut frame = ProtocolMessage::message(
            "ticker",
            PayloadMessage {
                id: Some("m0".into()),
                name: Some("update".into()),
                client_id: None,
                data: Some(serde_json::json!({"bid": 41, "ask": [42, true]})),
            },
        );
        frame.msg_serial = Some(7);
        frame.connection_serial = Some(-1);
        frame.error = Some(ErrorInfo::new(40000, "example"));
        frame
    }

    #[rstest]
    #[case(WireFormat::Json)]
    #[case(WireFormat::MsgPack)]
    fn frame_round_trips(#[case] format: WireFormat) {
        let frame = sample_frame();
        let bytes = encode(format, &frame).expect("encode");
        let decoded = decode(format, &bytes).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[rstest]
    fn unknown_fields_are_accepted() {
        let raw = br#"{"action":0,"flags":3,"auth":{"x":1}}"#;
        let decoded = decode(WireFormat::Json, raw).expect("decode");
        assert_eq!(decoded.action, Action::Heartbeat);
    }

    #[rstest]
    fn unknown_action_decodes_to_opaque_variant() {
        let raw = br#"{"action":99}"#;
        let decoded = decode(WireFormat::Json, raw).expect("decode");
        assert_eq!(decoded.action, Action::Unknown(99));
    }

    #[rstest]
    fn garbage_is_rejected(#[values(WireFormat::Json, WireFormat::MsgPack)] format: WireFormat) {
        assert!(matches!(
            decode(format, b"\xc1\xff not a frame"),
            Err(Error::ProtocolViolation(_))
        ));
    }

    proptest! {
        #[test]
        fn any_ack_frame_round_trips(serial in -1i64..=1 << 40, count in 1u32..64, json in prop::bool::ANY) {
            let mut frame = ProtocolMessage::new(Action::Ack);
            frame.msg_serial = Some(serial);
            frame.count = Some(count);
            let format = if json { WireFormat::Json } else { WireFormat::MsgPack };
            let bytes = encode(format, &frame).unwrap();
            prop_assert_eq!(decode(format, &bytes).unwrap(), frame);
        }
    }
}
