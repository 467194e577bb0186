//! Frame definitions
//!
//! A [`Frame`] is a tagged union: its type selects exactly one payload. On the wire
//! it travels as a [`RawFrame`], a field-tagged map in which every payload is
//! optional, so [`RawFrame::validate`] is what enforces the type/payload pairing.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Frame validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("frame payload does not match frame type {0}")]
    BadPayload(FrameType),
}

/// Frame type tag as carried in the `ft` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Zero value, never valid on the wire
    Unknown = 0,
    /// agent -> relay, carries the service name and token
    HandshakeRequest = 1,
    /// relay -> agent
    HandshakeResponse = 2,
    /// relay -> agent, a new logical connection is waiting
    ConnectRequest = 3,
    /// agent -> relay, first frame of a new physical connection
    ConnectResponse = 4,
    /// both directions, empty data is a keepalive
    Data = 5,
    /// both directions
    DisconnectRequest = 6,
    /// both directions
    DisconnectResponse = 7,
    /// both directions, reserved at the top of the byte range
    Error = 0xff,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Unknown => "unknown",
            FrameType::HandshakeRequest => "handshake-request",
            FrameType::HandshakeResponse => "handshake-response",
            FrameType::ConnectRequest => "connect-request",
            FrameType::ConnectResponse => "connect-response",
            FrameType::Data => "data",
            FrameType::DisconnectRequest => "disconnect-request",
            FrameType::DisconnectResponse => "disconnect-response",
            FrameType::Error => "error",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameType::Unknown),
            1 => Ok(FrameType::HandshakeRequest),
            2 => Ok(FrameType::HandshakeResponse),
            3 => Ok(FrameType::ConnectRequest),
            4 => Ok(FrameType::ConnectResponse),
            5 => Ok(FrameType::Data),
            6 => Ok(FrameType::DisconnectRequest),
            7 => Ok(FrameType::DisconnectResponse),
            0xff => Ok(FrameType::Error),
            _ => Err(FrameError::UnknownFrameType(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(rename = "sn")]
    pub service_name: String,
    #[serde(rename = "st")]
    pub service_token: String,
}

// Payload-less variants are braced structs so they encode as an empty map
// rather than null, which would read back as an absent payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "cid")]
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(rename = "cid")]
    pub connection_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    #[serde(rename = "d", with = "byte_buf")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    #[serde(rename = "cid")]
    pub connection_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "e")]
    pub message: String,
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    Data(Data),
    DisconnectRequest(DisconnectRequest),
    DisconnectResponse(DisconnectResponse),
    Error(ErrorPayload),
}

impl Frame {
    pub fn handshake_request(
        service_name: impl Into<String>,
        service_token: impl Into<String>,
    ) -> Self {
        Frame::HandshakeRequest(HandshakeRequest {
            service_name: service_name.into(),
            service_token: service_token.into(),
        })
    }

    pub fn handshake_response() -> Self {
        Frame::HandshakeResponse(HandshakeResponse {})
    }

    pub fn connect_request(connection_id: impl Into<String>) -> Self {
        Frame::ConnectRequest(ConnectRequest {
            connection_id: connection_id.into(),
        })
    }

    pub fn connect_response(connection_id: impl Into<String>) -> Self {
        Frame::ConnectResponse(ConnectResponse {
            connection_id: connection_id.into(),
        })
    }

    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Frame::Data(Data { data: data.into() })
    }

    /// Empty data frame, used as ping/pong on idle connections
    pub fn keepalive() -> Self {
        Frame::Data(Data::default())
    }

    pub fn disconnect_request(connection_id: impl Into<String>) -> Self {
        Frame::DisconnectRequest(DisconnectRequest {
            connection_id: connection_id.into(),
        })
    }

    pub fn disconnect_response() -> Self {
        Frame::DisconnectResponse(DisconnectResponse {})
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::HandshakeRequest(_) => FrameType::HandshakeRequest,
            Frame::HandshakeResponse(_) => FrameType::HandshakeResponse,
            Frame::ConnectRequest(_) => FrameType::ConnectRequest,
            Frame::ConnectResponse(_) => FrameType::ConnectResponse,
            Frame::Data(_) => FrameType::Data,
            Frame::DisconnectRequest(_) => FrameType::DisconnectRequest,
            Frame::DisconnectResponse(_) => FrameType::DisconnectResponse,
            Frame::Error(_) => FrameType::Error,
        }
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, Frame::Data(payload) if payload.data.is_empty())
    }
}

/// Wire representation of a frame
///
/// Every payload is optional here; a well-formed frame has exactly the one
/// payload selected by `frame_type`. Unknown keys are ignored on decode so newer
/// peers can add payload variants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "ft")]
    pub frame_type: u8,
    #[serde(rename = "hr", default, skip_serializing_if = "Option::is_none")]
    pub handshake_request: Option<HandshakeRequest>,
    #[serde(rename = "hs", default, skip_serializing_if = "Option::is_none")]
    pub handshake_response: Option<HandshakeResponse>,
    #[serde(rename = "cr", default, skip_serializing_if = "Option::is_none")]
    pub connect_request: Option<ConnectRequest>,
    #[serde(rename = "cs", default, skip_serializing_if = "Option::is_none")]
    pub connect_response: Option<ConnectResponse>,
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    #[serde(rename = "dr", default, skip_serializing_if = "Option::is_none")]
    pub disconnect_request: Option<DisconnectRequest>,
    #[serde(rename = "ds", default, skip_serializing_if = "Option::is_none")]
    pub disconnect_response: Option<DisconnectResponse>,
    #[serde(rename = "err", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl RawFrame {
    /// Check that the declared type is known and that exactly its payload is present
    pub fn validate(&self) -> Result<FrameType, FrameError> {
        let frame_type = FrameType::try_from(self.frame_type)?;
        if frame_type == FrameType::Unknown {
            return Err(FrameError::UnknownFrameType(self.frame_type));
        }

        for (payload_type, present) in self.payload_presence() {
            if (payload_type == frame_type) != present {
                return Err(FrameError::BadPayload(frame_type));
            }
        }

        Ok(frame_type)
    }

    fn payload_presence(&self) -> [(FrameType, bool); 8] {
        [
            (FrameType::HandshakeRequest, self.handshake_request.is_some()),
            (FrameType::HandshakeResponse, self.handshake_response.is_some()),
            (FrameType::ConnectRequest, self.connect_request.is_some()),
            (FrameType::ConnectResponse, self.connect_response.is_some()),
            (FrameType::Data, self.data.is_some()),
            (FrameType::DisconnectRequest, self.disconnect_request.is_some()),
            (FrameType::DisconnectResponse, self.disconnect_response.is_some()),
            (FrameType::Error, self.error.is_some()),
        ]
    }
}

impl From<Frame> for RawFrame {
    fn from(frame: Frame) -> Self {
        let mut raw = RawFrame {
            frame_type: frame.frame_type() as u8,
            ..Default::default()
        };
        match frame {
            Frame::HandshakeRequest(p) => raw.handshake_request = Some(p),
            Frame::HandshakeResponse(p) => raw.handshake_response = Some(p),
            Frame::ConnectRequest(p) => raw.connect_request = Some(p),
            Frame::ConnectResponse(p) => raw.connect_response = Some(p),
            Frame::Data(p) => raw.data = Some(p),
            Frame::DisconnectRequest(p) => raw.disconnect_request = Some(p),
            Frame::DisconnectResponse(p) => raw.disconnect_response = Some(p),
            Frame::Error(p) => raw.error = Some(p),
        }
        raw
    }
}

impl TryFrom<RawFrame> for Frame {
    type Error = FrameError;

    fn try_from(raw: RawFrame) -> Result<Self, FrameError> {
        let frame_type = raw.validate()?;
        let bad = FrameError::BadPayload(frame_type);
        match frame_type {
            FrameType::HandshakeRequest => raw.handshake_request.map(Frame::HandshakeRequest),
            FrameType::HandshakeResponse => raw.handshake_response.map(Frame::HandshakeResponse),
            FrameType::ConnectRequest => raw.connect_request.map(Frame::ConnectRequest),
            FrameType::ConnectResponse => raw.connect_response.map(Frame::ConnectResponse),
            FrameType::Data => raw.data.map(Frame::Data),
            FrameType::DisconnectRequest => raw.disconnect_request.map(Frame::DisconnectRequest),
            FrameType::DisconnectResponse => raw.disconnect_response.map(Frame::DisconnectResponse),
            FrameType::Error => raw.error.map(Frame::Error),
            FrameType::Unknown => None,
        }
        .ok_or(bad)
    }
}

// Encode data as a CBOR byte string; accept either a byte string or an
// array of integers when decoding.
mod byte_buf {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_byte_buf(ByteBufVisitor)
    }

    struct ByteBufVisitor;

    impl<'de> Visitor<'de> for ByteBufVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}
