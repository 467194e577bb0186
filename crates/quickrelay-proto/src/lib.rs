//! QuickRelay wire protocol
//!
//! This crate defines the frames exchanged between a relay server and its agents,
//! and the length-delimited codec used to carry them over a byte stream.

pub mod codec;
pub mod frame;

pub use codec::{CodecError, FrameCodec};
pub use frame::{
    ConnectRequest, ConnectResponse, Data, DisconnectRequest, DisconnectResponse, ErrorPayload,
    Frame, FrameError, FrameType, HandshakeRequest, HandshakeResponse, RawFrame,
};

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the big-endian length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 4;
