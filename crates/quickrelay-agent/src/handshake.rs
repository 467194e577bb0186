//! Agent side of the handshake

use crate::config::RelayOptions;
use futures::SinkExt;
use quickrelay_connection::{read_frame, TunnelError};
use quickrelay_proto::{CodecError, Frame};

/// Send the handshake request and wait for the relay's answer
pub async fn handshake<S>(conn: &mut S, options: &RelayOptions) -> Result<(), TunnelError>
where
    S: futures::Stream<Item = Result<Frame, CodecError>>
        + futures::Sink<Frame, Error = CodecError>
        + Unpin,
{
    conn.send(Frame::handshake_request(
        options.service_name.as_str(),
        options.service_token.as_str(),
    ))
    .await?;

    match read_frame(conn, options.handshake_timeout).await? {
        Frame::HandshakeResponse(_) => Ok(()),
        Frame::Error(payload) => Err(TunnelError::AuthenticationFailure(payload.message)),
        other => Err(TunnelError::Protocol(format!(
            "expected handshake response, got {}",
            other.frame_type()
        ))),
    }
}
