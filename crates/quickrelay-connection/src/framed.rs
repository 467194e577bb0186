//! Framing helpers

use crate::TunnelError;
use futures::{Stream, StreamExt};
use quickrelay_proto::{CodecError, Frame, FrameCodec};
use quickrelay_transport::BoxedStream;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// A physical connection carrying frames
pub type FramedStream = Framed<BoxedStream, FrameCodec>;

pub fn framed<S>(stream: S) -> Framed<S, FrameCodec>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(stream, FrameCodec::new())
}

/// Read exactly one frame, failing if none arrives within `timeout`
pub async fn read_frame<S>(frames: &mut S, timeout: Duration) -> Result<Frame, TunnelError>
where
    S: Stream<Item = Result<Frame, CodecError>> + Unpin,
{
    match tokio::time::timeout(timeout, frames.next()).await {
        Ok(Some(Ok(frame))) => Ok(frame),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) => Err(TunnelError::PeerDisconnected),
        Err(_) => Err(TunnelError::Transport(format!(
            "no frame received within {:?}",
            timeout
        ))),
    }
}
