//! Frame writer task
//!
//! Owns the sink half of a physical connection. Frames are queued through an
//! mpsc channel; when nothing has been written for the keepalive interval an
//! empty data frame goes out instead. The task ends, closing the sink, once
//! every sender is dropped or a write fails.

use futures::{Sink, SinkExt};
use quickrelay_proto::{CodecError, Frame};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Frames buffered ahead of the writer
const WRITER_QUEUE: usize = 64;

pub fn spawn_writer<S>(mut sink: S, interval: Duration) -> (mpsc::Sender<Frame>, JoinHandle<()>)
where
    S: Sink<Frame, Error = CodecError> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(WRITER_QUEUE);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    if let Err(e) = sink.send(frame).await {
                        debug!("Frame write failed: {}", e);
                        break;
                    }
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    if let Err(e) = sink.send(Frame::keepalive()).await {
                        debug!("Keepalive write failed: {}", e);
                        break;
                    }
                    trace!("Sent keepalive");
                }
            }
        }

        let _ = sink.close().await;
    });

    (tx, handle)
}
