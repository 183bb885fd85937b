//! Framed transport plumbing shared by client sessions and helper links.
//!
//! Every stream skua writes to has exactly one writer task: a pump that
//! drains an unbounded channel and writes frames in order. Handlers hand
//! frames to the channel without awaiting, so fan-out never blocks the
//! engine, and per-receiver delivery stays FIFO.

use skua_wire::{Frame, WireError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// The sending side of a pumped stream.
pub type FrameTx = mpsc::UnboundedSender<Frame>;

/// Create a channel pair for a pumped stream.
pub fn channel() -> (FrameTx, mpsc::UnboundedReceiver<Frame>) {
    mpsc::unbounded_channel()
}

/// Drain `rx` into `writer` until the channel closes or a write fails.
///
/// When the channel closes (every sender dropped) the remaining queued
/// frames are flushed and the writer is shut down, which sends the TLS
/// close-notify on session streams. A write error is returned so the
/// caller can synthesize a disconnect.
pub async fn pump<W>(mut rx: mpsc::UnboundedReceiver<Frame>, mut writer: W) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        frame.write_to(&mut writer).await?;
    }
    writer.shutdown().await?;
    Ok(())
}
