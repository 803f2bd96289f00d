//! An in-memory datagram channel standing in for the tun device.
//!
//! The stack-side halves implement `AsyncRead`/`AsyncWrite` with datagram
//! semantics: each queued `Vec<u8>` is delivered by exactly one read call,
//! and every write call forwards exactly one datagram, the same contract a
//! tun file descriptor gives.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Reading half handed to the stack.
pub struct PeerReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Writing half handed to the stack.
pub struct PeerWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// The test's side of the channel.
pub struct Peer {
    /// Inject datagrams into the stack.
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Observe datagrams the stack emits.
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Build a connected (stack reader, stack writer, peer) triple.
pub fn datagram_channel() -> (PeerReader, PeerWriter, Peer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        PeerReader { rx: in_rx },
        PeerWriter { tx: out_tx },
        Peer {
            tx: in_tx,
            rx: out_rx,
        },
    )
}

impl AsyncRead for PeerReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                Poll::Ready(Ok(()))
            }
            // Channel closed: a zero-length read signals EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for PeerWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.tx.send(buf.to_vec()).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer hung up",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
