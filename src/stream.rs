//! Channel-backed duplex byte stream.
//!
//! A [`MuxStream`] is the user-facing endpoint of a logical stream: an
//! ordinary `AsyncRead + AsyncWrite` object bridging two message queues.
//! The multiplexer holds the other ends — it pushes received payloads into
//! the inbound queue and drains the outbound queue onto the wire.
//!
//! Queues are unbounded by default (writes never wait); a bounded capacity
//! turns both directions into backpressured queues: the writer suspends in
//! `poll_write` until there is room, and the receive loop suspends pushing
//! inbound data until the reader catches up.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::frame::StreamId;

/// Outbound sender half as seen from `poll_write`.
enum ChunkSender {
    Bounded(PollSender<Bytes>),
    Unbounded(mpsc::UnboundedSender<Bytes>),
}

/// Receiver half usable from both poll and async contexts.
pub(crate) enum ChunkReceiver {
    Bounded(mpsc::Receiver<Bytes>),
    Unbounded(mpsc::UnboundedReceiver<Bytes>),
}

impl ChunkReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Bytes> {
        match self {
            ChunkReceiver::Bounded(rx) => rx.recv().await,
            ChunkReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        match self {
            ChunkReceiver::Bounded(rx) => rx.poll_recv(cx),
            ChunkReceiver::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

/// Sender half the multiplexer uses to deliver inbound payloads.
#[derive(Clone)]
pub(crate) enum InboundSender {
    Bounded(mpsc::Sender<Bytes>),
    Unbounded(mpsc::UnboundedSender<Bytes>),
}

impl InboundSender {
    /// Deliver one chunk. Returns false if the user endpoint is gone.
    ///
    /// Under a bounded configuration this suspends until the reader makes
    /// room — the multiplexer's head-of-line blocking point.
    pub(crate) async fn send(&self, chunk: Bytes) -> bool {
        match self {
            InboundSender::Bounded(tx) => tx.send(chunk).await.is_ok(),
            InboundSender::Unbounded(tx) => tx.send(chunk).is_ok(),
        }
    }
}

/// Multiplexer-side ends of a freshly created logical stream.
pub(crate) struct StreamChannels {
    pub(crate) inbound_tx: InboundSender,
    pub(crate) outbound_rx: ChunkReceiver,
}

/// Create a linked pair: the user endpoint and the multiplexer channels.
///
/// `capacity` of `None` builds unbounded queues (the default configuration);
/// `Some(n)` bounds both directions at `n` queued messages.
pub(crate) fn channel_pair(id: StreamId, capacity: Option<usize>) -> (MuxStream, StreamChannels) {
    let (inbound_tx, inbound_rx, outbound_tx, outbound_rx) = match capacity {
        Some(n) => {
            let (in_tx, in_rx) = mpsc::channel(n);
            let (out_tx, out_rx) = mpsc::channel(n);
            (
                InboundSender::Bounded(in_tx),
                ChunkReceiver::Bounded(in_rx),
                ChunkSender::Bounded(PollSender::new(out_tx)),
                ChunkReceiver::Bounded(out_rx),
            )
        }
        None => {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            (
                InboundSender::Unbounded(in_tx),
                ChunkReceiver::Unbounded(in_rx),
                ChunkSender::Unbounded(out_tx),
                ChunkReceiver::Unbounded(out_rx),
            )
        }
    };

    let stream = MuxStream {
        id,
        inbound: inbound_rx,
        pending: Bytes::new(),
        read_done: false,
        outbound: Some(outbound_tx),
    };
    let channels = StreamChannels {
        inbound_tx,
        outbound_rx,
    };
    (stream, channels)
}

/// One logical byte stream multiplexed over a shared connection.
///
/// Reading yields bytes in the order the peer wrote them; a smaller read
/// buffers the remainder of a larger queued chunk. Read returns 0 once the
/// stream is closed (explicit zero-length marker or queue completion).
/// Writing enqueues the buffer as one message; zero-length writes are
/// no-ops. `shutdown()` (or drop) closes the outbound direction, which the
/// peer observes as end-of-stream.
pub struct MuxStream {
    id: StreamId,
    inbound: ChunkReceiver,
    /// Remainder of the last queued chunk not yet consumed by the reader.
    pending: Bytes,
    read_done: bool,
    outbound: Option<ChunkSender>,
}

impl MuxStream {
    /// This stream's 128-bit identifier.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Close the stream without consuming it.
    ///
    /// Signals end-of-stream to the peer and unregisters the stream from
    /// the connection. Data already queued inbound remains readable; no
    /// further frames will be delivered. Idempotent.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("read_done", &self.read_done)
            .field("write_open", &self.outbound.is_some())
            .finish()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.pending.is_empty() {
                let n = usize::min(buf.remaining(), this.pending.len());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.read_done {
                // EOF: leave buf untouched
                return Poll::Ready(Ok(()));
            }

            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) if chunk.is_empty() => {
                    // Explicit end-of-stream marker, distinct from "no data
                    // yet" (Pending) and delivered ahead of queue completion
                    this.read_done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                }
                Poll::Ready(None) => {
                    this.read_done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let Some(sender) = this.outbound.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        };

        match sender {
            ChunkSender::Bounded(tx) => match tx.poll_reserve(cx) {
                Poll::Ready(Ok(())) => {
                    if tx.send_item(Bytes::copy_from_slice(buf)).is_err() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "stream closed",
                        )));
                    }
                    Poll::Ready(Ok(buf.len()))
                }
                Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream closed",
                ))),
                Poll::Pending => Poll::Pending,
            },
            ChunkSender::Unbounded(tx) => {
                if tx.send(Bytes::copy_from_slice(buf)).is_err() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "stream closed",
                    )));
                }
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Messages are handed to the send task on write; nothing to flush
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outbound = None;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn new_pair(capacity: Option<usize>) -> (MuxStream, StreamChannels) {
        channel_pair(StreamId::random(), capacity)
    }

    #[tokio::test]
    async fn test_write_enqueues_one_message() {
        let (mut stream, mut channels) = new_pair(None);
        stream.write_all(b"hello world").await.unwrap();
        let chunk = channels.outbound_rx.recv().await.unwrap();
        assert_eq!(&chunk[..], b"hello world");
    }

    #[tokio::test]
    async fn test_zero_length_write_is_noop() {
        let (mut stream, mut channels) = new_pair(None);
        stream.write_all(b"").await.unwrap();
        stream.write_all(b"data").await.unwrap();
        let chunk = channels.outbound_rx.recv().await.unwrap();
        assert_eq!(&chunk[..], b"data");
    }

    #[tokio::test]
    async fn test_partial_read_buffers_remainder() {
        let (mut stream, channels) = new_pair(None);
        assert!(channels.inbound_tx.send(Bytes::from_static(b"abcdef")).await);

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cd");

        let mut rest = Vec::new();
        drop(channels);
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }

    #[tokio::test]
    async fn test_reads_preserve_chunk_order() {
        let (mut stream, channels) = new_pair(None);
        assert!(channels.inbound_tx.send(Bytes::from_static(b"first ")).await);
        assert!(channels.inbound_tx.send(Bytes::from_static(b"second")).await);
        drop(channels);

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"first second");
    }

    #[tokio::test]
    async fn test_empty_chunk_is_eof_marker() {
        let (mut stream, channels) = new_pair(None);
        assert!(channels.inbound_tx.send(Bytes::from_static(b"tail")).await);
        assert!(channels.inbound_tx.send(Bytes::new()).await);
        // Sender deliberately kept alive: the marker alone must end the stream

        let mut all = vec![0u8; 16];
        let n = stream.read(&mut all).await.unwrap();
        assert_eq!(&all[..n], b"tail");
        assert_eq!(stream.read(&mut all).await.unwrap(), 0);
        // EOF is sticky
        assert_eq!(stream.read(&mut all).await.unwrap(), 0);
        drop(channels);
    }

    #[tokio::test]
    async fn test_queue_completion_is_eof() {
        let (mut stream, channels) = new_pair(None);
        drop(channels);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_waits_for_data() {
        let (mut stream, channels) = new_pair(None);
        let mut buf = [0u8; 8];
        // No data and not complete: the read must suspend, not return 0
        assert!(timeout(Duration::from_millis(50), stream.read(&mut buf))
            .await
            .is_err());
        assert!(channels.inbound_tx.send(Bytes::from_static(b"x")).await);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_completes_outbound_queue() {
        let (mut stream, mut channels) = new_pair(None);
        stream.write_all(b"last").await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(&channels.outbound_rx.recv().await.unwrap()[..], b"last");
        assert!(channels.outbound_rx.recv().await.is_none());

        // Idempotent, and writes after close fail
        stream.shutdown().await.unwrap();
        assert!(stream.write_all(b"nope").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_completes_outbound_queue() {
        let (stream, mut channels) = new_pair(None);
        drop(stream);
        assert!(channels.outbound_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_bounded_write_backpressure() {
        let (mut stream, mut channels) = new_pair(Some(1));

        stream.write_all(b"one").await.unwrap();
        // Queue full: the next write must suspend until the reader drains
        assert!(timeout(Duration::from_millis(50), stream.write_all(b"two"))
            .await
            .is_err());

        assert_eq!(&channels.outbound_rx.recv().await.unwrap()[..], b"one");
        timeout(Duration::from_millis(200), stream.write_all(b"two"))
            .await
            .expect("write should proceed once capacity frees up")
            .unwrap();
        assert_eq!(&channels.outbound_rx.recv().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_write_fails_when_receiver_gone() {
        let (mut stream, channels) = new_pair(None);
        drop(channels);
        assert!(stream.write_all(b"data").await.is_err());
    }
}
