//! Blocking facade over the async core.
//!
//! [`Connection`] and [`Stream`] mirror [`MuxConnection`] and
//! [`MuxStream`] but expose synchronous calls, backed by an owned tokio
//! runtime and `block_on()`. There is exactly one implementation of every
//! operation — the async one; this module only adds the calling
//! convention.
//!
//! ```text
//!  App thread (blocking)
//!       │
//!  Connection::open() / accept_stream() / Stream::read() / write()
//!       │  rt.block_on(...)
//!       ▼
//!  tokio Runtime (owned by Connection)
//!       └── MuxConnection (receive loop + send tasks)
//! ```

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;

use crate::connection::{MuxConfig, MuxConnection};
use crate::error::Result;
use crate::frame::StreamId;
use crate::stream::MuxStream;

/// One logical byte stream, blocking flavor.
///
/// Implements [`std::io::Read`] and [`std::io::Write`]; a read of 0 bytes
/// means the peer closed the stream.
pub struct Stream {
    inner: MuxStream,
    rt: Arc<Runtime>,
}

impl Stream {
    /// This stream's 128-bit identifier.
    pub fn id(&self) -> StreamId {
        self.inner.id()
    }

    /// Close the outbound direction. Idempotent; reads remain usable.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rt.block_on(self.inner.read(buf))
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rt.block_on(self.inner.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.rt.block_on(self.inner.flush())
    }
}

/// A multiplexed encrypted connection, blocking flavor.
pub struct Connection {
    inner: MuxConnection,
    rt: Arc<Runtime>,
}

impl Connection {
    /// Establish as the initiating side over `io`.
    ///
    /// `io` is any tokio-flavored duplex connection; construct it inside a
    /// closure so it is created on the owned runtime, e.g.
    /// `Connection::initiator(|| TcpStream::from_std(sock), config)`.
    pub fn initiator<S, F>(io: F, config: MuxConfig) -> Result<Self>
    where
        F: FnOnce() -> io::Result<S>,
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let rt = Arc::new(Runtime::new()?);
        let inner = rt.block_on(async {
            let io = io().map_err(crate::Error::from)?;
            MuxConnection::initiator(io, config).await
        })?;
        Ok(Self { inner, rt })
    }

    /// Establish as the responding side over `io`.
    pub fn responder<S, F>(io: F, config: MuxConfig) -> Result<Self>
    where
        F: FnOnce() -> io::Result<S>,
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let rt = Arc::new(Runtime::new()?);
        let inner = rt.block_on(async {
            let io = io().map_err(crate::Error::from)?;
            MuxConnection::responder(io, config).await
        })?;
        Ok(Self { inner, rt })
    }

    /// Open a new logical stream.
    pub fn open(&self) -> Result<Stream> {
        let inner = self.rt.block_on(self.inner.open())?;
        Ok(Stream {
            inner,
            rt: self.rt.clone(),
        })
    }

    /// Block until the peer opens a stream.
    pub fn accept_stream(&self) -> Result<Stream> {
        let inner = self.rt.block_on(self.inner.accept_stream())?;
        Ok(Stream {
            inner,
            rt: self.rt.clone(),
        })
    }

    /// Number of live logical streams.
    pub fn stream_count(&self) -> usize {
        self.rt.block_on(self.inner.stream_count())
    }

    /// Whether the connection has been disposed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Dispose the connection and every logical stream. Idempotent.
    pub fn close(&self) {
        self.rt.block_on(self.inner.close());
    }

    /// Block until disposal has fully finished.
    pub fn closed(&self) {
        self.rt.block_on(self.inner.closed());
    }
}
