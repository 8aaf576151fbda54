//! Connection multiplexer.
//!
//! One [`MuxConnection`] owns an encrypted duplex connection and frames
//! many logical byte streams over it:
//!
//! ```text
//!  caller                      caller                  peer-initiated
//!    │ open()                    │ read/write             │ accept_stream()
//!    ▼                           ▼                        ▼
//!  ┌──────────── stream table (table mutex) ─────────────────┐
//!  │  id ─► inbound queue sender        (one entry per stream)│
//!  └──────────────────────────────────────────────────────────┘
//!    ▲                           │
//!    │ receive loop (single      │ send task (one per stream,
//!    │ reader of the cipher      │ writes frames under the
//!    │ read half)                │ single write mutex)
//!    ▼                           ▼
//!  ┌───────────── encrypted physical connection ─────────────┐
//! ```
//!
//! The receive loop is the one place frames enter, so a stream whose
//! reader stops draining a bounded inbound queue stalls demultiplexing for
//! every other stream on the connection. That head-of-line blocking is an
//! accepted cost of the single-reader design.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::cipher::{CipherRead, CipherWrite};
use crate::codec::SizePrefix;
use crate::error::{Error, Result};
use crate::frame::{Frame, StreamId, DEFAULT_MAX_CHUNK};
use crate::handshake::{self, CryptoConfig, Role};
use crate::stream::{channel_pair, ChunkReceiver, InboundSender, MuxStream};

type BoxedRead = CipherRead<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWrite = CipherWrite<Box<dyn AsyncWrite + Send + Unpin>>;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum payload bytes per frame; larger writes are chunked.
    pub max_chunk: usize,
    /// Per-direction queue bound for each logical stream.
    /// `None` (default) builds unbounded queues: writes never wait, and a
    /// slow reader buffers without limit. `Some(n)` enables backpressure.
    pub capacity: Option<usize>,
    /// Length-prefix encoding for frame payloads.
    pub length_prefix: SizePrefix,
    /// Handshake and transport cipher parameters.
    pub crypto: CryptoConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_chunk: DEFAULT_MAX_CHUNK,
            capacity: None,
            length_prefix: SizePrefix::U16,
            crypto: CryptoConfig::default(),
        }
    }
}

/// Shared multiplexer state: stream table, write half, lifecycle tokens.
struct Shared {
    config: MuxConfig,
    /// Stream table. Registration, identifier minting, and removal all
    /// happen under this mutex.
    table: Mutex<HashMap<StreamId, InboundSender>>,
    /// Single write mutex: every frame write goes through here.
    writer: Mutex<BoxedWrite>,
    /// Peer-initiated streams, exactly one per unseen identifier.
    incoming_tx: mpsc::UnboundedSender<MuxStream>,
    /// Cancels the receive loop and all send tasks.
    cancel: CancellationToken,
    /// Fired once, after teardown finishes.
    disposed: CancellationToken,
    disposing: AtomicBool,
}

/// A multiplexed, encrypted connection over one duplex byte stream.
///
/// Created with [`initiator`](MuxConnection::initiator) or
/// [`responder`](MuxConnection::responder), which perform the handshake
/// and start the receive loop. Either role may then [`open`]
/// (MuxConnection::open) streams and accept peer-initiated ones.
pub struct MuxConnection {
    shared: Arc<Shared>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<MuxStream>>,
}

impl MuxConnection {
    /// Establish as the initiating side (generates the symmetric secret).
    pub async fn initiator<S>(io: S, config: MuxConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(io, Role::Initiator, config).await
    }

    /// Establish as the responding side (generates the ephemeral keypair).
    pub async fn responder<S>(io: S, config: MuxConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(io, Role::Responder, config).await
    }

    async fn establish<S>(mut io: S, role: Role, config: MuxConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if config.max_chunk == 0 || config.max_chunk > config.length_prefix.max_encodable() {
            return Err(Error::Config(format!(
                "max_chunk {} does not fit the {:?} length prefix",
                config.max_chunk, config.length_prefix
            )));
        }
        if config.capacity == Some(0) {
            return Err(Error::Config("queue capacity must be at least 1".to_string()));
        }

        let ciphers = handshake::handshake(&mut io, role, &config.crypto).await?;

        let (read_half, write_half) = tokio::io::split(io);
        let reader = CipherRead::new(
            Box::new(read_half) as Box<dyn AsyncRead + Send + Unpin>,
            ciphers.read,
        );
        let writer = CipherWrite::new(
            Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>,
            ciphers.write,
        );

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            table: Mutex::new(HashMap::new()),
            writer: Mutex::new(writer),
            incoming_tx,
            cancel: CancellationToken::new(),
            disposed: CancellationToken::new(),
            disposing: AtomicBool::new(false),
        });

        tokio::spawn(receive_loop(shared.clone(), reader));

        Ok(Self {
            shared,
            incoming_rx: Mutex::new(incoming_rx),
        })
    }

    /// Open a new logical stream.
    ///
    /// Mints a fresh identifier, registers the stream, and starts its send
    /// task. Performs no network I/O, so it never blocks on the peer; the
    /// peer learns of the stream when its first frame arrives.
    pub async fn open(&self) -> Result<MuxStream> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let mut table = self.shared.table.lock().await;
        let mut id = StreamId::random();
        while table.contains_key(&id) {
            id = StreamId::random();
        }

        let (stream, channels) = channel_pair(id, self.shared.config.capacity);
        table.insert(id, channels.inbound_tx);
        tokio::spawn(send_task(self.shared.clone(), id, channels.outbound_rx));
        drop(table);

        debug!("opened stream {}", id);
        Ok(stream)
    }

    /// Wait for the next peer-initiated stream.
    ///
    /// Yields each incoming stream exactly once, in arrival order. Returns
    /// [`Error::ConnectionClosed`] after disposal once the queue drains.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut rx = self.incoming_rx.lock().await;
        rx.recv().await.ok_or(Error::ConnectionClosed)
    }

    /// Number of live logical streams.
    pub async fn stream_count(&self) -> usize {
        self.shared.table.lock().await.len()
    }

    /// Whether the connection has been disposed (or disposal has begun).
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Dispose the connection: close every logical stream and the physical
    /// connection. Idempotent; safe to call concurrently.
    pub async fn close(&self) {
        dispose(self.shared.clone()).await;
    }

    /// Resolves once, after disposal has fully torn the connection down.
    pub async fn closed(&self) {
        self.shared.disposed.cancelled().await;
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        // Wakes the receive loop, which runs the full disposal
        self.shared.cancel.cancel();
    }
}

/// Tear down the connection. Runs at most once; later calls wait on the
/// disposed token if they need completion.
async fn dispose(shared: Arc<Shared>) {
    if shared.disposing.swap(true, Ordering::SeqCst) {
        return;
    }
    shared.cancel.cancel();

    // Dropping every inbound sender completes the streams' read sides;
    // send tasks exit on the cancelled token, completing the write sides.
    let mut table = shared.table.lock().await;
    let streams = table.len();
    table.clear();
    drop(table);

    let mut writer = shared.writer.lock().await;
    if let Err(e) = writer.shutdown().await {
        trace!("connection shutdown: {}", e);
    }
    drop(writer);

    debug!("connection disposed ({} streams closed)", streams);
    shared.disposed.cancel();
}

/// Single receive loop: reads frames off the encrypted connection and
/// routes them to per-stream inbound queues, creating streams for unseen
/// identifiers. Any error disposes the whole connection.
async fn receive_loop(shared: Arc<Shared>, mut reader: BoxedRead) {
    if let Err(e) = run_receive(&shared, &mut reader).await {
        match e {
            Error::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("connection closed by peer")
            }
            e => error!("receive loop failed: {}", e),
        }
    }
    dispose(shared).await;
}

async fn run_receive(shared: &Arc<Shared>, reader: &mut BoxedRead) -> Result<()> {
    let prefix = shared.config.length_prefix;
    let max_chunk = shared.config.max_chunk;

    loop {
        let frame = tokio::select! {
            frame = Frame::read_from(reader, prefix, max_chunk) => frame?,
            _ = shared.cancel.cancelled() => return Ok(()),
        };
        trace!("rx frame: stream={} len={}", frame.id, frame.payload.len());

        // Lookup-or-insert and the new-stream announcement happen under
        // the table mutex, atomically with respect to concurrent open()
        let inbound = {
            let mut table = shared.table.lock().await;
            match table.entry(frame.id) {
                Entry::Occupied(entry) => {
                    if frame.is_close() {
                        // Remote close: complete the read side and free
                        // the identifier by taking the sender out
                        entry.remove()
                    } else {
                        entry.get().clone()
                    }
                }
                Entry::Vacant(slot) => {
                    let (stream, channels) = channel_pair(frame.id, shared.config.capacity);
                    let inbound = channels.inbound_tx.clone();
                    if !frame.is_close() {
                        slot.insert(channels.inbound_tx);
                    }
                    tokio::spawn(send_task(shared.clone(), frame.id, channels.outbound_rx));
                    debug!("incoming stream {}", frame.id);
                    if shared.incoming_tx.send(stream).is_err() {
                        trace!("incoming stream {} dropped: connection handle gone", frame.id);
                    }
                    inbound
                }
            }
        };

        // Delivery happens outside the table mutex: a bounded queue may
        // suspend here (head-of-line), but open() stays unblocked
        let closing = frame.is_close();
        let delivered = tokio::select! {
            delivered = inbound.send(frame.payload) => delivered,
            _ = shared.cancel.cancelled() => return Ok(()),
        };
        if !delivered && !closing {
            trace!("dropping frame for closed stream {}", frame.id);
        }
        // For a close frame the sender drops here, completing the queue
    }
}

/// Per-stream send routine: drains the outbound queue onto the wire,
/// chunking to the frame payload limit. On queue completion writes the
/// zero-length close frame and unregisters the stream; on write failure
/// disposes the connection.
async fn send_task(shared: Arc<Shared>, id: StreamId, mut outbound: ChunkReceiver) {
    match run_send(&shared, id, &mut outbound).await {
        Ok(()) => {
            shared.table.lock().await.remove(&id);
        }
        // A write interrupted by disposal needs no second teardown
        Err(Error::ConnectionClosed) => {}
        Err(e) => {
            warn!("send task for stream {} failed: {}", id, e);
            dispose(shared).await;
        }
    }
}

async fn run_send(shared: &Arc<Shared>, id: StreamId, outbound: &mut ChunkReceiver) -> Result<()> {
    let prefix = shared.config.length_prefix;
    let max_chunk = shared.config.max_chunk;

    loop {
        let message = tokio::select! {
            message = outbound.recv() => message,
            _ = shared.cancel.cancelled() => return Ok(()),
        };

        match message {
            Some(data) => {
                for piece in data.chunks(max_chunk) {
                    let encoded = Frame::data(id, data.slice_ref(piece)).encode(prefix, max_chunk)?;
                    write_encoded(shared, &encoded).await?;
                    trace!("tx frame: stream={} len={}", id, piece.len());
                }
            }
            None => {
                // Local close: one final zero-length frame
                let encoded = Frame::close(id).encode(prefix, max_chunk)?;
                write_encoded(shared, &encoded).await?;
                debug!("closed stream {}", id);
                return Ok(());
            }
        }
    }
}

/// Write one encoded frame under the write mutex, bailing out promptly if
/// the connection is being disposed.
async fn write_encoded(shared: &Arc<Shared>, encoded: &[u8]) -> Result<()> {
    tokio::select! {
        result = async {
            let mut writer = shared.writer.lock().await;
            writer.write_all(encoded).await?;
            writer.flush().await
        } => result.map_err(Error::from),
        _ = shared.cancel.cancelled() => Err(Error::ConnectionClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::BlockCipherKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> MuxConfig {
        MuxConfig {
            crypto: CryptoConfig {
                rsa_bits: 1024,
                ..CryptoConfig::default()
            },
            ..MuxConfig::default()
        }
    }

    async fn connected_pair(config: MuxConfig) -> (MuxConnection, MuxConnection) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let config_b = config.clone();
        let (ca, cb) = tokio::join!(
            MuxConnection::initiator(a, config),
            MuxConnection::responder(b, config_b),
        );
        (ca.unwrap(), cb.unwrap())
    }

    #[tokio::test]
    async fn test_open_write_read_close() {
        let (client, server) = connected_pair(test_config()).await;

        let mut stream = client.open().await.unwrap();
        stream.write_all(b"hello over the mux").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut peer = server.accept_stream().await.unwrap();
        assert_eq!(peer.id(), stream.id());

        let mut got = Vec::new();
        peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello over the mux");
    }

    #[tokio::test]
    async fn test_bidirectional_traffic() {
        let (client, server) = connected_pair(test_config()).await;

        let mut up = client.open().await.unwrap();
        up.write_all(b"ping").await.unwrap();

        let mut down = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        down.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        down.write_all(b"pong").await.unwrap();
        up.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_large_write_is_chunked_and_reassembled() {
        let (client, server) = connected_pair(test_config()).await;

        // Nearly 5 frames worth in a single write
        let payload: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let mut stream = client.open().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut peer = server.accept_stream().await.unwrap();
        let mut got = Vec::new();
        peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_cipher_kind_aes128() {
        let config = MuxConfig {
            crypto: CryptoConfig {
                rsa_bits: 1024,
                secret_len: 16,
                block_cipher: BlockCipherKind::Aes128,
            },
            ..MuxConfig::default()
        };
        let (client, server) = connected_pair(config).await;

        let mut stream = client.open().await.unwrap();
        stream.write_all(b"aes-128 path").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut peer = server.accept_stream().await.unwrap();
        let mut got = Vec::new();
        peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"aes-128 path");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_io() {
        let (a, _b) = tokio::io::duplex(1024);
        let config = MuxConfig {
            crypto: CryptoConfig {
                secret_len: 16,
                block_cipher: BlockCipherKind::Aes256,
                ..CryptoConfig::default()
            },
            ..MuxConfig::default()
        };
        assert!(matches!(
            MuxConnection::initiator(a, config).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_max_chunk_must_fit_length_prefix() {
        let (a, _b) = tokio::io::duplex(1024);
        let config = MuxConfig {
            max_chunk: 300,
            length_prefix: SizePrefix::U8,
            ..test_config()
        };
        assert!(matches!(
            MuxConnection::initiator(a, config).await,
            Err(Error::Config(_))
        ));

        let (a, _b) = tokio::io::duplex(1024);
        let config = MuxConfig {
            capacity: Some(0),
            ..test_config()
        };
        assert!(matches!(
            MuxConnection::initiator(a, config).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_count_tracks_lifecycle() {
        let (client, server) = connected_pair(test_config()).await;
        assert_eq!(client.stream_count().await, 0);

        let mut stream = client.open().await.unwrap();
        assert_eq!(client.stream_count().await, 1);

        stream.write_all(b"x").await.unwrap();
        let peer = server.accept_stream().await.unwrap();
        assert_eq!(server.stream_count().await, 1);

        stream.shutdown().await.unwrap();
        drop(peer);

        // Both sides unregister once the close frames propagate
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while client.stream_count().await != 0 || server.stream_count().await != 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("streams should unregister after close");
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (client, _server) = connected_pair(test_config()).await;
        client.close().await;
        assert!(matches!(client.open().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = connected_pair(test_config()).await;
        client.close().await;
        client.close().await;
        client.closed().await;
    }
}
