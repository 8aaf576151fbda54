use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::SizePrefix;
use crate::error::Result;

/// Stream identifier size (128-bit opaque value, raw bytes on the wire).
pub const STREAM_ID_LEN: usize = 16;

/// Default maximum payload bytes per frame.
pub const DEFAULT_MAX_CHUNK: usize = 1024;

/// Opaque 128-bit logical stream identifier.
///
/// Minted from the OS RNG; collision probability is negligible and handled
/// by regeneration against the live table at mint time. Identifiers are
/// never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId([u8; STREAM_ID_LEN]);

impl StreamId {
    /// Mint a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; STREAM_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; STREAM_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated for logs; full value is rarely useful to a human
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", hex::encode(self.0))
    }
}

/// One wire unit: stream identifier plus length-prefixed payload.
///
/// Wire format:
/// ```text
/// [identifier: 16 raw bytes][length: SizePrefix][payload: bytes]
/// ```
///
/// A zero-length payload is the end-of-stream marker for that identifier's
/// direction and carries no further data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame.
    pub fn data(id: StreamId, payload: Bytes) -> Self {
        Self { id, payload }
    }

    /// Create the end-of-stream marker for `id`.
    pub fn close(id: StreamId) -> Self {
        Self {
            id,
            payload: Bytes::new(),
        }
    }

    /// Check whether this frame is an end-of-stream marker.
    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode to bytes for a single physical write.
    pub fn encode(&self, prefix: SizePrefix, max_chunk: usize) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(STREAM_ID_LEN + 5 + self.payload.len());
        buf.put_slice(self.id.as_bytes());
        prefix.put_len(&mut buf, max_chunk, self.payload.len())?;
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    /// Read one frame off the connection, enforcing `max_chunk` on the
    /// declared payload length.
    pub async fn read_from<R>(reader: &mut R, prefix: SizePrefix, max_chunk: usize) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut id = [0u8; STREAM_ID_LEN];
        reader.read_exact(&mut id).await?;
        let len = prefix.read_len(reader, max_chunk).await?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Frame {
            id: StreamId::from_bytes(id),
            payload: payload.into(),
        })
    }
}
