//! Typed binary helpers for the wire: variable-length integers and
//! length-prefixed byte arrays, with a pluggable [`SizePrefix`] policy.
//!
//! Reads run directly against the connection (byte-at-a-time for varints,
//! which the cipher layer makes cheap); writes assemble into a [`BytesMut`]
//! first so each logical record hits the connection as a single write.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Longest accepted varint encoding of a u32 (5 × 7 bits covers 32).
const MAX_VAR_U32_BYTES: u32 = 5;

/// Append `value` as an unsigned LEB128 varint.
pub fn put_var_u32(buf: &mut BytesMut, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint from the connection.
pub async fn read_var_u32<R>(reader: &mut R) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0u32;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= MAX_VAR_U32_BYTES * 7 {
            return Err(Error::Protocol("varint exceeds 5 bytes".to_string()));
        }
    }
}

/// Length-prefix encoding policy: which integer width/encoding carries the
/// byte count of a prefixed array, and up to which declared length a peer
/// is trusted. A declared length over the limit is a fatal protocol
/// violation, not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePrefix {
    U8,
    U16,
    U32,
    Var,
}

impl SizePrefix {
    /// Largest length this prefix can encode at all.
    pub(crate) fn max_encodable(&self) -> usize {
        match self {
            SizePrefix::U8 => u8::MAX as usize,
            SizePrefix::U16 => u16::MAX as usize,
            SizePrefix::U32 | SizePrefix::Var => u32::MAX as usize,
        }
    }

    /// Read a declared length and enforce `limit`.
    pub async fn read_len<R>(&self, reader: &mut R, limit: usize) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let len = match self {
            SizePrefix::U8 => reader.read_u8().await? as usize,
            SizePrefix::U16 => reader.read_u16().await? as usize,
            SizePrefix::U32 => reader.read_u32().await? as usize,
            SizePrefix::Var => read_var_u32(reader).await? as usize,
        };
        if len > limit {
            return Err(Error::PayloadTooLarge(len, limit));
        }
        Ok(len)
    }

    /// Append `len` to `buf`, enforcing `limit` and the encodable range.
    pub fn put_len(&self, buf: &mut BytesMut, limit: usize, len: usize) -> Result<()> {
        if len > limit {
            return Err(Error::PayloadTooLarge(len, limit));
        }
        if len > self.max_encodable() {
            return Err(Error::Protocol(format!(
                "length {} does not fit a {:?} prefix",
                len, self
            )));
        }
        match self {
            SizePrefix::U8 => buf.put_u8(len as u8),
            SizePrefix::U16 => buf.put_u16(len as u16),
            SizePrefix::U32 => buf.put_u32(len as u32),
            SizePrefix::Var => put_var_u32(buf, len as u32),
        }
        Ok(())
    }
}

/// Read a length-prefixed byte array.
pub async fn read_prefixed<R>(reader: &mut R, prefix: SizePrefix, limit: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = prefix.read_len(reader, limit).await?;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Write a length-prefixed byte array as one physical write.
pub async fn write_prefixed<W>(
    writer: &mut W,
    prefix: SizePrefix,
    limit: usize,
    data: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(data.len() + 5);
    prefix.put_len(&mut buf, limit, data.len())?;
    buf.put_slice(data);
    writer.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_var_u32_round_trip() {
        for value in [0u32, 1, 127, 128, 300, 16383, 16384, u32::MAX] {
            let mut buf = BytesMut::new();
            put_var_u32(&mut buf, value);
            let mut cursor = std::io::Cursor::new(buf.to_vec());
            let decoded = read_var_u32(&mut cursor).await.unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[tokio::test]
    async fn test_var_u32_single_byte_boundary() {
        let mut buf = BytesMut::new();
        put_var_u32(&mut buf, 127);
        assert_eq!(buf.len(), 1);

        let mut buf = BytesMut::new();
        put_var_u32(&mut buf, 128);
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn test_var_u32_rejects_overlong() {
        // Six continuation bytes can never be a valid u32
        let mut cursor = std::io::Cursor::new(vec![0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(matches!(
            read_var_u32(&mut cursor).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_size_prefix_round_trip() {
        for prefix in [SizePrefix::U8, SizePrefix::U16, SizePrefix::U32, SizePrefix::Var] {
            let mut buf = BytesMut::new();
            prefix.put_len(&mut buf, 255, 200).unwrap();
            let mut cursor = std::io::Cursor::new(buf.to_vec());
            assert_eq!(prefix.read_len(&mut cursor, 255).await.unwrap(), 200);
        }
    }

    #[tokio::test]
    async fn test_size_prefix_read_enforces_limit() {
        let mut buf = BytesMut::new();
        SizePrefix::U16.put_len(&mut buf, 4096, 2048).unwrap();
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        assert!(matches!(
            SizePrefix::U16.read_len(&mut cursor, 1024).await,
            Err(Error::PayloadTooLarge(2048, 1024))
        ));
    }

    #[tokio::test]
    async fn test_size_prefix_write_enforces_limit() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            SizePrefix::U16.put_len(&mut buf, 1024, 1025),
            Err(Error::PayloadTooLarge(1025, 1024))
        ));
    }

    #[test]
    fn test_size_prefix_write_enforces_width() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            SizePrefix::U8.put_len(&mut buf, usize::MAX, 256),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_prefixed_array_round_trip() {
        let data = vec![0xAB; 300];
        let mut wire = std::io::Cursor::new(Vec::new());
        write_prefixed(&mut wire, SizePrefix::Var, 1024, &data)
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(wire.into_inner());
        let decoded = read_prefixed(&mut cursor, SizePrefix::Var, 1024)
            .await
            .unwrap();
        assert_eq!(decoded, data);
    }
}
