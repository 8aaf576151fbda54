//! Encrypted stream multiplexing over a single duplex byte connection.
//!
//! This crate turns one raw bidirectional connection (TCP socket, Unix
//! socket, in-memory pipe — anything `AsyncRead + AsyncWrite`) into:
//!
//! - a confidential channel: a key-exchange handshake wraps the connection
//!   in a byte-granular stream cipher (block-feedback AES keystream, one
//!   block-cipher call per 16 bytes), and
//! - many independent logical byte streams, identified by opaque 128-bit
//!   values, each with ordinary async read/write/close semantics and
//!   optional queue backpressure.
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓ open() / accept_stream()        MuxStream (AsyncRead + AsyncWrite)
//! MuxConnection (stream table, receive loop, per-stream send tasks)
//!     ↓ frames: [id: 16 bytes][len][payload]
//! CipherRead / CipherWrite (streaming AES over the negotiated secret)
//!     ↓
//! any AsyncRead + AsyncWrite duplex connection
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use mux_stream::{MuxConnection, MuxConfig};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> mux_stream::Result<()> {
//!     let tcp = TcpStream::connect("127.0.0.1:4433").await?;
//!     let conn = MuxConnection::initiator(tcp, MuxConfig::default()).await?;
//!
//!     let mut stream = conn.open().await?;
//!     stream.write_all(b"hello").await?;
//!
//!     let mut reply = [0u8; 5];
//!     stream.read_exact(&mut reply).await?;
//!     stream.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod blocking;
pub mod cipher;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod stream;

pub use cipher::{BlockCipherKind, BlockEncryptor, StreamCipher, BLOCK_SIZE};
pub use codec::SizePrefix;
pub use connection::{MuxConfig, MuxConnection};
pub use error::{Error, Result};
pub use frame::{Frame, StreamId, DEFAULT_MAX_CHUNK, STREAM_ID_LEN};
pub use handshake::{CryptoConfig, ProtocolVersion, PROTOCOL_VERSION};
pub use stream::MuxStream;
