//! Byte-granular stream cipher over a block primitive.
//!
//! Cipher feedback at full-block granularity: the 16-byte register is run
//! through the block cipher once per 16 consumed bytes to produce a
//! keystream block, and produced ciphertext overwrites the register as the
//! seed for the next block. Feedback uses ciphertext on both sides, so the
//! encrypt and decrypt registers walk identical trajectories given the same
//! wire bytes, and I/O can be chunked at any byte boundary.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Single-block, encrypt-only transform with a key schedule baked in.
///
/// Decryption of the byte stream also uses the *encrypt* direction of the
/// block primitive; the inverse cipher is never needed.
pub trait BlockEncryptor: Send + Sync {
    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]);
}

struct Aes128Encryptor(Aes128);

impl BlockEncryptor for Aes128Encryptor {
    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.0.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

struct Aes256Encryptor(Aes256);

impl BlockEncryptor for Aes256Encryptor {
    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.0.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Selects the block-cipher implementation used for the keystream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCipherKind {
    Aes128,
    Aes256,
}

impl BlockCipherKind {
    /// Key length the cipher expects, in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            BlockCipherKind::Aes128 => 16,
            BlockCipherKind::Aes256 => 32,
        }
    }

    /// Build the key-scheduled primitive.
    pub fn build(&self, key: &[u8]) -> Result<Arc<dyn BlockEncryptor>> {
        match self {
            BlockCipherKind::Aes128 => Aes128::new_from_slice(key)
                .map(|aes| Arc::new(Aes128Encryptor(aes)) as Arc<dyn BlockEncryptor>),
            BlockCipherKind::Aes256 => Aes256::new_from_slice(key)
                .map(|aes| Arc::new(Aes256Encryptor(aes)) as Arc<dyn BlockEncryptor>),
        }
        .map_err(|_| {
            Error::Config(format!(
                "{:?} requires a {}-byte key, got {}",
                self,
                self.key_len(),
                key.len()
            ))
        })
    }
}

/// Directional cipher state: keystream register plus cursor.
///
/// One instance per direction; the two directions of a connection never
/// share state. Transforms are in place, length-preserving, and chunking-
/// independent: any split of a byte sequence across calls produces output
/// bit-identical to a single call.
pub struct StreamCipher {
    cipher: Arc<dyn BlockEncryptor>,
    register: [u8; BLOCK_SIZE],
    pos: usize,
}

impl StreamCipher {
    /// Create with the negotiated initialization vector as the first seed.
    pub fn new(cipher: Arc<dyn BlockEncryptor>, iv: [u8; BLOCK_SIZE]) -> Self {
        Self {
            cipher,
            register: iv,
            pos: 0,
        }
    }

    /// Encrypt plaintext in place.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            if self.pos == 0 {
                self.cipher.encrypt_block(&mut self.register);
            }
            let cipher_byte = self.register[self.pos] ^ *byte;
            self.register[self.pos] = cipher_byte;
            *byte = cipher_byte;
            self.pos = (self.pos + 1) % BLOCK_SIZE;
        }
    }

    /// Decrypt ciphertext in place.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            if self.pos == 0 {
                self.cipher.encrypt_block(&mut self.register);
            }
            let cipher_byte = *byte;
            *byte = self.register[self.pos] ^ cipher_byte;
            self.register[self.pos] = cipher_byte;
            self.pos = (self.pos + 1) % BLOCK_SIZE;
        }
    }
}

/// Read half of the encrypted connection.
///
/// Decrypts exactly the bytes the inner read filled, inside the same poll,
/// so the register never advances past what actually arrived.
pub struct CipherRead<R> {
    inner: R,
    cipher: StreamCipher,
}

impl<R> CipherRead<R> {
    pub fn new(inner: R, cipher: StreamCipher) -> Self {
        Self { inner, cipher }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherRead<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.cipher.decrypt(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Write half of the encrypted connection.
///
/// Encrypts into a scratch buffer and hands the whole record to the inner
/// writer, so the register covers exactly the bytes submitted to the wire.
pub struct CipherWrite<W> {
    inner: W,
    cipher: StreamCipher,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> CipherWrite<W> {
    pub fn new(inner: W, cipher: StreamCipher) -> Self {
        Self {
            inner,
            cipher,
            scratch: Vec::new(),
        }
    }

    /// Encrypt `data` and write it out completely.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        self.cipher.encrypt(&mut self.scratch);
        self.inner.write_all(&self.scratch).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
