//! Connection handshake: version agreement and key exchange.
//!
//! Sequence, before any frame is exchanged:
//!
//! 1. Both sides send their protocol version tuple (four varints) and
//!    require exact equality — mismatch fails fast before any secret
//!    material moves.
//! 2. The responder generates an ephemeral RSA keypair and sends the
//!    public key; the initiator generates the symmetric secret, encrypts
//!    it under that key, and sends it back.
//! 3. Both sides key a [`StreamCipher`] pair from the secret, with the
//!    secret's first 16 bytes as the initialization vector. All subsequent
//!    physical I/O passes through the ciphers.
//!
//! The handshake is one-shot: any failure tears the connection down and is
//! never retried.

use std::fmt;

use bytes::BytesMut;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::cipher::{BlockCipherKind, StreamCipher, BLOCK_SIZE};
use crate::codec::{self, SizePrefix};
use crate::error::{Error, Result};

/// Protocol version tuple, compared for exact equality during the
/// handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub major_rev: u32,
    pub minor_rev: u32,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.major_rev, self.minor_rev
        )
    }
}

/// Version spoken by this crate.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 0,
    major_rev: 0,
    minor_rev: 0,
};

/// Cryptographic parameters for the handshake and transport cipher.
///
/// Passed explicitly — there is no ambient provider state. The secret
/// length must match the selected block cipher's key length and be at
/// least one block (the IV is the secret's first 16 bytes).
#[derive(Debug, Clone)]
pub struct CryptoConfig {
    /// RSA modulus size in bits for the ephemeral key exchange keypair.
    pub rsa_bits: usize,
    /// Symmetric secret length in bytes.
    pub secret_len: usize,
    /// Block cipher keyed with the secret.
    pub block_cipher: BlockCipherKind,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            rsa_bits: 2048,
            secret_len: 32,
            block_cipher: BlockCipherKind::Aes256,
        }
    }
}

impl CryptoConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.secret_len != self.block_cipher.key_len() {
            return Err(Error::Config(format!(
                "secret length {} does not match {:?} key length {}",
                self.secret_len,
                self.block_cipher,
                self.block_cipher.key_len()
            )));
        }
        if self.secret_len < BLOCK_SIZE {
            return Err(Error::Config(format!(
                "secret length {} is shorter than one cipher block",
                self.secret_len
            )));
        }
        if self.rsa_bits < 1024 {
            return Err(Error::Config(format!(
                "RSA modulus of {} bits is too small",
                self.rsa_bits
            )));
        }
        Ok(())
    }

    /// Upper bound for an incoming DER-encoded public key.
    fn public_key_limit(&self) -> usize {
        self.rsa_bits / 8 + 128
    }

    /// Upper bound for the wrapped secret: the modulus byte size.
    fn wrapped_secret_limit(&self) -> usize {
        self.rsa_bits / 8
    }
}

/// Which side of the handshake this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Generates the symmetric secret.
    Initiator,
    /// Generates the ephemeral asymmetric keypair.
    Responder,
}

/// Directional cipher pair produced by a completed handshake.
pub(crate) struct CipherPair {
    pub(crate) read: StreamCipher,
    pub(crate) write: StreamCipher,
}

/// Run the handshake over the raw connection.
pub(crate) async fn handshake<S>(
    conn: &mut S,
    role: Role,
    config: &CryptoConfig,
) -> Result<CipherPair>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    config.validate()?;
    exchange_version(conn, PROTOCOL_VERSION).await?;

    let mut secret = match role {
        Role::Responder => receive_secret(conn, config).await?,
        Role::Initiator => send_secret(conn, config).await?,
    };

    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&secret[..BLOCK_SIZE]);

    let read = StreamCipher::new(config.block_cipher.build(&secret)?, iv);
    let write = StreamCipher::new(config.block_cipher.build(&secret)?, iv);
    secret.zeroize();
    iv.zeroize();

    debug!("handshake complete as {:?}", role);
    Ok(CipherPair { read, write })
}

/// Send our version tuple, read the peer's, require exact equality.
async fn exchange_version<S>(conn: &mut S, local: ProtocolVersion) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(20);
    codec::put_var_u32(&mut buf, local.major);
    codec::put_var_u32(&mut buf, local.minor);
    codec::put_var_u32(&mut buf, local.major_rev);
    codec::put_var_u32(&mut buf, local.minor_rev);
    conn.write_all(&buf).await?;
    conn.flush().await?;

    let remote = ProtocolVersion {
        major: codec::read_var_u32(conn).await?,
        minor: codec::read_var_u32(conn).await?,
        major_rev: codec::read_var_u32(conn).await?,
        minor_rev: codec::read_var_u32(conn).await?,
    };
    trace!("peer version {}", remote);

    if remote != local {
        return Err(Error::VersionMismatch { local, remote });
    }
    Ok(())
}

/// Responder side: publish an ephemeral public key, unwrap the secret.
async fn receive_secret<S>(conn: &mut S, config: &CryptoConfig) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let private_key = RsaPrivateKey::new(&mut OsRng, config.rsa_bits)
        .map_err(|e| Error::KeyExchange(e.to_string()))?;
    let public_der = private_key
        .to_public_key()
        .to_pkcs1_der()
        .map_err(|e| Error::KeyExchange(e.to_string()))?;

    codec::write_prefixed(
        conn,
        SizePrefix::Var,
        config.public_key_limit(),
        public_der.as_bytes(),
    )
    .await?;
    conn.flush().await?;

    let wrapped =
        codec::read_prefixed(conn, SizePrefix::Var, config.wrapped_secret_limit()).await?;
    let secret = private_key
        .decrypt(Pkcs1v15Encrypt, &wrapped)
        .map_err(|e| Error::KeyExchange(e.to_string()))?;
    if secret.len() != config.secret_len {
        return Err(Error::KeyExchange(format!(
            "unwrapped secret is {} bytes, expected {}",
            secret.len(),
            config.secret_len
        )));
    }
    Ok(secret)
}

/// Initiator side: mint the secret, wrap it under the peer's public key.
async fn send_secret<S>(conn: &mut S, config: &CryptoConfig) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let public_der =
        codec::read_prefixed(conn, SizePrefix::Var, config.public_key_limit()).await?;
    let public_key = RsaPublicKey::from_pkcs1_der(&public_der)
        .map_err(|e| Error::KeyExchange(e.to_string()))?;

    let mut secret = vec![0u8; config.secret_len];
    OsRng.fill_bytes(&mut secret);

    let wrapped = public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, &secret)
        .map_err(|e| Error::KeyExchange(e.to_string()))?;
    codec::write_prefixed(conn, SizePrefix::Var, config.wrapped_secret_limit(), &wrapped).await?;
    conn.flush().await?;
    Ok(secret)
}
