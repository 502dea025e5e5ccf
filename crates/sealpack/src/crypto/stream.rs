//! Streaming authenticated encryption for the archive payload.
//!
//! The payload is sealed with XChaCha20-Poly1305 in 64 KiB chunks. A random
//! 19-byte nonce prefix opens the stream; each chunk's 24-byte nonce is
//! `prefix || u32-LE chunk counter || final-chunk flag`, so chunks cannot
//! be reordered, dropped or truncated without failing authentication.
//!
//! Stream layout:
//!
//! ```text
//! [19 bytes: nonce prefix][chunk 0][chunk 1]...[final chunk]
//! chunk  = 64 KiB ciphertext + 16 byte tag (final chunk may be shorter)
//! ```

use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Size of one plaintext chunk.
const CHUNK_SIZE: usize = 64 * 1024;

/// Poly1305 tag length.
const TAG_SIZE: usize = 16;

/// Random per-stream part of the nonce; the remaining 5 bytes are the chunk
/// counter and the final-chunk flag.
const NONCE_PREFIX_SIZE: usize = 19;

const CIPHER_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// The symmetric payload key.
///
/// The raw key material is exposed to the sealing layer as a 64-character
/// hex string; those UTF-8 bytes are what gets encrypted once per recipient
/// into the envelope trailer. Both representations are zeroised on drop.
pub struct PayloadKey {
    bytes: [u8; 32],
    hex: String,
}

impl PayloadKey {
    /// Generates a fresh random key.
    pub fn generate() -> PayloadKey {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex = hex::encode(bytes);
        PayloadKey { bytes, hex }
    }

    /// Reconstructs a key from the unsealed hex string bytes.
    pub fn from_hex_bytes(plaintext: &[u8]) -> Result<PayloadKey> {
        let hex_str = std::str::from_utf8(plaintext).map_err(|_| Error::BadAeadKey)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes).map_err(|_| Error::BadAeadKey)?;
        Ok(PayloadKey {
            bytes,
            hex: hex_str.to_owned(),
        })
    }

    /// The hex string form sealed for recipients.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.bytes).into())
    }
}

impl Drop for PayloadKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
        self.hex.zeroize();
    }
}

impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadKey(..)")
    }
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u32, last: bool) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..23].copy_from_slice(&counter.to_le_bytes());
    nonce[23] = last as u8;
    nonce.into()
}

/// Chunked encrypting writer; the inverse of [`DecryptReader`].
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: XChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX_SIZE],
    counter: u32,
    buf: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    /// Writes the nonce prefix and prepares for chunking.
    pub fn new(mut inner: W, key: &PayloadKey) -> Result<EncryptWriter<W>> {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);
        inner.write_all(&prefix)?;
        Ok(EncryptWriter {
            inner,
            cipher: key.cipher(),
            prefix,
            counter: 0,
            buf: Vec::with_capacity(CHUNK_SIZE),
        })
    }

    fn seal_chunk(&mut self, last: bool) -> Result<()> {
        let nonce = chunk_nonce(&self.prefix, self.counter, last);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, self.buf.as_slice())
            .map_err(|_| Error::Decryption)?;
        self.inner.write_all(&ciphertext)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| Error::Io(std::io::Error::other("payload exceeds chunk counter")))?;
        self.buf.clear();
        Ok(())
    }

    /// Seals the final (possibly empty) chunk and hands back the inner
    /// writer. Must be called; dropping without finishing loses the tail.
    pub fn finish(mut self) -> Result<W> {
        self.seal_chunk(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        // A full buffer is only sealed once more data arrives; the last
        // buffered chunk must be sealed with the final-chunk nonce instead.
        if self.buf.len() == CHUNK_SIZE {
            self.seal_chunk(false).map_err(Error::into_io)?;
        }
        let take = (CHUNK_SIZE - self.buf.len()).min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // Chunks are only flushed when sealed; flushing mid-chunk would
        // split the stream at an unauthenticated boundary.
        Ok(())
    }
}

/// Chunked decrypting reader; the inverse of [`EncryptWriter`].
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: XChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX_SIZE],
    counter: u32,
    /// Ciphertext carried over from the one-byte lookahead.
    pending: Vec<u8>,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, key: &PayloadKey) -> Result<DecryptReader<R>> {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        inner.read_exact(&mut prefix).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Decryption
            } else {
                Error::Io(e)
            }
        })?;
        Ok(DecryptReader {
            inner,
            cipher: key.cipher(),
            prefix,
            counter: 0,
            pending: Vec::with_capacity(CIPHER_CHUNK_SIZE + 1),
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    /// Reads the next ciphertext chunk plus one lookahead byte; the
    /// lookahead decides whether this chunk is the final one.
    fn next_chunk(&mut self) -> Result<()> {
        while self.pending.len() < CIPHER_CHUNK_SIZE + 1 {
            let mut buf = [0u8; 8 * 1024];
            let want = (CIPHER_CHUNK_SIZE + 1 - self.pending.len()).min(buf.len());
            let n = self.inner.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.pending.extend_from_slice(&buf[..n]);
        }

        let last = self.pending.len() <= CIPHER_CHUNK_SIZE;
        let chunk_len = if last {
            self.pending.len()
        } else {
            CIPHER_CHUNK_SIZE
        };
        if chunk_len < TAG_SIZE {
            // A truncated final chunk cannot carry a valid tag.
            return Err(Error::Authentication);
        }

        let nonce = chunk_nonce(&self.prefix, self.counter, last);
        self.plain = self
            .cipher
            .decrypt(&nonce, &self.pending[..chunk_len])
            .map_err(|_| Error::Authentication)?;
        self.pos = 0;
        self.pending.drain(..chunk_len);
        self.counter += 1;
        self.done = last;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.next_chunk().map_err(Error::into_io)?;
        }
        let n = (self.plain.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
