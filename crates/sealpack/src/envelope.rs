//! The outer binary frame of a sealpack artifact.
//!
//! Wire layout, byte exact:
//!
//! ```text
//! offset  size   field
//! 0       4      magic = 0xDB 'I' 'P' 'C'
//! 4       1      config byte: bits 7..5 compression index, bits 4..0 hash code
//! 5       8      payload length L, little-endian u64
//! 13      L      opaque payload (the encrypted/compressed tar stream)
//! 13+L    ..     trailer: (len8: u8, key: [u8; len8 * 8]) records until EOF
//! ```
//!
//! The trailer's `len8` is the sealed key length divided by 8, so every
//! sealed key must be a multiple of 8 bytes long (RSA moduli always are).

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Take, Write};

use crate::archive::CompressionAlgorithm;
use crate::error::{Error, Result};
use crate::ledger::HashAlgorithm;

/// Magic prefix: the ASCII sum of "ECS" is 0xDB, followed by "IPC".
pub const MAGIC: [u8; 4] = [0xDB, b'I', b'P', b'C'];

/// Offset of the payload: magic + config byte + payload length.
pub const PAYLOAD_OFFSET: u64 = 13;

/// Parsed representation of the outer frame.
///
/// The payload itself is not held in memory; [`Envelope::payload_reader`]
/// re-positions the underlying source on the payload window instead.
#[derive(Debug)]
pub struct Envelope {
    pub hash_algorithm: HashAlgorithm,
    pub compression: CompressionAlgorithm,
    pub payload_len: u64,
    pub receiver_keys: Vec<Vec<u8>>,
}

impl Envelope {
    pub fn new(hash_algorithm: HashAlgorithm, compression: CompressionAlgorithm) -> Envelope {
        Envelope {
            hash_algorithm,
            compression,
            payload_len: 0,
            receiver_keys: Vec::new(),
        }
    }

    /// A public package carries no sealed recipient keys.
    pub fn is_public(&self) -> bool {
        self.receiver_keys.is_empty()
    }

    /// Parses the header and trailer, leaving the source seeked to the start
    /// of the payload.
    pub fn parse<R: Read + Seek>(input: &mut R) -> Result<Envelope> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(Error::NotASealpack);
        }

        let mut config = [0u8; 1];
        input.read_exact(&mut config)?;
        let hash_algorithm = HashAlgorithm::from_code(config[0] & 0b0001_1111)?;
        let compression = CompressionAlgorithm::from_index(config[0] >> 5);

        let mut len = [0u8; 8];
        input.read_exact(&mut len)?;
        let payload_len = u64::from_le_bytes(len);

        // Skip over the payload to reach the key trailer; a length field
        // pointing past the end of the source is a truncated artifact.
        let total = input.seek(SeekFrom::End(0))?;
        if total < PAYLOAD_OFFSET + payload_len {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        input.seek(SeekFrom::Start(PAYLOAD_OFFSET + payload_len))?;

        let mut receiver_keys = Vec::new();
        loop {
            let mut len8 = [0u8; 1];
            match read_exactish(input, &mut len8)? {
                false => break, // clean EOF terminates the trailer
                true => {
                    let mut key = vec![0u8; len8[0] as usize * 8];
                    input.read_exact(&mut key)?;
                    receiver_keys.push(key);
                }
            }
        }

        input.seek(SeekFrom::Start(PAYLOAD_OFFSET))?;
        Ok(Envelope {
            hash_algorithm,
            compression,
            payload_len,
            receiver_keys,
        })
    }

    /// Positions the source on the payload window and bounds it to
    /// `payload_len` bytes.
    pub fn payload_reader<'a, R: Read + Seek>(&self, input: &'a mut R) -> Result<Take<&'a mut R>> {
        input.seek(SeekFrom::Start(PAYLOAD_OFFSET))?;
        Ok(input.take(self.payload_len))
    }

    fn config_byte(&self) -> u8 {
        (self.compression.index() << 5) | self.hash_algorithm.code()
    }

    /// Emits the 13-byte prefix.
    pub fn write_header(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&MAGIC)?;
        w.write_all(&[self.config_byte()])?;
        w.write_all(&self.payload_len.to_le_bytes())?;
        Ok(())
    }

    /// Emits the trailer of sealed recipient keys.
    pub fn write_keys(&self, w: &mut impl Write) -> Result<()> {
        for key in &self.receiver_keys {
            if key.len() % 8 != 0 {
                return Err(Error::BadKeyLength(key.len()));
            }
            w.write_all(&[(key.len() / 8) as u8])?;
            w.write_all(key)?;
        }
        Ok(())
    }

    /// Writes the whole artifact: header, payload copied from `payload`, and
    /// the key trailer.
    pub fn write_output(&self, mut out: impl Write, mut payload: impl Read) -> Result<()> {
        self.write_header(&mut out)?;
        std::io::copy(&mut payload, &mut out)?;
        self.write_keys(&mut out)?;
        out.flush()?;
        Ok(())
    }

    /// Serialises the entire artifact into memory. Only sensible for small
    /// payloads; the streaming [`Envelope::write_output`] is the normal path.
    pub fn to_bytes(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(PAYLOAD_OFFSET as usize + payload.len());
        self.write_header(&mut out)?;
        out.extend_from_slice(payload);
        self.write_keys(&mut out)?;
        Ok(out)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_public() {
            writeln!(f, "File is a public package.")?;
        } else {
            writeln!(f, "File is a sealed package.")?;
        }
        writeln!(f, "\tPayload size (compressed): {} Bytes", self.payload_len)?;
        writeln!(
            f,
            "\tSignatures hashed using {} ({} Bit)",
            self.hash_algorithm,
            self.hash_algorithm.digest_size()
        )?;
        if !self.is_public() {
            writeln!(f, "\tSealed for {} receivers", self.receiver_keys.len())?;
        }
        Ok(())
    }
}

/// Reads exactly `buf.len()` bytes, distinguishing a clean EOF before any
/// byte was read (`Ok(false)`) from a truncated read (`UnexpectedEof`).
fn read_exactish(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let buflen = buf.len();
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match reader.read(todo) {
            Ok(0) => {
                return if todo.len() == buflen {
                    Ok(false)
                } else {
                    Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()))
                };
            }
            Ok(n) => todo = &mut todo[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Ok(true)
}
