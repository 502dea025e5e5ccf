//! Content hashing and the archive table of contents.
//!
//! Every entry written into an archive is hashed while it is being streamed;
//! the resulting name→digest map is serialised into the `.sealpack.toc` entry
//! and signed separately. The canonical serialisation sorts entries by name
//! so that it is independent of the order in which entries were added.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

/// Hash algorithms supported for entry digests.
///
/// The wire codes follow the numbering used by the envelope format
/// (SHA-224 = 4 .. SHA-512 = 7); other codes are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha512
    }
}

impl HashAlgorithm {
    /// Looks up an algorithm by name, ignoring punctuation ("SHA-256",
    /// "SHA256" and "sha_256" are all accepted). Unknown names fall back to
    /// SHA-512 with a warning.
    pub fn from_name(name: &str) -> HashAlgorithm {
        let normalized: String = name
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "SHA224" => HashAlgorithm::Sha224,
            "SHA256" => HashAlgorithm::Sha256,
            "SHA384" => HashAlgorithm::Sha384,
            "SHA512" => HashAlgorithm::Sha512,
            _ => {
                log::warn!("unknown hash algorithm '{name}', defaulting to SHA512");
                HashAlgorithm::Sha512
            }
        }
    }

    /// Decodes the envelope wire code.
    pub fn from_code(code: u8) -> Result<HashAlgorithm> {
        match code {
            4 => Ok(HashAlgorithm::Sha224),
            5 => Ok(HashAlgorithm::Sha256),
            6 => Ok(HashAlgorithm::Sha384),
            7 => Ok(HashAlgorithm::Sha512),
            other => Err(Error::UnknownHashAlgorithm(other)),
        }
    }

    /// The envelope wire code (fits in the 5 low bits of the config byte).
    pub fn code(self) -> u8 {
        match self {
            HashAlgorithm::Sha224 => 4,
            HashAlgorithm::Sha256 => 5,
            HashAlgorithm::Sha384 => 6,
            HashAlgorithm::Sha512 => 7,
        }
    }

    /// Digest length in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Starts a fresh hasher for this algorithm.
    pub fn hasher(self) -> EntryHasher {
        match self {
            HashAlgorithm::Sha224 => EntryHasher::Sha224(Sha224::new()),
            HashAlgorithm::Sha256 => EntryHasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => EntryHasher::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => EntryHasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha224 => "SHA-224",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        };
        f.write_str(name)
    }
}

/// An in-progress digest over one archive entry.
#[derive(Debug)]
pub enum EntryHasher {
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl EntryHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            EntryHasher::Sha224(h) => h.update(data),
            EntryHasher::Sha256(h) => h.update(data),
            EntryHasher::Sha384(h) => h.update(data),
            EntryHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            EntryHasher::Sha224(h) => h.finalize().to_vec(),
            EntryHasher::Sha256(h) => h.finalize().to_vec(),
            EntryHasher::Sha384(h) => h.finalize().to_vec(),
            EntryHasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Ordered map from archive entry name to its content digest.
///
/// The canonical byte form is one `<name>:<raw-hash-bytes>\n` line per entry,
/// sorted lexicographically by name. The trailing newline on the final line
/// is part of the format.
#[derive(Debug)]
pub struct SignatureLedger {
    algorithm: HashAlgorithm,
    entries: BTreeMap<String, Vec<u8>>,
}

impl SignatureLedger {
    pub fn new(algorithm: HashAlgorithm) -> SignatureLedger {
        SignatureLedger {
            algorithm,
            entries: BTreeMap::new(),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hashes a byte slice and records it under `name`.
    pub fn add(&mut self, name: &str, contents: &[u8]) {
        let mut hasher = self.algorithm.hasher();
        hasher.update(contents);
        self.entries.insert(name.to_owned(), hasher.finalize());
    }

    /// Hashes everything a reader yields and records it under `name`.
    pub fn add_from_reader(&mut self, name: &str, reader: &mut impl Read) -> Result<()> {
        let mut hasher = self.algorithm.hasher();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        self.entries.insert(name.to_owned(), hasher.finalize());
        Ok(())
    }

    /// Records an already-computed digest, as produced by the unpack tee.
    pub fn insert_digest(&mut self, name: &str, digest: Vec<u8>) {
        self.entries.insert(name.to_owned(), digest);
    }

    /// The canonical serialisation that is archived as `.sealpack.toc`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, digest) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.push(b':');
            out.extend_from_slice(digest);
            out.push(b'\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for SignatureLedger {
    /// Order-independent comparison of the name→digest pairs.
    fn eq(&self, other: &SignatureLedger) -> bool {
        self.entries == other.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_variants() {
        let cases = [
            ("SHA224", HashAlgorithm::Sha224),
            ("SHA-256", HashAlgorithm::Sha256),
            ("sha_384", HashAlgorithm::Sha384),
            ("SHA512", HashAlgorithm::Sha512),
            ("md5", HashAlgorithm::Sha512), // unknown falls back
            ("", HashAlgorithm::Sha512),
        ];
        for (name, expected) in cases {
            assert_eq!(HashAlgorithm::from_name(name), expected, "{name}");
        }
    }

    #[test]
    fn test_code_round_trip() {
        for algo in [
            HashAlgorithm::Sha224,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(HashAlgorithm::from_code(algo.code()).unwrap(), algo);
        }
        assert!(matches!(
            HashAlgorithm::from_code(0),
            Err(Error::UnknownHashAlgorithm(0))
        ));
        assert!(matches!(
            HashAlgorithm::from_code(31),
            Err(Error::UnknownHashAlgorithm(31))
        ));
    }

    #[test]
    fn test_digest_sizes() {
        assert_eq!(HashAlgorithm::Sha224.digest_size(), 28);
        assert_eq!(HashAlgorithm::Sha256.digest_size(), 32);
        assert_eq!(HashAlgorithm::Sha384.digest_size(), 48);
        assert_eq!(HashAlgorithm::Sha512.digest_size(), 64);
    }

    #[test]
    fn test_canonical_bytes_are_insertion_order_independent() {
        let mut a = SignatureLedger::new(HashAlgorithm::Sha256);
        a.add("zebra", b"stripes");
        a.add("aardvark", b"ants");
        a.add("moose", b"antlers");

        let mut b = SignatureLedger::new(HashAlgorithm::Sha256);
        b.add("moose", b"antlers");
        b.add("aardvark", b"ants");
        b.add("zebra", b"stripes");

        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_format() {
        let mut ledger = SignatureLedger::new(HashAlgorithm::Sha256);
        ledger.add("hello.txt", b"hi");

        let bytes = ledger.to_bytes();
        let mut expected = b"hello.txt:".to_vec();
        expected.extend_from_slice(&<Sha256 as Digest>::digest(b"hi"));
        expected.push(b'\n');
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_reader_and_slice_agree() {
        let data = vec![0xa5u8; 200_000];
        let mut from_slice = SignatureLedger::new(HashAlgorithm::Sha512);
        from_slice.add("big", &data);

        let mut from_reader = SignatureLedger::new(HashAlgorithm::Sha512);
        from_reader
            .add_from_reader("big", &mut std::io::Cursor::new(&data))
            .unwrap();

        assert_eq!(from_slice, from_reader);
    }

    #[test]
    fn test_differing_contents_not_equal() {
        let mut a = SignatureLedger::new(HashAlgorithm::Sha256);
        a.add("f", b"one");
        let mut b = SignatureLedger::new(HashAlgorithm::Sha256);
        b.add("f", b"two");
        assert_ne!(a, b);
    }
}
