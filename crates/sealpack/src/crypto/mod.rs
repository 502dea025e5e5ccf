//! Signing, verification and recipient-key sealing.
//!
//! The keying layer hides "local PEM file vs remote KMS" behind four small
//! capabilities. A URI starting with `awskms:///` selects the KMS-backed
//! implementation; anything else is treated as a path to a PEM file.
//! Local signatures bind SHA-256 as the signing hash (Ed25519 signs the raw
//! message); sealing uses RSA-OAEP-SHA256.

pub mod keys;
pub mod kms;
pub mod stream;

use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey, Private, Public};
use openssl::rsa::Padding;
use openssl::sign::{Signer, Verifier};

use crate::crypto::stream::PayloadKey;
use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// URI prefix selecting the remote KMS implementations.
pub const KMS_PREFIX: &str = "awskms:///";

/// Signs the table of contents.
pub trait TocSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Verifies the detached table-of-contents signature.
pub trait TocVerifier {
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()>;
}

/// Seals the symmetric payload key for one recipient.
pub trait KeyEncrypter {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    /// Length of a sealed key in bytes (the RSA modulus size).
    fn key_size(&self) -> usize;
}

/// Unseals a recipient key.
pub trait KeyDecrypter {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Chooses the signer implementation for a private key URI.
pub fn create_signer(uri: &str) -> Result<Box<dyn TocSigner>> {
    if let Some(key_id) = uri.strip_prefix(KMS_PREFIX) {
        Ok(Box::new(kms::KmsSigner::new(key_id)?))
    } else {
        Ok(Box::new(PkiSigner::from_file(uri)?))
    }
}

/// Chooses the verifier implementation for a public key URI.
pub fn create_verifier(uri: &str) -> Result<Box<dyn TocVerifier>> {
    if let Some(key_id) = uri.strip_prefix(KMS_PREFIX) {
        Ok(Box::new(kms::KmsVerifier::new(key_id)?))
    } else {
        Ok(Box::new(PkiVerifier::from_file(uri)?))
    }
}

/// Chooses the recipient-encrypter implementation for a public key URI.
pub fn get_encrypter(uri: &str) -> Result<Box<dyn KeyEncrypter>> {
    if let Some(key_id) = uri.strip_prefix(KMS_PREFIX) {
        Ok(Box::new(kms::KmsEncrypter::new(key_id)?))
    } else {
        Ok(Box::new(RsaEncrypter::from_file(uri)?))
    }
}

/// Chooses the decrypter implementation for a private key URI.
pub fn get_decrypter(uri: &str) -> Result<Box<dyn KeyDecrypter>> {
    if let Some(key_id) = uri.strip_prefix(KMS_PREFIX) {
        Ok(Box::new(kms::KmsDecrypter::new(key_id)?))
    } else {
        Ok(Box::new(RsaDecrypter::from_file(uri)?))
    }
}

/// Local signer bound to a PEM private key.
pub struct PkiSigner {
    key: PKey<Private>,
}

impl PkiSigner {
    pub fn from_file(path: &str) -> Result<PkiSigner> {
        Ok(PkiSigner {
            key: keys::load_private_key(path)?,
        })
    }

    pub fn new(key: PKey<Private>) -> PkiSigner {
        PkiSigner { key }
    }
}

impl TocSigner for PkiSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut signer = match self.key.id() {
            Id::ED25519 => Signer::new_without_digest(&self.key)?,
            _ => Signer::new(MessageDigest::sha256(), &self.key)?,
        };
        Ok(signer.sign_oneshot_to_vec(message)?)
    }
}

/// Local verifier bound to a PEM public key.
pub struct PkiVerifier {
    key: PKey<Public>,
}

impl PkiVerifier {
    pub fn from_file(path: &str) -> Result<PkiVerifier> {
        Ok(PkiVerifier {
            key: keys::load_public_key(path)?,
        })
    }

    pub fn new(key: PKey<Public>) -> PkiVerifier {
        PkiVerifier { key }
    }
}

impl TocVerifier for PkiVerifier {
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let mut verifier = match self.key.id() {
            Id::ED25519 => Verifier::new_without_digest(&self.key)?,
            _ => Verifier::new(MessageDigest::sha256(), &self.key)?,
        };
        // Malformed signatures raise an error stack; both cases are a plain
        // verification failure for the caller.
        match verifier.verify_oneshot(signature, message) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(Error::SignatureInvalid),
        }
    }
}

fn oaep_sha256_encrypter(key: &PKey<Public>) -> Result<Encrypter<'_>> {
    let mut encrypter = Encrypter::new(key)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
    encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
    Ok(encrypter)
}

fn oaep_sha256_decrypter(key: &PKey<Private>) -> Result<Decrypter<'_>> {
    let mut decrypter = Decrypter::new(key)?;
    decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    decrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
    decrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
    Ok(decrypter)
}

/// RSA-OAEP-SHA256 recipient encrypter over a local public key.
pub struct RsaEncrypter {
    key: PKey<Public>,
    modulus_size: usize,
}

impl RsaEncrypter {
    pub fn from_file(path: &str) -> Result<RsaEncrypter> {
        RsaEncrypter::new(keys::load_public_key(path)?)
    }

    pub fn new(key: PKey<Public>) -> Result<RsaEncrypter> {
        let modulus_size = match key.rsa() {
            Ok(rsa) => rsa.size() as usize,
            Err(_) => return Err(Error::NotRsa),
        };
        Ok(RsaEncrypter { key, modulus_size })
    }
}

impl KeyEncrypter for RsaEncrypter {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let encrypter = oaep_sha256_encrypter(&self.key)?;
        let mut sealed = vec![0u8; encrypter.encrypt_len(plaintext)?];
        let n = encrypter.encrypt(plaintext, &mut sealed)?;
        sealed.truncate(n);
        Ok(sealed)
    }

    fn key_size(&self) -> usize {
        self.modulus_size
    }
}

/// RSA-OAEP-SHA256 decrypter over a local private key.
pub struct RsaDecrypter {
    key: PKey<Private>,
}

impl RsaDecrypter {
    pub fn from_file(path: &str) -> Result<RsaDecrypter> {
        RsaDecrypter::new(keys::load_private_key(path)?)
    }

    pub fn new(key: PKey<Private>) -> Result<RsaDecrypter> {
        if key.rsa().is_err() {
            return Err(Error::NotRsa);
        }
        Ok(RsaDecrypter { key })
    }
}

impl KeyDecrypter for RsaDecrypter {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let decrypter = oaep_sha256_decrypter(&self.key).map_err(|_| Error::Decryption)?;
        let mut plain = vec![
            0u8;
            decrypter
                .decrypt_len(ciphertext)
                .map_err(|_| Error::Decryption)?
        ];
        let n = decrypter
            .decrypt(ciphertext, &mut plain)
            .map_err(|_| Error::Decryption)?;
        plain.truncate(n);
        Ok(plain)
    }
}

/// Seals the payload key once per recipient, in configuration order.
pub fn seal_keys(envelope: &mut Envelope, recipients: &[String], key: &PayloadKey) -> Result<()> {
    for uri in recipients {
        let encrypter = get_encrypter(uri)?;
        let sealed = encrypter.encrypt(key.as_str().as_bytes())?;
        if sealed.len() != encrypter.key_size() {
            return Err(Error::KeySizeWrong(encrypter.key_size()));
        }
        envelope.receiver_keys.push(sealed);
    }
    Ok(())
}

/// Attempts to unseal one recipient key.
///
/// Failures are returned unchanged so the caller can move on to the next
/// sealed key in the trailer.
pub fn try_unseal_key(sealed: &[u8], decrypter: &dyn KeyDecrypter) -> Result<PayloadKey> {
    let plaintext = decrypter.decrypt(sealed)?;
    PayloadKey::from_hex_bytes(&plaintext)
}
