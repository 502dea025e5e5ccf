//! PEM key loading.
//!
//! Keys arrive as PEM files in a handful of encodings. Each loader tries the
//! accepted parsers in a fixed order until one succeeds: PKIX then PKCS#1 for
//! public keys, PKCS#1 then PKCS#8 then SEC1 for private keys. RSA, ECDSA
//! over the P-curves and Ed25519 keys are all loadable; only RSA keys may be
//! used as sealing recipients.

use std::path::Path;

use openssl::ec::EcKey;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;

use crate::error::{Error, Result};

const PEM_HEADER: &[u8] = b"-----BEGIN";

fn has_pem_envelope(data: &[u8]) -> bool {
    data.windows(PEM_HEADER.len()).any(|w| w == PEM_HEADER)
}

/// Reads and parses a public key, trying PKIX then PKCS#1 RSA.
pub fn load_public_key(path: impl AsRef<Path>) -> Result<PKey<Public>> {
    let pem = std::fs::read(path)?;
    if !has_pem_envelope(&pem) {
        return Err(Error::NotPem);
    }
    if let Ok(key) = PKey::public_key_from_pem(&pem) {
        return Ok(key);
    }
    if let Ok(rsa) = Rsa::public_key_from_pem_pkcs1(&pem) {
        return Ok(PKey::from_rsa(rsa)?);
    }
    Err(Error::UnrecognisedKey)
}

/// Reads and parses a private key, trying PKCS#1 RSA, then PKCS#8, then
/// SEC1 EC.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PKey<Private>> {
    let pem = std::fs::read(path)?;
    if !has_pem_envelope(&pem) {
        return Err(Error::NotPem);
    }
    if let Ok(rsa) = Rsa::private_key_from_pem(&pem) {
        return Ok(PKey::from_rsa(rsa)?);
    }
    if let Ok(key) = PKey::private_key_from_pem(&pem) {
        return Ok(key);
    }
    if let Ok(ec) = EcKey::private_key_from_pem(&pem) {
        return Ok(PKey::from_ec_key(ec)?);
    }
    Err(Error::UnrecognisedKey)
}

#[cfg(test)]
pub(crate) mod testkeys {
    //! Key material generators shared by the crypto tests.

    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;

    pub fn rsa(bits: u32) -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(bits).unwrap()).unwrap()
    }

    pub fn p256() -> PKey<Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    }

    pub fn ed25519() -> PKey<Private> {
        PKey::generate_ed25519().unwrap()
    }
}
