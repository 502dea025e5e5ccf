//! Remote KMS-backed signing and key sealing.
//!
//! The KMS request transport is a pluggable collaborator: everything the
//! sealing pipeline needs is captured by [`KmsClient`]. The default client
//! drives the `aws kms` command line tool, which resolves credentials
//! through the standard AWS search order (environment, shared config,
//! instance metadata). Tests substitute an in-memory client.

use std::io::Write;
use std::process::Command;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::crypto::{KeyDecrypter, KeyEncrypter, TocSigner, TocVerifier};
use crate::error::{Error, Result};

/// Facts about a KMS key needed before using it.
#[derive(Debug, Clone)]
pub struct KmsKeyInfo {
    /// Whether the key's usage is `ENCRYPT_DECRYPT`.
    pub can_encrypt: bool,
    /// Modulus size in bytes for RSA keys, 0 otherwise.
    pub key_size: usize,
    /// Whether the key is an ECC key (selects the signing algorithm).
    pub is_ecc: bool,
}

/// The remote operations the keying layer depends on.
pub trait KmsClient: Send + Sync {
    fn sign(&self, key_id: &str, message: &[u8], algorithm: &str) -> Result<Vec<u8>>;
    fn verify(&self, key_id: &str, message: &[u8], signature: &[u8], algorithm: &str)
        -> Result<bool>;
    fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;
    fn describe(&self, key_id: &str) -> Result<KmsKeyInfo>;
}

const OAEP_ALGORITHM: &str = "RSAES_OAEP_SHA_256";
const RSA_SIGNING_ALGORITHM: &str = "RSASSA_PKCS1_V1_5_SHA_256";
const ECC_SIGNING_ALGORITHM: &str = "ECDSA_SHA_256";

fn signing_algorithm(info: &KmsKeyInfo) -> &'static str {
    if info.is_ecc {
        ECC_SIGNING_ALGORITHM
    } else {
        RSA_SIGNING_ALGORITHM
    }
}

/// Client backed by the `aws` command line tool.
pub struct AwsCliKms;

impl AwsCliKms {
    fn run(&self, args: &[&str]) -> Result<serde_json::Value> {
        let output = Command::new("aws")
            .args(["kms"])
            .args(args)
            .args(["--output", "json"])
            .output()
            .map_err(|e| Error::Tool {
                tool: "aws",
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::Tool {
                tool: "aws",
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|e| Error::Tool {
            tool: "aws",
            message: format!("unparseable response: {e}"),
        })
    }

    /// The CLI takes binary inputs as `fileb://` paths.
    fn spool(data: &[u8]) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(data)?;
        file.flush()?;
        Ok(file)
    }

    fn field_b64(value: &serde_json::Value, field: &str) -> Result<Vec<u8>> {
        let encoded = value[field].as_str().ok_or_else(|| Error::Tool {
            tool: "aws",
            message: format!("missing {field} in response"),
        })?;
        BASE64.decode(encoded).map_err(|e| Error::Tool {
            tool: "aws",
            message: format!("bad {field} encoding: {e}"),
        })
    }
}

impl KmsClient for AwsCliKms {
    fn sign(&self, key_id: &str, message: &[u8], algorithm: &str) -> Result<Vec<u8>> {
        let message_file = Self::spool(message)?;
        let response = self.run(&[
            "sign",
            "--key-id",
            key_id,
            "--message",
            &format!("fileb://{}", message_file.path().display()),
            "--message-type",
            "RAW",
            "--signing-algorithm",
            algorithm,
        ])?;
        Self::field_b64(&response, "Signature")
    }

    fn verify(
        &self,
        key_id: &str,
        message: &[u8],
        signature: &[u8],
        algorithm: &str,
    ) -> Result<bool> {
        let message_file = Self::spool(message)?;
        let signature_file = Self::spool(signature)?;
        let response = self.run(&[
            "verify",
            "--key-id",
            key_id,
            "--message",
            &format!("fileb://{}", message_file.path().display()),
            "--message-type",
            "RAW",
            "--signature",
            &format!("fileb://{}", signature_file.path().display()),
            "--signing-algorithm",
            algorithm,
        ])?;
        Ok(response["SignatureValid"].as_bool().unwrap_or(false))
    }

    fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let plaintext_file = Self::spool(plaintext)?;
        let response = self.run(&[
            "encrypt",
            "--key-id",
            key_id,
            "--plaintext",
            &format!("fileb://{}", plaintext_file.path().display()),
            "--encryption-algorithm",
            OAEP_ALGORITHM,
        ])?;
        Self::field_b64(&response, "CiphertextBlob")
    }

    fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext_file = Self::spool(ciphertext)?;
        let response = self.run(&[
            "decrypt",
            "--key-id",
            key_id,
            "--ciphertext-blob",
            &format!("fileb://{}", ciphertext_file.path().display()),
            "--encryption-algorithm",
            OAEP_ALGORITHM,
        ])?;
        Self::field_b64(&response, "Plaintext")
    }

    fn describe(&self, key_id: &str) -> Result<KmsKeyInfo> {
        let response = self.run(&["describe-key", "--key-id", key_id])?;
        let metadata = &response["KeyMetadata"];
        let spec = metadata["KeySpec"].as_str().unwrap_or_default();
        let key_size = match spec {
            "RSA_2048" => 256,
            "RSA_3072" => 384,
            "RSA_4096" => 512,
            _ => 0,
        };
        Ok(KmsKeyInfo {
            can_encrypt: metadata["KeyUsage"].as_str() == Some("ENCRYPT_DECRYPT"),
            key_size,
            is_ecc: spec.starts_with("ECC_"),
        })
    }
}

/// KMS-backed TOC signer.
pub struct KmsSigner {
    client: Box<dyn KmsClient>,
    key_id: String,
    algorithm: &'static str,
}

impl KmsSigner {
    pub fn new(key_id: &str) -> Result<KmsSigner> {
        KmsSigner::with_client(key_id, Box::new(AwsCliKms))
    }

    pub fn with_client(key_id: &str, client: Box<dyn KmsClient>) -> Result<KmsSigner> {
        let info = client.describe(key_id)?;
        Ok(KmsSigner {
            client,
            key_id: key_id.to_owned(),
            algorithm: signing_algorithm(&info),
        })
    }
}

impl TocSigner for KmsSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.client.sign(&self.key_id, message, self.algorithm)
    }
}

/// KMS-backed TOC verifier.
pub struct KmsVerifier {
    client: Box<dyn KmsClient>,
    key_id: String,
    algorithm: &'static str,
}

impl KmsVerifier {
    pub fn new(key_id: &str) -> Result<KmsVerifier> {
        KmsVerifier::with_client(key_id, Box::new(AwsCliKms))
    }

    pub fn with_client(key_id: &str, client: Box<dyn KmsClient>) -> Result<KmsVerifier> {
        let info = client.describe(key_id)?;
        Ok(KmsVerifier {
            client,
            key_id: key_id.to_owned(),
            algorithm: signing_algorithm(&info),
        })
    }
}

impl TocVerifier for KmsVerifier {
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        match self
            .client
            .verify(&self.key_id, message, signature, self.algorithm)
        {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(Error::SignatureInvalid),
        }
    }
}

/// KMS-backed recipient encrypter.
pub struct KmsEncrypter {
    client: Box<dyn KmsClient>,
    key_id: String,
    key_size: usize,
}

impl std::fmt::Debug for KmsEncrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsEncrypter")
            .field("key_id", &self.key_id)
            .field("key_size", &self.key_size)
            .finish()
    }
}

impl KmsEncrypter {
    pub fn new(key_id: &str) -> Result<KmsEncrypter> {
        KmsEncrypter::with_client(key_id, Box::new(AwsCliKms))
    }

    pub fn with_client(key_id: &str, client: Box<dyn KmsClient>) -> Result<KmsEncrypter> {
        let info = client.describe(key_id)?;
        if !info.can_encrypt || info.key_size == 0 {
            return Err(Error::KmsNotEncryptable(key_id.to_owned()));
        }
        Ok(KmsEncrypter {
            client,
            key_id: key_id.to_owned(),
            key_size: info.key_size,
        })
    }
}

impl KeyEncrypter for KmsEncrypter {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.client.encrypt(&self.key_id, plaintext)
    }

    fn key_size(&self) -> usize {
        self.key_size
    }
}

/// KMS-backed recipient decrypter.
pub struct KmsDecrypter {
    client: Box<dyn KmsClient>,
    key_id: String,
}

impl KmsDecrypter {
    pub fn new(key_id: &str) -> Result<KmsDecrypter> {
        KmsDecrypter::with_client(key_id, Box::new(AwsCliKms))
    }

    pub fn with_client(key_id: &str, client: Box<dyn KmsClient>) -> Result<KmsDecrypter> {
        Ok(KmsDecrypter {
            client,
            key_id: key_id.to_owned(),
        })
    }
}

impl KeyDecrypter for KmsDecrypter {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.client.decrypt(&self.key_id, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::testkeys;
    use crate::crypto::{PkiSigner, PkiVerifier, RsaDecrypter, RsaEncrypter};
    use openssl::pkey::{PKey, Private, Public};

    /// In-memory client over a local RSA key, standing in for the remote
    /// service in tests.
    struct FakeKms {
        private: PKey<Private>,
        public: PKey<Public>,
        usage_encrypt: bool,
    }

    impl FakeKms {
        fn new(usage_encrypt: bool) -> FakeKms {
            let private = testkeys::rsa(2048);
            let public = PKey::public_key_from_pem(&private.public_key_to_pem().unwrap()).unwrap();
            FakeKms {
                private,
                public,
                usage_encrypt,
            }
        }
    }

    impl KmsClient for FakeKms {
        fn sign(&self, _key_id: &str, message: &[u8], _algorithm: &str) -> Result<Vec<u8>> {
            PkiSigner::new(self.private.clone()).sign(message)
        }

        fn verify(
            &self,
            _key_id: &str,
            message: &[u8],
            signature: &[u8],
            _algorithm: &str,
        ) -> Result<bool> {
            Ok(PkiVerifier::new(self.public.clone())
                .verify(message, signature)
                .is_ok())
        }

        fn encrypt(&self, _key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
            RsaEncrypter::new(self.public.clone())?.encrypt(plaintext)
        }

        fn decrypt(&self, _key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
            RsaDecrypter::new(self.private.clone())?.decrypt(ciphertext)
        }

        fn describe(&self, _key_id: &str) -> Result<KmsKeyInfo> {
            Ok(KmsKeyInfo {
                can_encrypt: self.usage_encrypt,
                key_size: 256,
                is_ecc: false,
            })
        }
    }

    fn shared_pair(usage_encrypt: bool) -> (FakeKms, FakeKms) {
        let private = testkeys::rsa(2048);
        let public = PKey::public_key_from_pem(&private.public_key_to_pem().unwrap()).unwrap();
        let a = FakeKms {
            private: private.clone(),
            public: public.clone(),
            usage_encrypt,
        };
        let b = FakeKms {
            private,
            public,
            usage_encrypt,
        };
        (a, b)
    }

    #[test]
    fn test_kms_sign_verify() {
        let (sign_side, verify_side) = shared_pair(false);
        let signer = KmsSigner::with_client("kid", Box::new(sign_side)).unwrap();
        let verifier = KmsVerifier::with_client("kid", Box::new(verify_side)).unwrap();

        let signature = signer.sign(b"toc bytes").unwrap();
        verifier.verify(b"toc bytes", &signature).unwrap();

        assert!(matches!(
            verifier.verify(b"other bytes", &signature),
            Err(Error::SignatureInvalid)
        ));

        // A stranger's verifier rejects the signature.
        let stranger = KmsVerifier::with_client("kid", Box::new(FakeKms::new(false))).unwrap();
        assert!(matches!(
            stranger.verify(b"toc bytes", &signature),
            Err(Error::SignatureInvalid)
        ));
    }

    #[test]
    fn test_kms_encrypter_round_trip() {
        let (enc_client, dec_client) = shared_pair(true);
        let encrypter = KmsEncrypter::with_client("kid", Box::new(enc_client)).unwrap();
        assert_eq!(encrypter.key_size(), 256);

        let sealed = encrypter.encrypt(b"the symmetric key").unwrap();
        assert_eq!(sealed.len(), 256);

        let decrypter = KmsDecrypter::with_client("kid", Box::new(dec_client)).unwrap();
        assert_eq!(decrypter.decrypt(&sealed).unwrap(), b"the symmetric key");
    }

    #[test]
    fn test_sign_only_keys_cannot_seal() {
        let err = KmsEncrypter::with_client("arn:sign-only", Box::new(FakeKms::new(false)))
            .unwrap_err();
        assert!(matches!(err, Error::KmsNotEncryptable(id) if id == "arn:sign-only"));
    }

    #[test]
    fn test_signing_algorithm_selection() {
        let rsa = KmsKeyInfo {
            can_encrypt: false,
            key_size: 256,
            is_ecc: false,
        };
        let ecc = KmsKeyInfo {
            can_encrypt: false,
            key_size: 0,
            is_ecc: true,
        };
        assert_eq!(signing_algorithm(&rsa), "RSASSA_PKCS1_V1_5_SHA_256");
        assert_eq!(signing_algorithm(&ecc), "ECDSA_SHA_256");
    }
}
