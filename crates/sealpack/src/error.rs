//! Error types shared across the sealing pipeline.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Anything that can go wrong while sealing, inspecting or unsealing.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration
    #[error("invalid contents file: {0}")]
    InvalidContents(String),
    #[error("invalid file type: {0}")]
    InvalidFileType(String),
    #[error("cannot use --public with --recipient-pubkey")]
    PublicWithRecipients,
    #[error("invalid file glob: {0}")]
    Glob(#[from] glob::PatternError),

    // Envelope parsing
    #[error("not a valid sealpack file")]
    NotASealpack,
    #[error("unknown hash algorithm code {0}")]
    UnknownHashAlgorithm(u8),
    #[error("invalid key length {0}, must be a multiple of 8")]
    BadKeyLength(usize),

    // Keying
    #[error("file does not contain PEM data")]
    NotPem,
    #[error("unrecognised key encoding")]
    UnrecognisedKey,
    #[error("not an RSA key")]
    NotRsa,
    #[error("KMS key {0} cannot encrypt")]
    KmsNotEncryptable(String),
    #[error("key size must be {0} bits")]
    KeySizeWrong(usize),
    #[error("a private key is required to unseal this archive")]
    PrivateKeyRequired,
    #[error("not sealed for the provided private key")]
    NotForThisKey,

    // Crypto operations
    #[error("decryption error")]
    Decryption,
    #[error("message authentication failed")]
    Authentication,
    #[error("unable to create AEAD key")]
    BadAeadKey,
    #[error("signature verification failed")]
    SignatureInvalid,

    // Archive
    #[error("unknown tar entry type for {0}")]
    UnknownEntryType(String),

    // Verification
    #[error("tocs not matching")]
    TocMismatch,

    // Image handling
    #[error("invalid namespace")]
    InvalidNamespace,
    #[error("image operation failed: {0}")]
    Image(String),

    // External tooling (skopeo, ctr, aws)
    #[error("{tool} failed: {message}")]
    Tool {
        tool: &'static str,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
}

impl Error {
    /// Wraps this error so that it can travel through an `std::io::Read`
    /// implementation without losing the original kind.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Error::Io(err) => err,
            other => std::io::Error::other(other),
        }
    }

    /// Recovers an [`Error`] smuggled through [`Error::into_io`].
    pub fn from_io(err: std::io::Error) -> Error {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(err) => Error::Io(err),
        }
    }
}
