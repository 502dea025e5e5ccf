//! Sealpack bundles a heterogeneous set of payloads (arbitrary files and
//! OCI container images) into a single portable artifact that is
//! compressed, cryptographically signed and, unless explicitly public,
//! encrypted for one or more named recipients.
//!
//! The pipeline is streaming throughout: on the write path a tar builder
//! feeds a compression writer which feeds an authenticated-encryption
//! writer over a temp file; the read path composes the inverse chain.
//! Every archived byte is simultaneously hashed into a [`SignatureLedger`]
//! whose canonical form is archived as the table of contents and signed
//! with the sender's key. Recipients each get the fresh symmetric payload
//! key sealed with their RSA public key (or a remote KMS key) in the
//! envelope trailer.
//!
//! The top-level operations live in [`commands`]; everything else is the
//! machinery underneath.

pub mod archive;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod image;
pub mod ledger;
pub mod output;
pub mod verifier;

pub use archive::{
    CompressionAlgorithm, ReadArchive, SealedPayload, WriteArchive, TOC_FILENAME,
    TOC_SIGNATURE_FILENAME,
};
pub use commands::{inspect, seal, unseal};
pub use config::{ArchiveContents, SealConfig, UnsealConfig, LOCAL_REGISTRY};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use image::{ImageImporter, ImageRef, ImageSaver};
pub use ledger::{HashAlgorithm, SignatureLedger};
pub use verifier::ArchiveVerifier;
