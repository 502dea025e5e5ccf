//! Command configuration and the contents file.
//!
//! The `--contents` file lists files and images centrally; the extension
//! selects the parser (`.json`, `.yaml`/`.yml`), anything else is rejected.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archive::CompressionAlgorithm;
use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::ledger::HashAlgorithm;

/// Target registry value meaning "import into the local container runtime".
pub const LOCAL_REGISTRY: &str = "local";

/// Namespace used for local imports when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Contents of a `--contents` file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ArchiveContents {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Reads and parses a contents file by extension.
pub fn read_contents_file(path: &Path) -> Result<ArchiveContents> {
    let data = std::fs::read(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "json" => serde_json::from_slice(&data).map_err(|e| Error::InvalidContents(e.to_string())),
        "yaml" | "yml" => {
            serde_yaml::from_slice(&data).map_err(|e| Error::InvalidContents(e.to_string()))
        }
        other => Err(Error::InvalidFileType(format!(".{other}"))),
    }
}

/// Everything the `seal` orchestrator needs.
#[derive(Debug, Default)]
pub struct SealConfig {
    /// Path to the signing private key, or an `awskms:///` URI.
    pub privkey: String,
    /// Recipient public keys; empty for public archives.
    pub recipient_pubkeys: Vec<String>,
    /// Skip encryption, sign only.
    pub public: bool,
    pub hashing_algorithm: HashAlgorithm,
    pub compression: CompressionAlgorithm,
    /// Optional contents file replacing `files` / `image_names`.
    pub contents: Option<PathBuf>,
    /// File globs to include.
    pub files: Vec<String>,
    /// Raw image references, parsed into `images` by [`SealConfig::normalize`].
    pub image_names: Vec<String>,
    pub images: Vec<ImageRef>,
    /// Output spec: a path, `-` for stdout, or `s3://bucket/key`.
    pub output: String,
}

impl SealConfig {
    /// Resolves the contents file, parses image references and validates
    /// mutually exclusive options.
    pub fn normalize(&mut self) -> Result<()> {
        if let Some(path) = self.contents.take() {
            let contents = read_contents_file(&path)?;
            if !contents.files.is_empty() {
                self.files = contents.files;
            }
            if !contents.images.is_empty() {
                self.images = contents.images.iter().map(|s| ImageRef::parse(s)).collect();
            }
        }
        for name in std::mem::take(&mut self.image_names) {
            self.images.push(ImageRef::parse(&name));
        }
        if self.public && !self.recipient_pubkeys.is_empty() {
            return Err(Error::PublicWithRecipients);
        }
        Ok(())
    }
}

/// Everything the `unseal` orchestrator needs.
#[derive(Debug)]
pub struct UnsealConfig {
    /// The recipient's private key; required for sealed archives.
    pub privkey: Option<String>,
    /// The sender's public key (or `awskms:///` URI) for TOC verification.
    pub signer_key: String,
    pub output_path: PathBuf,
    /// Requested ledger hash; the envelope's negotiated algorithm wins and a
    /// mismatch is only warned about.
    pub hashing_algorithm: HashAlgorithm,
    /// Destination for container images; `local` selects the detected
    /// container runtime socket.
    pub target_registry: String,
    /// Namespace for local image imports.
    pub namespace: String,
}

impl Default for UnsealConfig {
    fn default() -> Self {
        UnsealConfig {
            privkey: None,
            signer_key: String::new(),
            output_path: PathBuf::from("."),
            hashing_algorithm: HashAlgorithm::default(),
            target_registry: LOCAL_REGISTRY.to_owned(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
        }
    }
}
