//! End-of-unseal integrity verification and rollback.
//!
//! While the archive streams through, the verifier collects the received
//! TOC, the detached TOC signature, the locally computed ledger and the
//! list of image tags that were overwritten. Once the payload is fully
//! read, [`ArchiveVerifier::verify`] decides whether the extracted state
//! may stay or has to be rolled back.

use std::io::Read;
use std::path::Path;

use crate::archive::TOC_FILENAME;
use crate::crypto::TocVerifier;
use crate::error::{Error, Result};
use crate::image::{ImageImporter, ImageRef};
use crate::ledger::{HashAlgorithm, SignatureLedger};

/// Holds everything needed to decide the fate of an unsealed archive.
pub struct ArchiveVerifier {
    signature_verifier: Box<dyn TocVerifier>,
    toc: Option<Vec<u8>>,
    toc_signature: Option<Vec<u8>>,
    unsafe_tags: Vec<ImageRef>,
    ledger: SignatureLedger,
}

impl ArchiveVerifier {
    pub fn new(signature_verifier: Box<dyn TocVerifier>, algorithm: HashAlgorithm) -> Self {
        ArchiveVerifier {
            signature_verifier,
            toc: None,
            toc_signature: None,
            unsafe_tags: Vec::new(),
            ledger: SignatureLedger::new(algorithm),
        }
    }

    pub fn ledger(&self) -> &SignatureLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut SignatureLedger {
        &mut self.ledger
    }

    /// Buffers a `.sealpack.toc` / `.sealpack.toc.sig` entry.
    pub fn add_toc_component(&mut self, entry_name: &str, reader: &mut dyn Read) -> Result<()> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        if entry_name == TOC_FILENAME {
            self.toc = Some(buf);
        } else {
            self.toc_signature = Some(buf);
        }
        Ok(())
    }

    /// Records a tag that was overwritten during import and is therefore
    /// eligible for rollback.
    pub fn add_unsafe_tag(&mut self, tag: ImageRef) {
        self.unsafe_tags.push(tag);
    }

    pub fn unsafe_tags(&self) -> &[ImageRef] {
        &self.unsafe_tags
    }

    /// Checks the received TOC against the computed ledger, then the TOC
    /// signature against the sender's key.
    ///
    /// On signature failure everything extracted so far is rolled back:
    /// `output_path` is deleted (best-effort) and every unsafe tag is handed
    /// to the importer's `remove_all`. Rollback problems are logged but
    /// never mask the verification error.
    pub fn verify(&self, output_path: &Path, importer: &mut dyn ImageImporter) -> Result<()> {
        let toc = self.toc.as_deref().unwrap_or_default();
        if toc != self.ledger.to_bytes().as_slice() {
            return Err(Error::TocMismatch);
        }

        let signature = self.toc_signature.as_deref().unwrap_or_default();
        if let Err(err) = self.signature_verifier.verify(toc, signature) {
            if let Err(rm) = std::fs::remove_dir_all(output_path) {
                log::error!("could not roll back files: {rm}");
            }
            importer.remove_all(&self.unsafe_tags);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TOC_SIGNATURE_FILENAME;

    /// Verifier capability with a switchable outcome.
    struct StubVerifier {
        ok: bool,
    }

    impl TocVerifier for StubVerifier {
        fn verify(&self, _message: &[u8], _signature: &[u8]) -> Result<()> {
            if self.ok {
                Ok(())
            } else {
                Err(Error::SignatureInvalid)
            }
        }
    }

    #[derive(Default)]
    struct RollbackSpy {
        removed: Vec<String>,
    }

    impl ImageImporter for RollbackSpy {
        fn import(&mut self, _image: &ImageRef, _reader: &mut dyn Read) -> Result<bool> {
            unreachable!("verify never imports");
        }

        fn remove_all(&mut self, tags: &[ImageRef]) {
            self.removed.extend(tags.iter().map(|t| t.to_string()));
        }
    }

    fn populated(ok: bool) -> ArchiveVerifier {
        let mut verifier = ArchiveVerifier::new(Box::new(StubVerifier { ok }), HashAlgorithm::Sha256);
        verifier.ledger_mut().add("hello.txt", b"content");
        let toc = verifier.ledger().to_bytes();
        verifier
            .add_toc_component(TOC_FILENAME, &mut toc.as_slice())
            .unwrap();
        verifier
            .add_toc_component(TOC_SIGNATURE_FILENAME, &mut b"sig".as_slice())
            .unwrap();
        verifier
    }

    #[test]
    fn test_verify_passes_when_toc_and_signature_match() {
        let verifier = populated(true);
        let dir = tempfile::tempdir().unwrap();
        let mut spy = RollbackSpy::default();
        verifier.verify(dir.path(), &mut spy).unwrap();
        assert!(spy.removed.is_empty());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_toc_mismatch_fails_without_rollback() {
        let mut verifier = populated(true);
        verifier.ledger_mut().add("tampered.txt", b"surprise");

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"content").unwrap();
        let mut spy = RollbackSpy::default();

        let err = verifier.verify(dir.path(), &mut spy).unwrap_err();
        assert!(matches!(err, Error::TocMismatch));
        // Mismatch is reported before the signature stage; no rollback yet.
        assert!(dir.path().join("hello.txt").exists());
        assert!(spy.removed.is_empty());
    }

    #[test]
    fn test_signature_failure_rolls_back_files_and_tags() {
        let mut verifier = populated(false);
        verifier.add_unsafe_tag(ImageRef::parse("alpine:3.17"));
        verifier.add_unsafe_tag(ImageRef::parse("cr.example.com/a/b:1"));

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("unsealed");
        std::fs::create_dir_all(output.join("sub")).unwrap();
        std::fs::write(output.join("sub/file.txt"), b"extracted").unwrap();

        let mut spy = RollbackSpy::default();
        let err = verifier.verify(&output, &mut spy).unwrap_err();
        assert!(matches!(err, Error::SignatureInvalid));
        assert!(!output.exists(), "output dir should be deleted");
        assert_eq!(
            spy.removed,
            vec!["docker.io/alpine:3.17", "cr.example.com/a/b:1"]
        );
    }

    #[test]
    fn test_rollback_errors_do_not_mask_verification_error() {
        let verifier = populated(false);
        let mut spy = RollbackSpy::default();
        // Nonexistent output path: remove_dir_all fails, but the original
        // verification error is still what comes back.
        let err = verifier
            .verify(Path::new("/nonexistent/sealpack-output"), &mut spy)
            .unwrap_err();
        assert!(matches!(err, Error::SignatureInvalid));
    }

    #[test]
    fn test_missing_toc_is_a_mismatch() {
        let mut verifier =
            ArchiveVerifier::new(Box::new(StubVerifier { ok: true }), HashAlgorithm::Sha256);
        verifier.ledger_mut().add("present.txt", b"data");
        let dir = tempfile::tempdir().unwrap();
        let mut spy = RollbackSpy::default();
        let err = verifier.verify(dir.path(), &mut spy).unwrap_err();
        assert!(matches!(err, Error::TocMismatch));
    }
}
