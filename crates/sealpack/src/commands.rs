//! The `seal`, `inspect` and `unseal` orchestrators.
//!
//! Failure model: seal is all-or-nothing at the envelope boundary. Any
//! error before envelope emission removes the payload temp file (the
//! archive owns it) and never creates the output sink's final object.
//! Unseal streams everything first and only rolls back on verification
//! failure.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::archive::{ReadArchive, WriteArchive};
use crate::config::{SealConfig, UnsealConfig};
use crate::crypto;
use crate::crypto::stream::{DecryptReader, PayloadKey};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::image::{ImageImporter, ImageSaver};
use crate::ledger::SignatureLedger;
use crate::output::OutputTarget;
use crate::verifier::ArchiveVerifier;

/// Bundles, signs and optionally seals everything in `cfg` into a single
/// artifact.
pub fn seal(cfg: &mut SealConfig, saver: &mut dyn ImageSaver) -> Result<()> {
    cfg.normalize()?;

    let mut envelope = Envelope::new(cfg.hashing_algorithm, cfg.compression);

    log::debug!("seal: bundling archive");
    let mut archive = WriteArchive::create(cfg.public, cfg.compression)?;
    let mut ledger = SignatureLedger::new(cfg.hashing_algorithm);
    archive.add_contents(&cfg.files, &cfg.images, &mut ledger, saver)?;

    log::debug!("seal: adding TOC");
    let signer = crypto::create_signer(&cfg.privkey)?;
    archive.add_toc(signer.as_ref(), &ledger)?;

    let payload = archive.finalize()?;
    envelope.payload_len = payload.payload_len;

    // The payload key exists exactly when the archive is not public.
    if let Some(key) = &payload.key {
        log::debug!(
            "seal: sealing key for {} recipients",
            cfg.recipient_pubkeys.len()
        );
        crypto::seal_keys(&mut envelope, &cfg.recipient_pubkeys, key)?;
    }

    log::debug!("seal: finalize output");
    let payload_file = payload.reader()?;
    let mut sink = OutputTarget::parse(&cfg.output).create()?;
    envelope.write_output(sink.writer(), payload_file)?;
    sink.finish()?;

    log::info!("seal: successfully finished");
    Ok(())
}

/// Parses the envelope of a potentially sealed file without touching the
/// payload.
pub fn inspect(path: &Path) -> Result<Envelope> {
    let mut file = File::open(path)?;
    Envelope::parse(&mut file)
}

/// Decrypts, unpacks and verifies a sealed artifact.
pub fn unseal(path: &Path, cfg: &UnsealConfig, importer: &mut dyn ImageImporter) -> Result<()> {
    log::debug!("unseal: open sealed file");
    let mut file = File::open(path)?;
    let envelope = Envelope::parse(&mut file)?;

    if cfg.hashing_algorithm != envelope.hash_algorithm {
        log::warn!(
            "requested hashes with {}, but the archive negotiates {}",
            cfg.hashing_algorithm,
            envelope.hash_algorithm
        );
    }

    let key = unseal_payload_key(&envelope, cfg)?;

    let signature_verifier = crypto::create_verifier(&cfg.signer_key)?;
    let mut verifier = ArchiveVerifier::new(signature_verifier, envelope.hash_algorithm);

    log::debug!("unseal: read contents from archive");
    let mut payload = envelope.payload_reader(&mut file)?;
    match &key {
        Some(key) => {
            let reader = DecryptReader::new(&mut payload, key)?;
            unpack_archive(reader, &envelope, cfg, &mut verifier, importer)?;
        }
        None => unpack_archive(&mut payload, &envelope, cfg, &mut verifier, importer)?,
    }

    log::debug!("unseal: verifying contents signature");
    verifier.verify(&cfg.output_path, importer)?;

    log::info!("unseal: finished unsealing");
    Ok(())
}

/// Finds the first sealed key the local private key can open.
fn unseal_payload_key(envelope: &Envelope, cfg: &UnsealConfig) -> Result<Option<PayloadKey>> {
    if envelope.is_public() {
        log::info!("unseal: read public archive");
        return Ok(None);
    }

    log::info!(
        "unseal: read archive sealed for {} receivers",
        envelope.receiver_keys.len()
    );
    let privkey = cfg.privkey.as_deref().ok_or(Error::PrivateKeyRequired)?;
    let decrypter = crypto::get_decrypter(privkey)?;
    for sealed in &envelope.receiver_keys {
        match crypto::try_unseal_key(sealed, decrypter.as_ref()) {
            Ok(key) => return Ok(Some(key)),
            Err(err) => log::debug!("unseal: sealed key did not match: {err}"),
        }
    }
    Err(Error::NotForThisKey)
}

fn unpack_archive<R: Read>(
    reader: R,
    envelope: &Envelope,
    cfg: &UnsealConfig,
    verifier: &mut ArchiveVerifier,
    importer: &mut dyn ImageImporter,
) -> Result<()> {
    let mut archive = ReadArchive::open(reader, envelope.compression);
    archive
        .unpack(&cfg.output_path, verifier, importer)
        .map_err(|err| match err {
            // Surface crypto failures smuggled through the reader chain.
            Error::Io(io) => Error::from_io(io),
            other => other,
        })
}
