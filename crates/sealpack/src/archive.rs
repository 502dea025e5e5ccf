//! The layered archive pipeline.
//!
//! On the write path three streaming writers are chained: authenticated
//! encryption (omitted for public archives) feeds the payload temp file,
//! compression feeds encryption, and a tar builder feeds compression. The
//! read path composes the inverse chain; the encryption unwrap happens one
//! layer up in the orchestrator because it needs recipient key material
//! that is not part of the archive.
//!
//! The pipeline exclusively owns the temporary payload file that buffers
//! the stream between archive finalisation and envelope emission; the file
//! is removed on drop on both the success and failure paths.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use tempfile::NamedTempFile;

use crate::crypto::stream::{EncryptWriter, PayloadKey};
use crate::crypto::TocSigner;
use crate::error::{Error, Result};
use crate::image::{ImageImporter, ImageRef, ImageSaver, IMAGE_PREFIX};
use crate::ledger::{EntryHasher, SignatureLedger};
use crate::verifier::ArchiveVerifier;

/// Archive entry holding the canonical ledger serialisation.
pub const TOC_FILENAME: &str = ".sealpack.toc";

/// Archive entry holding the detached TOC signature.
pub const TOC_SIGNATURE_FILENAME: &str = ".sealpack.toc.sig";

const ENTRY_MODE: u32 = 0o755;

/// Payload compression, selected by the envelope's 3-bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    #[default]
    Gzip,
    Zlib,
    /// Currently aliased to gzip; kept so archives written with index 2
    /// stay readable.
    Zip,
    Flate,
}

impl CompressionAlgorithm {
    /// Looks up an algorithm by CLI name, defaulting to gzip with a warning.
    pub fn from_name(name: &str) -> CompressionAlgorithm {
        match name {
            "gzip" => CompressionAlgorithm::Gzip,
            "zlib" => CompressionAlgorithm::Zlib,
            "zip" => CompressionAlgorithm::Zip,
            "flate" => CompressionAlgorithm::Flate,
            other => {
                log::warn!("invalid compression algorithm '{other}', defaulting to 'gzip'");
                CompressionAlgorithm::Gzip
            }
        }
    }

    /// Decodes the envelope index, defaulting to gzip with a warning.
    pub fn from_index(index: u8) -> CompressionAlgorithm {
        match index {
            0 => CompressionAlgorithm::Gzip,
            1 => CompressionAlgorithm::Zlib,
            2 => CompressionAlgorithm::Zip,
            3 => CompressionAlgorithm::Flate,
            other => {
                log::warn!("invalid compression index '{other}', defaulting to 'gzip'");
                CompressionAlgorithm::Gzip
            }
        }
    }

    /// The envelope wire index (fits the 3 high bits of the config byte).
    pub fn index(self) -> u8 {
        match self {
            CompressionAlgorithm::Gzip => 0,
            CompressionAlgorithm::Zlib => 1,
            CompressionAlgorithm::Zip => 2,
            CompressionAlgorithm::Flate => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Zip => "zip",
            CompressionAlgorithm::Flate => "flate",
        }
    }
}

enum CompressWriter<W: Write> {
    Gzip(GzEncoder<W>),
    Zlib(ZlibEncoder<W>),
    Flate(DeflateEncoder<W>),
}

impl<W: Write> CompressWriter<W> {
    fn new(algorithm: CompressionAlgorithm, inner: W) -> CompressWriter<W> {
        match algorithm {
            CompressionAlgorithm::Gzip => {
                CompressWriter::Gzip(GzEncoder::new(inner, Compression::default()))
            }
            CompressionAlgorithm::Zlib => {
                CompressWriter::Zlib(ZlibEncoder::new(inner, Compression::default()))
            }
            CompressionAlgorithm::Zip => {
                log::warn!("ZIP writer currently not implemented, using gzip");
                CompressWriter::Gzip(GzEncoder::new(inner, Compression::default()))
            }
            CompressionAlgorithm::Flate => {
                CompressWriter::Flate(DeflateEncoder::new(inner, Compression::default()))
            }
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            CompressWriter::Gzip(w) => w.finish(),
            CompressWriter::Zlib(w) => w.finish(),
            CompressWriter::Flate(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::Gzip(w) => w.write(buf),
            CompressWriter::Zlib(w) => w.write(buf),
            CompressWriter::Flate(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressWriter::Gzip(w) => w.flush(),
            CompressWriter::Zlib(w) => w.flush(),
            CompressWriter::Flate(w) => w.flush(),
        }
    }
}

enum CompressReader<R: Read> {
    Gzip(GzDecoder<R>),
    Zlib(ZlibDecoder<R>),
    Flate(DeflateDecoder<R>),
}

impl<R: Read> CompressReader<R> {
    fn new(algorithm: CompressionAlgorithm, inner: R) -> CompressReader<R> {
        match algorithm {
            CompressionAlgorithm::Gzip => CompressReader::Gzip(GzDecoder::new(inner)),
            CompressionAlgorithm::Zlib => CompressReader::Zlib(ZlibDecoder::new(inner)),
            CompressionAlgorithm::Zip => {
                log::warn!("ZIP reader currently not implemented, using gzip");
                CompressReader::Gzip(GzDecoder::new(inner))
            }
            CompressionAlgorithm::Flate => CompressReader::Flate(DeflateDecoder::new(inner)),
        }
    }
}

impl<R: Read> Read for CompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CompressReader::Gzip(r) => r.read(buf),
            CompressReader::Zlib(r) => r.read(buf),
            CompressReader::Flate(r) => r.read(buf),
        }
    }
}

/// Either the bare temp file or the AEAD layer in front of it.
enum PayloadWriter {
    Plain(File),
    Encrypted(EncryptWriter<File>),
}

impl PayloadWriter {
    fn finish(self) -> Result<File> {
        match self {
            PayloadWriter::Plain(file) => Ok(file),
            PayloadWriter::Encrypted(writer) => writer.finish(),
        }
    }
}

impl Write for PayloadWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PayloadWriter::Plain(w) => w.write(buf),
            PayloadWriter::Encrypted(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PayloadWriter::Plain(w) => w.flush(),
            PayloadWriter::Encrypted(w) => w.flush(),
        }
    }
}

/// Reader that feeds every byte it passes along into an entry hasher.
///
/// This is the read-side tee: the extractor pulls from it, and once the
/// entry is fully drained the accumulated digest goes into the ledger. The
/// outer entry loop cannot advance before the extractor returned, which
/// preserves the pipeline's ordering guarantee without a pipe thread.
struct HashingReader<R: Read> {
    inner: R,
    hasher: EntryHasher,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R, hasher: EntryHasher) -> HashingReader<R> {
        HashingReader { inner, hasher }
    }

    fn finalize(self) -> Vec<u8> {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn entry_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_mode(ENTRY_MODE);
    header.set_size(size);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );
    header.set_entry_type(tar::EntryType::Regular);
    header
}

/// The write side of the pipeline.
pub struct WriteArchive {
    tar: tar::Builder<CompressWriter<PayloadWriter>>,
    temp: NamedTempFile,
    key: Option<PayloadKey>,
}

impl WriteArchive {
    /// Opens the layered writer chain over a fresh temp file. For sealed
    /// archives a fresh symmetric key is generated and carried through to
    /// [`WriteArchive::finalize`].
    pub fn create(public: bool, compression: CompressionAlgorithm) -> Result<WriteArchive> {
        let temp = NamedTempFile::new()?;
        let sink = temp.reopen()?;
        let (key, payload) = if public {
            (None, PayloadWriter::Plain(sink))
        } else {
            let key = PayloadKey::generate();
            let writer = EncryptWriter::new(sink, &key)?;
            (Some(key), PayloadWriter::Encrypted(writer))
        };
        Ok(WriteArchive {
            tar: tar::Builder::new(CompressWriter::new(compression, payload)),
            temp,
            key,
        })
    }

    /// Adds a small synthetic entry from a byte slice.
    pub fn add_bytes(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        let mut header = entry_header(contents.len() as u64);
        self.tar.append_data(&mut header, name, contents)?;
        Ok(())
    }

    /// Adds an entry streamed from an open file, sizing the tar header from
    /// the file's metadata first.
    pub fn add_file(&mut self, name: &str, file: &mut File) -> Result<()> {
        let size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut header = entry_header(size);
        self.tar.append_data(&mut header, name, file)?;
        Ok(())
    }

    fn add_hashed_file(
        &mut self,
        name: &str,
        file: &mut File,
        ledger: &mut SignatureLedger,
    ) -> Result<()> {
        let size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut header = entry_header(size);
        let mut tee = HashingReader::new(file, ledger.algorithm().hasher());
        self.tar.append_data(&mut header, name, &mut tee)?;
        ledger.insert_digest(name, tee.finalize());
        Ok(())
    }

    /// Adds all configured files (glob-expanded) and images, teeing every
    /// byte into the ledger so the TOC matches exactly what was archived.
    pub fn add_contents(
        &mut self,
        files: &[String],
        images: &[ImageRef],
        ledger: &mut SignatureLedger,
        saver: &mut dyn ImageSaver,
    ) -> Result<()> {
        for pattern in files {
            for path in glob::glob(pattern)? {
                let path = match path {
                    Ok(path) => path,
                    Err(err) => {
                        log::warn!("skipping unreadable glob match: {err}");
                        continue;
                    }
                };
                if !path.is_file() {
                    continue;
                }
                let name = path.to_string_lossy();
                let name = name.strip_prefix('/').unwrap_or(name.as_ref());
                let mut file = File::open(&path)?;
                self.add_hashed_file(name, &mut file, ledger)?;
            }
        }

        let result = self.add_images(images, ledger, saver);
        // The download directory goes away regardless of how the image loop
        // ended.
        if let Err(err) = saver.cleanup() {
            log::warn!("could not clean up image downloads: {err}");
        }
        result
    }

    fn add_images(
        &mut self,
        images: &[ImageRef],
        ledger: &mut SignatureLedger,
        saver: &mut dyn ImageSaver,
    ) -> Result<()> {
        for image in images {
            let mut file = saver.save_image(image)?;
            self.add_hashed_file(&image.filename(), &mut file, ledger)?;
        }
        Ok(())
    }

    /// Appends the TOC and its detached signature as the final two entries.
    /// No entries may be added afterwards.
    pub fn add_toc(&mut self, signer: &dyn TocSigner, ledger: &SignatureLedger) -> Result<()> {
        let toc = ledger.to_bytes();
        self.add_bytes(TOC_FILENAME, &toc)?;
        let signature = signer.sign(&toc)?;
        self.add_bytes(TOC_SIGNATURE_FILENAME, &signature)?;
        Ok(())
    }

    /// Closes the layers in order tar → compression → encryption and
    /// returns the buffered payload together with its byte length (the
    /// envelope's `L` field) and the symmetric key for sealing.
    pub fn finalize(self) -> Result<SealedPayload> {
        let compress = self.tar.into_inner()?;
        let payload = compress.finish()?;
        let file = payload.finish()?;
        file.sync_all()?;
        let payload_len = self.temp.as_file().metadata()?.len();
        Ok(SealedPayload {
            temp: self.temp,
            payload_len,
            key: self.key,
        })
    }
}

/// The finalised payload, still owned by the pipeline's temp file.
pub struct SealedPayload {
    temp: NamedTempFile,
    pub payload_len: u64,
    pub key: Option<PayloadKey>,
}

impl SealedPayload {
    /// A fresh reader over the payload bytes.
    pub fn reader(&self) -> Result<File> {
        Ok(self.temp.reopen()?)
    }
}

/// The read side of the pipeline: decompression over a payload reader,
/// feeding a tar iterator.
pub struct ReadArchive<R: Read> {
    archive: tar::Archive<CompressReader<R>>,
}

impl<R: Read> ReadArchive<R> {
    pub fn open(reader: R, compression: CompressionAlgorithm) -> ReadArchive<R> {
        ReadArchive {
            archive: tar::Archive::new(CompressReader::new(compression, reader)),
        }
    }

    /// Iterates the tar entries, streaming each one to the filesystem or
    /// the image importer while hashing it into the verifier's ledger. TOC
    /// entries are set aside in the verifier instead.
    pub fn unpack(
        &mut self,
        output_path: &Path,
        verifier: &mut ArchiveVerifier,
        importer: &mut dyn ImageImporter,
    ) -> Result<()> {
        let algorithm = verifier.ledger().algorithm();
        for entry in self.archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();

            if entry.header().entry_type() != tar::EntryType::Regular {
                return Err(Error::UnknownEntryType(name));
            }

            if name.starts_with(TOC_FILENAME) {
                verifier.add_toc_component(&name, &mut entry)?;
                continue;
            }

            let mut tee = HashingReader::new(&mut entry, algorithm.hasher());
            if name.starts_with(IMAGE_PREFIX) {
                let image = ImageRef::from_archive_name(&name);
                log::debug!("unseal: importing image {image}");
                if importer.import(&image, &mut tee)? {
                    verifier.add_unsafe_tag(image);
                }
            } else {
                let target = output_path.join(&name);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                log::debug!("unseal: extracting {name}");
                let mut out = File::create(&target)?;
                io::copy(&mut tee, &mut out)?;
                out.sync_all()?;
            }
            let digest = tee.finalize();
            verifier.ledger_mut().insert_digest(&name, digest);
        }
        Ok(())
    }
}
