//! End-to-end seal → inspect → unseal scenarios.
//!
//! Container image operations go through in-memory fakes so the suite runs
//! without a registry or container runtime; everything else is the real
//! pipeline writing real artifacts to disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use similar_asserts::assert_eq;

use sealpack::error::Error;
use sealpack::{
    CompressionAlgorithm, HashAlgorithm, ImageImporter, ImageRef, ImageSaver, SealConfig,
    UnsealConfig,
};

/// Saves "images" from a fixed in-memory catalogue.
#[derive(Default)]
struct FakeSaver {
    catalogue: HashMap<String, Vec<u8>>,
    staging: Option<tempfile::TempDir>,
    saved: usize,
    cleaned_up: bool,
}

impl FakeSaver {
    fn with_image(mut self, reference: &str, bytes: &[u8]) -> FakeSaver {
        self.catalogue
            .insert(ImageRef::parse(reference).to_string(), bytes.to_vec());
        self
    }
}

impl ImageSaver for FakeSaver {
    fn save_image(&mut self, image: &ImageRef) -> sealpack::Result<File> {
        let bytes = self
            .catalogue
            .get(&image.to_string())
            .ok_or_else(|| Error::Image(format!("unknown image {image}")))?
            .clone();
        let staging = match &self.staging {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                let dir = tempfile::tempdir()?;
                let path = dir.path().to_path_buf();
                self.staging = Some(dir);
                path
            }
        };
        self.saved += 1;
        let file_path = staging.join(format!("img-{}.oci", self.saved));
        std::fs::write(&file_path, bytes)?;
        Ok(File::open(file_path)?)
    }

    fn cleanup(&mut self) -> sealpack::Result<()> {
        self.staging = None;
        self.cleaned_up = true;
        Ok(())
    }
}

/// Records imports and rollbacks instead of talking to a runtime.
#[derive(Default)]
struct MemoryImporter {
    imported: HashMap<String, Vec<u8>>,
    removed: Vec<String>,
    overwrite: bool,
}

impl ImageImporter for MemoryImporter {
    fn import(&mut self, image: &ImageRef, reader: &mut dyn Read) -> sealpack::Result<bool> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.imported.insert(image.to_string(), bytes);
        Ok(self.overwrite)
    }

    fn remove_all(&mut self, tags: &[ImageRef]) {
        self.removed.extend(tags.iter().map(|t| t.to_string()));
    }
}

struct KeyFiles {
    _dir: tempfile::TempDir,
    private: String,
    public: String,
}

fn write_keypair(key: &PKey<Private>) -> KeyFiles {
    let dir = tempfile::tempdir().unwrap();
    let private = dir.path().join("key.pem");
    let public = dir.path().join("key.pub.pem");
    std::fs::write(&private, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    std::fs::write(&public, key.public_key_to_pem().unwrap()).unwrap();
    KeyFiles {
        private: private.to_string_lossy().into_owned(),
        public: public.to_string_lossy().into_owned(),
        _dir: dir,
    }
}

fn signer_keys() -> KeyFiles {
    write_keypair(&PKey::generate_ed25519().unwrap())
}

fn rsa_keys(bits: u32) -> KeyFiles {
    write_keypair(&PKey::from_rsa(Rsa::generate(bits).unwrap()).unwrap())
}

/// Files extracted below `root`, as paths relative to it.
fn files_below(root: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                out.push(path.strip_prefix(root).unwrap().to_path_buf());
            }
        }
    }
    let mut out = Vec::new();
    if root.exists() {
        walk(root, root, &mut out);
    }
    out.sort();
    out
}

#[test]
fn test_public_single_file_round_trip() {
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("hello.txt");
    std::fs::write(&input, "Hold your breath and count to 10.").unwrap();

    let signer = signer_keys();
    let artifact = work.path().join("artifact.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        public: true,
        hashing_algorithm: HashAlgorithm::Sha512,
        compression: CompressionAlgorithm::Gzip,
        files: vec![input.to_string_lossy().into_owned()],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    sealpack::seal(&mut cfg, &mut FakeSaver::default()).unwrap();

    // Unseal with only the signer's public key, no private key at all.
    let out_dir = work.path().join("out");
    std::fs::create_dir(&out_dir).unwrap();
    let ucfg = UnsealConfig {
        signer_key: signer.public.clone(),
        output_path: out_dir.clone(),
        ..Default::default()
    };
    let mut importer = MemoryImporter::default();
    sealpack::unseal(&artifact, &ucfg, &mut importer).unwrap();

    let extracted = files_below(&out_dir);
    assert_eq!(extracted.len(), 1, "{extracted:?}");
    assert!(extracted[0].ends_with("hello.txt"));
    assert_eq!(
        std::fs::read(out_dir.join(&extracted[0])).unwrap(),
        b"Hold your breath and count to 10."
    );
    assert!(importer.imported.is_empty());
}

#[test]
fn test_sealed_two_recipients_second_key_unseals() {
    let work = tempfile::tempdir().unwrap();
    let file_a = work.path().join("a.conf");
    let file_b = work.path().join("b.conf");
    std::fs::write(&file_a, "alpha = 1\n").unwrap();
    std::fs::write(&file_b, "beta = 2\n").unwrap();

    let signer = signer_keys();
    let recipient1 = rsa_keys(4096);
    let recipient2 = rsa_keys(4096);
    let artifact = work.path().join("sealed.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        recipient_pubkeys: vec![recipient1.public.clone(), recipient2.public.clone()],
        hashing_algorithm: HashAlgorithm::Sha512,
        compression: CompressionAlgorithm::Gzip,
        files: vec![
            file_a.to_string_lossy().into_owned(),
            file_b.to_string_lossy().into_owned(),
        ],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    sealpack::seal(&mut cfg, &mut FakeSaver::default()).unwrap();

    // The envelope carries both sealed keys, each a 4096-bit modulus long.
    let envelope = sealpack::inspect(&artifact).unwrap();
    assert_eq!(envelope.receiver_keys.len(), 2);
    assert!(envelope.receiver_keys.iter().all(|k| k.len() == 512));

    // Recipient #2 can unseal.
    let out_dir = work.path().join("out");
    std::fs::create_dir(&out_dir).unwrap();
    let ucfg = UnsealConfig {
        privkey: Some(recipient2.private.clone()),
        signer_key: signer.public.clone(),
        output_path: out_dir.clone(),
        ..Default::default()
    };
    sealpack::unseal(&artifact, &ucfg, &mut MemoryImporter::default()).unwrap();

    let extracted = files_below(&out_dir);
    assert_eq!(extracted.len(), 2, "{extracted:?}");

    // A key that is not a recipient cannot.
    let stranger = rsa_keys(4096);
    let out_dir2 = work.path().join("out2");
    std::fs::create_dir(&out_dir2).unwrap();
    let ucfg = UnsealConfig {
        privkey: Some(stranger.private.clone()),
        signer_key: signer.public.clone(),
        output_path: out_dir2.clone(),
        ..Default::default()
    };
    let err = sealpack::unseal(&artifact, &ucfg, &mut MemoryImporter::default()).unwrap_err();
    assert!(matches!(err, Error::NotForThisKey));
    assert!(files_below(&out_dir2).is_empty());
}

#[test]
fn test_sealed_unseal_without_privkey_is_rejected() {
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("secret.txt");
    std::fs::write(&input, "sealed content").unwrap();

    let signer = signer_keys();
    let recipient = rsa_keys(2048);
    let artifact = work.path().join("sealed.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        recipient_pubkeys: vec![recipient.public.clone()],
        files: vec![input.to_string_lossy().into_owned()],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    sealpack::seal(&mut cfg, &mut FakeSaver::default()).unwrap();

    let ucfg = UnsealConfig {
        signer_key: signer.public.clone(),
        output_path: work.path().join("out"),
        ..Default::default()
    };
    let err = sealpack::unseal(&artifact, &ucfg, &mut MemoryImporter::default()).unwrap_err();
    assert!(matches!(err, Error::PrivateKeyRequired));
}

#[test]
fn test_tampered_payload_fails_before_extraction() {
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("data.bin");
    std::fs::write(&input, vec![0x42u8; 4096]).unwrap();

    let signer = signer_keys();
    let recipient = rsa_keys(2048);
    let artifact = work.path().join("sealed.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        recipient_pubkeys: vec![recipient.public.clone()],
        files: vec![input.to_string_lossy().into_owned()],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    sealpack::seal(&mut cfg, &mut FakeSaver::default()).unwrap();

    // Flip one byte inside the payload window (offset 13 is the payload
    // start; skip the nonce prefix into ciphertext).
    let mut bytes = std::fs::read(&artifact).unwrap();
    bytes[13 + 40] ^= 0x01;
    std::fs::write(&artifact, bytes).unwrap();

    let out_dir = work.path().join("out");
    std::fs::create_dir(&out_dir).unwrap();
    let ucfg = UnsealConfig {
        privkey: Some(recipient.private.clone()),
        signer_key: signer.public.clone(),
        output_path: out_dir.clone(),
        ..Default::default()
    };
    let mut importer = MemoryImporter::default();
    let err = sealpack::unseal(&artifact, &ucfg, &mut importer).unwrap_err();
    assert!(matches!(err, Error::Authentication), "{err:?}");

    // Nothing was materialised before the failure.
    assert!(files_below(&out_dir).is_empty());
    assert!(importer.imported.is_empty());
}

#[test]
fn test_bad_signature_extracts_then_rolls_back() {
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("rollback.txt");
    std::fs::write(&input, "will be rolled back").unwrap();

    let signer = signer_keys();
    let wrong_signer = signer_keys();
    let artifact = work.path().join("artifact.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        public: true,
        files: vec![input.to_string_lossy().into_owned()],
        image_names: vec!["alpine:latest".into()],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let mut saver = FakeSaver::default().with_image("alpine:latest", b"fake oci archive bytes");
    sealpack::seal(&mut cfg, &mut saver).unwrap();
    assert!(saver.cleaned_up);

    // Verifying against the wrong signer key must fail after streaming and
    // undo both files and imported tags.
    let out_dir = work.path().join("out");
    std::fs::create_dir(&out_dir).unwrap();
    let ucfg = UnsealConfig {
        signer_key: wrong_signer.public.clone(),
        output_path: out_dir.clone(),
        ..Default::default()
    };
    let mut importer = MemoryImporter {
        overwrite: true,
        ..Default::default()
    };
    let err = sealpack::unseal(&artifact, &ucfg, &mut importer).unwrap_err();
    assert!(matches!(err, Error::SignatureInvalid));

    // The file was extracted during streaming, then the rollback removed
    // the whole output directory.
    assert!(!out_dir.exists());
    // The image had been imported (and overwritten), so it was rolled back.
    assert_eq!(
        importer.imported.get("docker.io/alpine:latest").unwrap(),
        b"fake oci archive bytes"
    );
    assert_eq!(importer.removed, vec!["docker.io/alpine:latest"]);
}

#[test]
fn test_algorithm_negotiation_sha256_flate() {
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("negotiated.txt");
    std::fs::write(&input, "negotiated algorithms").unwrap();

    let signer = signer_keys();
    let artifact = work.path().join("artifact.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        public: true,
        hashing_algorithm: HashAlgorithm::from_name("SHA256"),
        compression: CompressionAlgorithm::from_name("flate"),
        files: vec![input.to_string_lossy().into_owned()],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    sealpack::seal(&mut cfg, &mut FakeSaver::default()).unwrap();

    // Inspect reports the negotiated algorithms and does not mutate the file.
    let before = std::fs::read(&artifact).unwrap();
    let envelope = sealpack::inspect(&artifact).unwrap();
    assert_eq!(envelope.hash_algorithm, HashAlgorithm::Sha256);
    assert_eq!(envelope.compression, CompressionAlgorithm::Flate);
    let text = envelope.to_string();
    assert!(text.contains("SHA-256 (32 Bit)"), "{text}");
    assert!(text.contains("public package"), "{text}");
    assert_eq!(std::fs::read(&artifact).unwrap(), before);

    let out_dir = work.path().join("out");
    std::fs::create_dir(&out_dir).unwrap();
    let ucfg = UnsealConfig {
        signer_key: signer.public.clone(),
        output_path: out_dir.clone(),
        hashing_algorithm: HashAlgorithm::Sha256,
        ..Default::default()
    };
    sealpack::unseal(&artifact, &ucfg, &mut MemoryImporter::default()).unwrap();
    assert_eq!(files_below(&out_dir).len(), 1);
}

#[test]
fn test_images_travel_through_the_archive() {
    let work = tempfile::tempdir().unwrap();
    let signer = signer_keys();
    let artifact = work.path().join("images.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        public: true,
        image_names: vec![
            "alpine:latest".into(),
            "cr.example.com/foo/bar/fnord:3.14".into(),
        ],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let mut saver = FakeSaver::default()
        .with_image("alpine:latest", b"alpine layer data")
        .with_image("cr.example.com/foo/bar/fnord:3.14", b"fnord layer data");
    sealpack::seal(&mut cfg, &mut saver).unwrap();

    let out_dir = work.path().join("out");
    std::fs::create_dir(&out_dir).unwrap();
    let ucfg = UnsealConfig {
        signer_key: signer.public.clone(),
        output_path: out_dir.clone(),
        ..Default::default()
    };
    let mut importer = MemoryImporter::default();
    sealpack::unseal(&artifact, &ucfg, &mut importer).unwrap();

    assert_eq!(
        importer.imported.get("docker.io/alpine:latest").unwrap(),
        b"alpine layer data"
    );
    assert_eq!(
        importer
            .imported
            .get("cr.example.com/foo/bar/fnord:3.14")
            .unwrap(),
        b"fnord layer data"
    );
    // Images never touch the output directory.
    assert!(files_below(&out_dir).is_empty());
}

#[test]
fn test_envelope_layout_of_sealed_artifact() {
    // Sanity-check the envelope layout of a produced artifact: header,
    // payload window, trailer.
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("x.txt");
    std::fs::write(&input, "layout check").unwrap();

    let signer = signer_keys();
    let recipient = rsa_keys(2048);
    let artifact = work.path().join("layout.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        recipient_pubkeys: vec![recipient.public.clone()],
        files: vec![input.to_string_lossy().into_owned()],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    sealpack::seal(&mut cfg, &mut FakeSaver::default()).unwrap();

    let mut file = File::open(&artifact).unwrap();
    let envelope = sealpack::Envelope::parse(&mut file).unwrap();
    let total = std::fs::metadata(&artifact).unwrap().len();
    // magic+config+len + payload + one (len8 + 2048-bit key) record
    assert_eq!(total, 13 + envelope.payload_len + 1 + 256);
    assert_eq!(envelope.receiver_keys[0].len() % 8, 0);

    // The payload window is exactly the bytes between header and trailer.
    let mut window = Vec::new();
    envelope
        .payload_reader(&mut file)
        .unwrap()
        .read_to_end(&mut window)
        .unwrap();
    assert_eq!(window.len() as u64, envelope.payload_len);
}

#[test]
fn test_seal_failure_leaves_no_output() {
    let work = tempfile::tempdir().unwrap();
    let signer = signer_keys();
    let artifact = work.path().join("never-written.ipc");

    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        public: true,
        image_names: vec!["cr.example.com/missing/image:1".into()],
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    // The saver knows no such image, so sealing fails mid-archive.
    let err = sealpack::seal(&mut cfg, &mut FakeSaver::default()).unwrap_err();
    assert!(matches!(err, Error::Image(_)));
    assert!(!artifact.exists());
}

#[test]
fn test_contents_file_drives_seal() {
    let work = tempfile::tempdir().unwrap();
    for name in ["one.txt", "two.txt", "three.txt"] {
        std::fs::write(work.path().join(name), name).unwrap();
    }
    let contents_path = work.path().join("contents.json");
    let mut contents = File::create(&contents_path).unwrap();
    write!(
        contents,
        r#"{{"files": ["{}/*.txt"], "images": ["alpine:latest", "cr.example.com/foo/bar/fnord:3.14"]}}"#,
        work.path().display()
    )
    .unwrap();

    let signer = signer_keys();
    let artifact = work.path().join("from-contents.ipc");
    let mut cfg = SealConfig {
        privkey: signer.private.clone(),
        public: true,
        contents: Some(contents_path),
        output: artifact.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let mut saver = FakeSaver::default()
        .with_image("alpine:latest", b"a")
        .with_image("cr.example.com/foo/bar/fnord:3.14", b"b");
    sealpack::seal(&mut cfg, &mut saver).unwrap();

    let out_dir = work.path().join("out");
    std::fs::create_dir(&out_dir).unwrap();
    let ucfg = UnsealConfig {
        signer_key: signer.public.clone(),
        output_path: out_dir.clone(),
        ..Default::default()
    };
    let mut importer = MemoryImporter::default();
    sealpack::unseal(&artifact, &ucfg, &mut importer).unwrap();

    assert_eq!(files_below(&out_dir).len(), 3);
    assert_eq!(importer.imported.len(), 2);
}
