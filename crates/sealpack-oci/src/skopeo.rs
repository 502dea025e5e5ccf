//! Registry access through skopeo.
//!
//! Saving pulls `docker://<ref>` into an OCI archive file below
//! `<tmp>/.crane.dl/`; importing pushes an OCI archive to the target
//! registry and compares the tag's digest around the push.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Command;

use sealpack::error::{Error, Result};
use sealpack::image::{ImageImporter, ImageRef, ImageSaver};

/// Name of the image download directory below the system temp dir.
const TMP_FOLDER_NAME: &str = ".crane.dl";

fn run_skopeo(args: &[&str]) -> Result<String> {
    log::debug!("skopeo {}", args.join(" "));
    let output = Command::new("skopeo")
        .args(args)
        .output()
        .map_err(|e| Error::Tool {
            tool: "skopeo",
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::Tool {
            tool: "skopeo",
            message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

fn registry_digest(reference: &str) -> Result<String> {
    run_skopeo(&[
        "inspect",
        "--format",
        "{{.Digest}}",
        &format!("docker://{reference}"),
    ])
}

/// Pulls images into local OCI archive files for sealing.
pub struct SkopeoSaver {
    root: PathBuf,
}

impl SkopeoSaver {
    pub fn new() -> SkopeoSaver {
        SkopeoSaver {
            root: std::env::temp_dir().join(TMP_FOLDER_NAME),
        }
    }
}

impl Default for SkopeoSaver {
    fn default() -> Self {
        SkopeoSaver::new()
    }
}

impl ImageSaver for SkopeoSaver {
    fn save_image(&mut self, image: &ImageRef) -> Result<File> {
        let target = self.root.join(image.filename());
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        log::info!("seal: pulling image {image}");
        run_skopeo(&[
            "copy",
            &format!("docker://{image}"),
            &format!("oci-archive:{}", target.display()),
        ])?;
        Ok(File::open(target)?)
    }

    fn cleanup(&mut self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

/// Imports archive entries into a remote registry.
pub struct RegistryImporter {
    target_registry: String,
}

impl RegistryImporter {
    pub fn new(target_registry: &str) -> RegistryImporter {
        RegistryImporter {
            target_registry: target_registry.to_owned(),
        }
    }

    /// The tag rewritten to the configured target registry.
    pub fn target_ref(&self, image: &ImageRef) -> ImageRef {
        image.with_registry(&self.target_registry)
    }
}

impl ImageImporter for RegistryImporter {
    fn import(&mut self, image: &ImageRef, reader: &mut dyn Read) -> Result<bool> {
        let target = self.target_ref(image);

        // skopeo wants a file, so the entry bytes are staged once.
        let mut staged = tempfile::NamedTempFile::new()?;
        std::io::copy(reader, &mut staged)?;
        staged.flush()?;

        let before = registry_digest(&target.to_string()).ok();

        log::info!("unseal: pushing image {target}");
        run_skopeo(&[
            "copy",
            &format!("oci-archive:{}", staged.path().display()),
            &format!("docker://{target}"),
        ])?;

        let after = registry_digest(&target.to_string())?;
        Ok(matches!(&before, Some(digest) if digest != &after))
    }

    fn remove_all(&mut self, tags: &[ImageRef]) {
        for tag in tags {
            let target = self.target_ref(tag);
            log::info!("rollback: deleting image {target}");
            if let Err(err) = run_skopeo(&["delete", &format!("docker://{target}")]) {
                log::error!("could not roll back image {target}: {err}");
            }
        }
    }
}
