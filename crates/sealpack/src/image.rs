//! Container image references and the adapter seam.
//!
//! Images travel inside the archive as OCI archive files under the reserved
//! `.images/` prefix. The actual pulling, importing and deleting is done by
//! implementations of [`ImageSaver`] and [`ImageImporter`] (see the
//! `sealpack-oci` crate); the pipeline itself only deals with entry names
//! and byte streams.

use std::fmt;
use std::fs::File;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Registry assumed when a reference carries no registry host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when a reference carries no tag.
pub const DEFAULT_TAG: &str = "latest";

/// Archive prefix under which image entries are stored.
pub const IMAGE_PREFIX: &str = ".images";

/// Suffix of image entries inside the archive.
pub const OCI_SUFFIX: &str = ".oci";

/// A container image, identified by registry host, repository name and tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    /// Parses a user-supplied reference string.
    ///
    /// A leading `/` is stripped. The first path segment is taken as the
    /// registry host iff it contains a dot, otherwise `docker.io` is
    /// assumed. The last `:`-suffix is the tag, defaulting to `latest`; a
    /// trailing `.oci` (from archive entry names) is tolerated.
    pub fn parse(reference: &str) -> ImageRef {
        let reference = reference.strip_prefix('/').unwrap_or(reference);

        let (registry, rest) = match reference.split_once('/') {
            Some((first, rest)) if first.contains('.') => (first.to_owned(), rest),
            _ => (DEFAULT_REGISTRY.to_owned(), reference),
        };

        let rest = rest.strip_suffix(OCI_SUFFIX).unwrap_or(rest);
        let (name, tag) = match rest.rsplit_once(':') {
            Some((name, tag)) => (name.to_owned(), tag.to_owned()),
            None => (rest.to_owned(), DEFAULT_TAG.to_owned()),
        };

        ImageRef {
            registry,
            name,
            tag,
        }
    }

    /// Recovers the reference from an archive entry name
    /// (`.images/<registry>/<name>:<tag>.oci`).
    pub fn from_archive_name(entry_name: &str) -> ImageRef {
        let trimmed = entry_name
            .strip_prefix(IMAGE_PREFIX)
            .map(|rest| rest.strip_prefix('/').unwrap_or(rest))
            .unwrap_or(entry_name);
        // The registry is the first segment here, dotted or not.
        match trimmed.split_once('/') {
            Some((registry, rest)) => {
                let rest = rest.strip_suffix(OCI_SUFFIX).unwrap_or(rest);
                let (name, tag) = match rest.rsplit_once(':') {
                    Some((name, tag)) => (name.to_owned(), tag.to_owned()),
                    None => (rest.to_owned(), DEFAULT_TAG.to_owned()),
                };
                ImageRef {
                    registry: registry.to_owned(),
                    name,
                    tag,
                }
            }
            None => ImageRef::parse(trimmed),
        }
    }

    /// The archive entry name for this image.
    pub fn filename(&self) -> String {
        format!(
            "{IMAGE_PREFIX}/{}/{}:{}{OCI_SUFFIX}",
            self.registry, self.name, self.tag
        )
    }

    /// The same image addressed at a different registry.
    pub fn with_registry(&self, registry: &str) -> ImageRef {
        ImageRef {
            registry: registry.to_owned(),
            name: self.name.clone(),
            tag: self.tag.clone(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.name, self.tag)
    }
}

/// Saves images out of a registry into local OCI archive files for sealing.
pub trait ImageSaver {
    /// Pulls `image` and returns an open handle on its OCI archive file.
    fn save_image(&mut self, image: &ImageRef) -> Result<File>;

    /// Removes the temporary download directory. Called unconditionally
    /// after the last image was archived.
    fn cleanup(&mut self) -> Result<()>;
}

/// Imports images from archive entries during unseal.
pub trait ImageImporter {
    /// Imports one image from its OCI archive byte stream.
    ///
    /// Returns `true` when the imported digest differs from whatever the tag
    /// pointed at before, i.e. the tag was overwritten and becomes eligible
    /// for rollback.
    fn import(&mut self, image: &ImageRef, reader: &mut dyn Read) -> Result<bool>;

    /// Rolls back the given tags. Failures are logged per tag; the iteration
    /// never short-circuits.
    fn remove_all(&mut self, tags: &[ImageRef]);
}
