//! Container image adapter.
//!
//! Bridges OCI tooling into and out of the archive: images are pulled and
//! pushed through `skopeo` (registries) or imported through the local
//! containerd socket via `ctr`. Both are driven as subprocesses; the
//! pipeline itself only sees the [`sealpack::ImageSaver`] and
//! [`sealpack::ImageImporter`] traits.

mod containerd;
mod skopeo;

pub use containerd::ContainerdImporter;
pub use skopeo::{RegistryImporter, SkopeoSaver};

use sealpack::{ImageImporter, LOCAL_REGISTRY};

/// Selects the importer implementation for the configured target registry:
/// `local` goes through the detected container runtime socket, anything
/// else is treated as a registry URL.
pub fn new_importer(target_registry: &str, namespace: &str) -> Box<dyn ImageImporter> {
    if target_registry == LOCAL_REGISTRY {
        Box::new(ContainerdImporter::new(namespace))
    } else {
        Box::new(RegistryImporter::new(target_registry))
    }
}
