//! Local image import through the containerd socket.
//!
//! The socket is discovered by scanning `/run` for a socket file named
//! `containerd.sock` and cached for the rest of the invocation. Imports are
//! driven through `ctr`, which talks to the socket directly; the archive
//! entry's tar bytes are streamed over its stdin.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use walkdir::WalkDir;

use sealpack::error::{Error, Result};
use sealpack::image::{ImageImporter, ImageRef};

const SOCKET_FOLDER: &str = "/run";
const SOCKET_FILE: &str = "containerd.sock";

fn is_socket(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path)
            .map(|m| m.file_type().is_socket())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Scans the well-known socket directory for a containerd socket.
pub fn discover_socket() -> Result<PathBuf> {
    for entry in WalkDir::new(SOCKET_FOLDER)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_name() == std::ffi::OsStr::new(SOCKET_FILE) && is_socket(entry.path()) {
            return Ok(entry.into_path());
        }
    }
    Err(Error::Tool {
        tool: "ctr",
        message: format!("no {SOCKET_FILE} found under {SOCKET_FOLDER}"),
    })
}

/// Imports archive entries into a local containerd instance.
pub struct ContainerdImporter {
    namespace: String,
    socket: Option<PathBuf>,
}

impl ContainerdImporter {
    pub fn new(namespace: &str) -> ContainerdImporter {
        ContainerdImporter {
            namespace: namespace.to_owned(),
            socket: None,
        }
    }

    /// Connects lazily: discovers the socket once and validates that the
    /// configured namespace exists.
    fn connect(&mut self) -> Result<PathBuf> {
        if let Some(socket) = &self.socket {
            return Ok(socket.clone());
        }
        let socket = discover_socket()?;
        let output = Command::new("ctr")
            .args(["--address"])
            .arg(&socket)
            .args(["namespaces", "ls", "-q"])
            .output()
            .map_err(|e| Error::Tool {
                tool: "ctr",
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::Tool {
                tool: "ctr",
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        let namespaces = String::from_utf8_lossy(&output.stdout);
        if !namespaces.lines().any(|ns| ns.trim() == self.namespace) {
            return Err(Error::InvalidNamespace);
        }
        self.socket = Some(socket.clone());
        Ok(socket)
    }

    fn ctr(&self, socket: &Path) -> Command {
        let mut cmd = Command::new("ctr");
        cmd.args(["--address"])
            .arg(socket)
            .args(["--namespace", &self.namespace]);
        cmd
    }

    /// The digest currently stored under a reference, if any.
    fn image_digest(&self, socket: &Path, reference: &str) -> Result<Option<String>> {
        let output = self
            .ctr(socket)
            .args(["images", "ls", &format!("name=={reference}")])
            .output()
            .map_err(|e| Error::Tool {
                tool: "ctr",
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::Tool {
                tool: "ctr",
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(parse_image_digest(
            &String::from_utf8_lossy(&output.stdout),
            reference,
        ))
    }
}

/// Pulls the DIGEST column for `reference` out of a `ctr images ls` table.
fn parse_image_digest(table: &str, reference: &str) -> Option<String> {
    table
        .lines()
        .skip(1) // header row
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let _media_type = fields.next()?;
            let digest = fields.next()?;
            (name == reference).then(|| digest.to_owned())
        })
        .next()
}

impl ImageImporter for ContainerdImporter {
    fn import(&mut self, image: &ImageRef, reader: &mut dyn Read) -> Result<bool> {
        let socket = self.connect()?;
        let reference = image.to_string();
        let before = self.image_digest(&socket, &reference)?;

        log::info!("unseal: importing image {reference}");
        let mut child = self
            .ctr(&socket)
            .args(["images", "import", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Tool {
                tool: "ctr",
                message: e.to_string(),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            std::io::copy(reader, &mut stdin)?;
        }
        let output = child.wait_with_output().map_err(|e| Error::Tool {
            tool: "ctr",
            message: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(Error::Tool {
                tool: "ctr",
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let after = self.image_digest(&socket, &reference)?;
        Ok(matches!((&before, &after), (Some(old), Some(new)) if old != new))
    }

    fn remove_all(&mut self, tags: &[ImageRef]) {
        let socket = match self.connect() {
            Ok(socket) => socket,
            Err(err) => {
                log::error!("could not roll back images: {err}");
                return;
            }
        };
        for tag in tags {
            let reference = tag.to_string();
            log::info!("rollback: removing image {reference}");
            let result = self
                .ctr(&socket)
                .args(["images", "rm", &reference])
                .output();
            match result {
                Ok(output) if output.status.success() => {}
                Ok(output) => log::error!(
                    "could not roll back image {reference}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(err) => log::error!("could not roll back image {reference}: {err}"),
            }
        }
    }
}
