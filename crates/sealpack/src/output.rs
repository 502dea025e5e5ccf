//! Output sinks for the sealed artifact.
//!
//! Three targets are recognised: a plain file path, `-` for stdout, and
//! `s3://bucket/key`. Blob uploads are a pluggable collaborator of the
//! pipeline; the default route buffers to a temp file and hands it to the
//! `aws s3 cp` command line tool, which brings its own credential
//! resolution.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// URI prefix selecting the blob sink.
pub const S3_PREFIX: &str = "s3://";

/// Where the sealed artifact goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
    S3(String),
}

impl OutputTarget {
    pub fn parse(spec: &str) -> OutputTarget {
        if spec == "-" {
            OutputTarget::Stdout
        } else if spec.to_ascii_lowercase().starts_with(S3_PREFIX) {
            OutputTarget::S3(spec.to_owned())
        } else {
            OutputTarget::File(PathBuf::from(spec))
        }
    }

    /// Opens the sink. For blob targets this is a temp file that
    /// [`OutputSink::finish`] uploads.
    pub fn create(&self) -> Result<OutputSink> {
        match self {
            OutputTarget::Stdout => Ok(OutputSink {
                writer: Box::new(std::io::stdout()),
                upload: None,
            }),
            OutputTarget::File(path) => Ok(OutputSink {
                writer: Box::new(File::create(path)?),
                upload: None,
            }),
            OutputTarget::S3(uri) => {
                let temp = NamedTempFile::new()?;
                let writer = Box::new(temp.reopen()?);
                Ok(OutputSink {
                    writer,
                    upload: Some((temp, uri.clone())),
                })
            }
        }
    }
}

/// An open sink; write the artifact, then call [`OutputSink::finish`].
pub struct OutputSink {
    writer: Box<dyn Write>,
    upload: Option<(NamedTempFile, String)>,
}

impl OutputSink {
    pub fn writer(&mut self) -> &mut dyn Write {
        self.writer.as_mut()
    }

    /// Flushes, closes, and performs the deferred blob upload if any.
    pub fn finish(self) -> Result<()> {
        let OutputSink { mut writer, upload } = self;
        writer.flush()?;
        drop(writer);

        if let Some((temp, uri)) = upload {
            log::debug!("uploading artifact to {uri}");
            let output = Command::new("aws")
                .args(["s3", "cp"])
                .arg(temp.path())
                .arg(&uri)
                .output()
                .map_err(|e| Error::Tool {
                    tool: "aws",
                    message: e.to_string(),
                })?;
            if !output.status.success() {
                return Err(Error::Tool {
                    tool: "aws",
                    message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                });
            }
        }
        Ok(())
    }
}
