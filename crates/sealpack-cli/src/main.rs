//! The sealpack command line: seal, inspect and unseal archives.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use sealpack::{CompressionAlgorithm, HashAlgorithm, SealConfig, UnsealConfig};
use sealpack_oci::SkopeoSaver;

/// A cryptographic sealing packager
#[derive(Debug, Parser)]
#[clap(name = "sealpack", version)]
struct App {
    /// Logging verbosity
    #[clap(short = 'l', long, global = true, value_enum, default_value = "info")]
    loglevel: LogLevel,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> LevelFilter {
        match level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            // `fatal` exists for compatibility; everything fatal is logged
            // at error level anyway.
            LogLevel::Error | LogLevel::Fatal => LevelFilter::Error,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a sealed package
    Seal {
        /// Path to the private signing key. AWS KMS keys can be used with
        /// awskms:/// prefix
        #[clap(short = 'p', long)]
        privkey: String,

        /// Paths of recipients' public keys. AWS KMS keys can be used with
        /// awskms:/// prefix
        #[clap(short = 'r', long = "recipient-pubkey", conflicts_with = "public")]
        recipient_pubkey: Vec<String>,

        /// Filename to store the result in; '-' for stdout, s3://bucket/key
        /// for blob storage
        #[clap(short = 'o', long)]
        output: String,

        /// Don't encrypt, contents are signed only and can be retrieved
        /// from any receiver
        #[clap(long)]
        public: bool,

        /// Provide all contents as a central configuration file (supports
        /// JSON, YAML)
        #[clap(short = 'c', long)]
        contents: Option<PathBuf>,

        /// Path to the files to be added
        #[clap(short = 'f', long = "file")]
        files: Vec<String>,

        /// Name of container images to be added
        #[clap(short = 'i', long = "image")]
        images: Vec<String>,

        /// Name of hashing algorithm to be used
        #[clap(short = 'a', long, default_value = "SHA512")]
        hashing_algorithm: String,

        /// Name of compression algorithm to be used [gzip, zlib, zip, flate]
        #[clap(short = 'z', long, default_value = "gzip")]
        compression_algorithm: String,
    },

    /// Inspects a sealed archive and allows for identifying any errors
    Inspect {
        /// The sealed file
        file: PathBuf,
    },

    /// Unpacks a sealed archive if the provided private key is valid
    Unseal {
        /// The sealed file
        file: PathBuf,

        /// Private key of the receiver
        #[clap(short = 'p', long)]
        privkey: Option<String>,

        /// Public key of the signing entity
        #[clap(short = 's', long)]
        signer_key: String,

        /// Output path to unpack the contents to
        #[clap(short = 'o', long, default_value = ".")]
        output: PathBuf,

        /// Name of hashing algorithm to be used
        #[clap(short = 'a', long, default_value = "SHA512")]
        hashing_algorithm: String,

        /// URL of the target registry to import container images; 'local'
        /// imports them locally
        #[clap(short = 'r', long, default_value = "local")]
        target_registry: String,

        /// Namespace to import the images into
        #[clap(short = 'n', long, default_value = "default")]
        namespace: String,
    },
}

fn run(app: App) -> Result<()> {
    match app.cmd {
        Command::Seal {
            privkey,
            recipient_pubkey,
            output,
            public,
            contents,
            files,
            images,
            hashing_algorithm,
            compression_algorithm,
        } => {
            let mut cfg = SealConfig {
                privkey,
                recipient_pubkeys: recipient_pubkey,
                public,
                hashing_algorithm: HashAlgorithm::from_name(&hashing_algorithm),
                compression: CompressionAlgorithm::from_name(&compression_algorithm),
                contents,
                files,
                image_names: images,
                images: Vec::new(),
                output,
            };
            sealpack::seal(&mut cfg, &mut SkopeoSaver::new())?;
        }
        Command::Inspect { file } => {
            let envelope = sealpack::inspect(&file)?;
            print!("{envelope}");
        }
        Command::Unseal {
            file,
            privkey,
            signer_key,
            output,
            hashing_algorithm,
            target_registry,
            namespace,
        } => {
            let cfg = UnsealConfig {
                privkey,
                signer_key,
                output_path: output,
                hashing_algorithm: HashAlgorithm::from_name(&hashing_algorithm),
                target_registry: target_registry.clone(),
                namespace: namespace.clone(),
            };
            let mut importer = sealpack_oci::new_importer(&target_registry, &namespace);
            sealpack::unseal(&file, &cfg, importer.as_mut())?;
        }
    }
    Ok(())
}

fn main() {
    let app = App::parse();

    env_logger::Builder::from_default_env()
        .filter_level(app.loglevel.into())
        .format_timestamp(None)
        .init();

    if let Err(err) = run(app) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
