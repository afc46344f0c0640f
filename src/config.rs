//! Configuration for the encoder CLI.
//!
//! Command-line arguments are parsed with clap and can fall back to
//! environment variables with the `IRIS_` prefix:
//!
//! - `IRIS_SOURCE` - source slide path
//! - `IRIS_OUTDIR` - output directory
//! - `IRIS_ENCODING` - tile encoding (`jpeg` or `avif`)
//! - `IRIS_DERIVE` - layer derivation (`2x`, `4x` or `use-source`)
//! - `IRIS_QUALITY` - encoding quality (1-100)
//! - `IRIS_CONCURRENCY` - worker thread count

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::encoder::{Derivation, EncodeOptions};
use crate::format::{Encoding, DEFAULT_QUALITY};

// =============================================================================
// Argument enums
// =============================================================================

/// Tile encoding choices exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EncodingArg {
    Jpeg,
    Avif,
}

impl From<EncodingArg> for Encoding {
    fn from(arg: EncodingArg) -> Encoding {
        match arg {
            EncodingArg::Jpeg => Encoding::Jpeg,
            EncodingArg::Avif => Encoding::Avif,
        }
    }
}

/// Derivation choices exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeriveArg {
    /// Generate each half-size layer (like DZI pyramids)
    #[value(name = "2x")]
    TwoX,
    /// Generate one layer per 4x downsample (like SVS files)
    #[value(name = "4x")]
    FourX,
    /// Copy the layers the source already has
    #[value(name = "use-source")]
    UseSource,
}

impl From<DeriveArg> for Derivation {
    fn from(arg: DeriveArg) -> Derivation {
        match arg {
            DeriveArg::TwoX => Derivation::Derive2x,
            DeriveArg::FourX => Derivation::Derive4x,
            DeriveArg::UseSource => Derivation::UseSource,
        }
    }
}

// =============================================================================
// CLI
// =============================================================================

/// Iris Codec Encoder - encode whole slide images into the Iris File
/// Extension format (.iris).
///
/// The output file is named after the source: `/outdir/<stem>.iris`.
#[derive(Parser, Debug, Clone)]
#[command(name = "iris-encode")]
#[command(author, version, about, long_about = None)]
pub struct EncoderCli {
    /// File path of the source WSI file.
    #[arg(short, long, env = "IRIS_SOURCE")]
    pub source: PathBuf,

    /// Output directory; defaults to the source file's directory.
    #[arg(short, long, env = "IRIS_OUTDIR")]
    pub outdir: Option<PathBuf>,

    /// Tile encoding of the output file.
    #[arg(short, long, value_enum, default_value_t = EncodingArg::Jpeg, env = "IRIS_ENCODING")]
    pub encoding: EncodingArg,

    /// Generate the lower resolution layers.
    #[arg(short, long, value_enum, default_value_t = DeriveArg::UseSource, env = "IRIS_DERIVE")]
    pub derive: DeriveArg,

    /// Encoding quality (1-100).
    #[arg(short, long, default_value_t = DEFAULT_QUALITY, env = "IRIS_QUALITY")]
    pub quality: u8,

    /// Strip patient identifiers from the encoded metadata.
    #[arg(long, alias = "sm")]
    pub strip_metadata: bool,

    /// Number of encoding threads; defaults to all cores.
    #[arg(short, long, env = "IRIS_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl EncoderCli {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.as_os_str().is_empty() {
            return Err("a source slide path is required. Set --source or IRIS_SOURCE".to_string());
        }
        if !self.source.exists() {
            return Err(format!(
                "source slide file {} does not exist",
                self.source.display()
            ));
        }
        if self.quality == 0 || self.quality > 100 {
            return Err("quality must be between 1 and 100".to_string());
        }
        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                return Err("concurrency must be greater than 0".to_string());
            }
            let cores = num_cpus::get();
            if concurrency > cores {
                return Err(format!(
                    "concurrency {concurrency} exceeds the {cores} available cores; \
                     the encoder is fastest at or below the core count"
                ));
            }
        }
        Ok(())
    }

    /// Convert the CLI arguments into encoder options.
    pub fn into_options(self) -> EncodeOptions {
        EncodeOptions {
            source: self.source,
            destination: self.outdir,
            encoding: self.encoding.into(),
            desired_format: None,
            derivation: self.derive.into(),
            quality: self.quality,
            subsampling: Default::default(),
            strip_metadata: self.strip_metadata,
            concurrency: self.concurrency,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
