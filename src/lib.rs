//! # Iris Codec
//!
//! Encoder and reader for the Iris File Extension (`.iris`): a tiled,
//! memory-mappable container for whole-slide microscopy images (WSI).
//!
//! The codec transcodes slides into a uniform 256x256 tile pyramid,
//! compresses each tile independently (JPEG or AVIF), and packs tiles
//! and metadata into a single file supporting random-access reads —
//! locally through a shared memory mapping, or remotely through HTTP
//! range requests.
//!
//! ## Architecture
//!
//! - [`io`] - growable memory-mapped file handle and byte buffers
//! - [`format`] - container data model, wire layout, validation and the
//!   parsed runtime view
//! - [`codec`] - JPEG/PNG/AVIF compress/decompress dispatch
//! - [`slide`] - local bounds-checked tile and image reads
//! - [`encoder`] - the multi-threaded read/derive/compress/write
//!   pipeline and its tile sources
//! - [`remote`] - fetch-based reader over HTTP range requests
//! - [`config`] - the encoder CLI configuration
//!
//! ## Encoding a slide
//!
//! ```rust,no_run
//! use iris_codec::{Derivation, EncodeOptions, Encoder, EncoderStatus};
//!
//! let mut options = EncodeOptions::new("slide.png");
//! options.derivation = Derivation::Derive2x;
//!
//! let encoder = Encoder::new(options).expect("source exists");
//! encoder.dispatch().expect("encoding started");
//! encoder.wait();
//! assert_eq!(encoder.status(), EncoderStatus::Inactive);
//! ```
//!
//! ## Reading tiles
//!
//! ```rust,no_run
//! use iris_codec::{Format, Slide};
//!
//! let slide = Slide::open("slide.iris", None).expect("valid slide");
//! let pixels = slide
//!     .read_tile(0, 0, Format::R8G8B8A8, None)
//!     .expect("tile in bounds");
//! assert_eq!(pixels.size(), 256 * 256 * 4);
//! ```

pub mod codec;
pub mod config;
pub mod encoder;
pub mod error;
pub mod format;
pub mod io;
pub mod remote;
pub mod slide;

// Re-export commonly used types
pub use codec::{convert_pixels, CodecContext, Device};
pub use config::EncoderCli;
pub use encoder::{
    derived_extent, open_source, Derivation, EncodeOptions, Encoder, EncoderProgress,
    EncoderStatus, IrisSource, RasterSource, SourceReader, TaskPool,
};
pub use error::{
    BufferError, CodecError, EncodeError, FileError, FormatError, RemoteError, SlideError,
};
pub use format::{
    abstract_file_structure, is_iris_codec_file, validate_file_structure, AssociatedImageInfo,
    AttributeType, Attributes, Encoding, Extent, Format, ImageEncoding, LayerExtent, Metadata,
    Orientation, Subsampling, TileEntry, TileTable, ValidationReport, Version, DEFAULT_QUALITY,
    TILE_EXTENT, TILE_PIX_AREA,
};
pub use io::{Buffer, SlideFile, Strength};
pub use remote::{HttpRangeClient, RangeFetch, RemoteSlide, RemoteTile};
pub use slide::{Slide, SlideInfo};
