use std::path::PathBuf;

use thiserror::Error;

/// Errors from the memory-mapped file handle.
#[derive(Debug, Error)]
pub enum FileError {
    /// Error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is smaller than the requested mapping or resize target
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// A zero-byte mapping was requested
    #[error("Cannot map a zero-length file")]
    EmptyMapping,

    /// Rename attempted on a file whose OS link has been removed
    #[error("File is an unlinked temporary file and cannot be renamed")]
    Unlinked,

    /// Write attempted on a read-only mapping
    #[error("File was opened without write access")]
    ReadOnly,

    /// A write or read extends past the end of the mapping
    #[error("Mapped range out of bounds: offset {offset} + {len} exceeds size {size}")]
    RangeOutOfBounds { offset: u64, len: u64, size: u64 },
}

/// Errors related to buffer ownership and growth.
#[derive(Debug, Clone, Error)]
pub enum BufferError {
    /// Growth operation on a weak (borrowed) buffer
    #[error("Cannot append to a weak buffer: weak buffers borrow external memory")]
    WeakAppend,

    /// Requested size exceeds the buffer capacity
    #[error("Size {requested} exceeds buffer capacity {capacity}")]
    SizeExceedsCapacity { requested: usize, capacity: usize },
}

/// Errors from parsing or validating the Iris container structure.
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    /// Invalid magic bytes at the start of the file
    #[error("Not an Iris file: bad magic bytes {0:02X?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported container revision
    #[error("Unsupported Iris extension version: {0}")]
    UnsupportedVersion(u8),

    /// File is too small to contain the fixed-size file header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// A block offset points outside the file
    #[error("Invalid {block} offset {offset}: outside file of {file_size} bytes")]
    OffsetOutOfBounds {
        block: &'static str,
        offset: u64,
        file_size: u64,
    },

    /// A recovery offset stored inside a block disagrees with its location
    #[error("Corrupt {block} block: recorded offset {recorded} does not match actual {actual}")]
    RecoveryMismatch {
        block: &'static str,
        recorded: u64,
        actual: u64,
    },

    /// A declared array or blob does not fit within the file
    #[error("{block} block of {len} bytes at offset {offset} exceeds file size {file_size}")]
    BlockTruncated {
        block: &'static str,
        offset: u64,
        len: u64,
        file_size: u64,
    },

    /// Tile count arithmetic does not match the layer extents
    #[error("Tile count mismatch: header declares {declared}, extents sum to {computed}")]
    TileCountMismatch { declared: u64, computed: u64 },

    /// A field holds a value outside its enumeration
    #[error("Invalid {field} value: {value}")]
    InvalidField { field: &'static str, value: u64 },

    /// Structural validation failed with one or more recorded errors
    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Errors from the image codec context.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No compressed bytes were provided
    #[error("No compressed source bytes provided")]
    EmptySource,

    /// Pixel buffer is the wrong size for the stated dimensions and format
    #[error("Pixel buffer of {actual} bytes does not match expected {expected} ({width}x{height})")]
    PixelSizeMismatch {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
    },

    /// The encoding is not supported by the built codec backends
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(&'static str),

    /// An undefined pixel format reached the codec boundary
    #[error("Undefined pixel format")]
    UndefinedFormat,

    /// The underlying codec failed to decode
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// The underlying codec failed to encode
    #[error("Encode error: {message}")]
    Encode { message: String },
}

/// Errors reading tiles or associated images from a slide.
#[derive(Debug, Error)]
pub enum SlideError {
    /// Layer index exceeds the slide extent
    #[error("Layer {layer} out of bounds: slide has {layers} layers")]
    LayerOutOfBounds { layer: u32, layers: u32 },

    /// Tile index exceeds the layer extent
    #[error("Tile {tile} out of bounds: layer {layer} has {tiles} tiles")]
    TileOutOfBounds { layer: u32, tile: u32, tiles: u32 },

    /// No associated image carries the requested label
    #[error("No associated image labeled \"{0}\"")]
    UnknownImageLabel(String),

    /// Underlying file error
    #[error("File error: {0}")]
    File(#[from] FileError),

    /// Container structure error
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Decompression error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised while encoding a slide.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder is not in a state that permits the operation
    #[error("Encoder is {state}: {message}")]
    InvalidState {
        state: &'static str,
        message: &'static str,
    },

    /// The source file could not be recognized by any available reader
    #[error("Unrecognized source file {0}: no available decoder claims it")]
    UnrecognizedSource(PathBuf),

    /// The source file does not exist
    #[error("Source file does not exist: {0}")]
    MissingSource(PathBuf),

    /// The destination is not a usable directory
    #[error("Invalid destination directory: {0}")]
    InvalidDestination(PathBuf),

    /// A tile read from the source failed
    #[error("Failed to read source tile [layer {layer}, tile {tile}]: {message}")]
    SourceRead {
        layer: u32,
        tile: u32,
        message: String,
    },

    /// The run was interrupted before completion
    #[error("Encoding interrupted")]
    Interrupted,

    /// Post-encode validation found an incomplete or unwritten tile
    #[error("Tile write validation failed: layer {layer}, tile {tile} ({message})")]
    IncompleteTile {
        layer: u32,
        tile: u32,
        message: &'static str,
    },

    /// Underlying file error
    #[error("File error: {0}")]
    File(#[from] FileError),

    /// Container structure error
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Compression error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Slide read error (Iris-to-Iris transcode path)
    #[error("Slide error: {0}")]
    Slide(#[from] SlideError),
}

/// Errors from the HTTP range reader.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// The server did not advertise a Content-Length
    #[error("Server did not return Content-Length")]
    MissingContentLength,

    /// A ranged request was answered with the wrong status code
    #[error("Expected 206 Partial Content, got {0}")]
    UnexpectedStatus(u16),

    /// The server returned a different byte count than requested
    #[error("Short range read: requested {requested} bytes, got {received}")]
    ShortRead { requested: u64, received: u64 },

    /// Requested range exceeds the remote resource
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Layer or tile index exceeds the remote slide extent
    #[error("Slide error: {0}")]
    Slide(#[from] SlideError),

    /// Remote container failed structural validation
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        RemoteError::Http(error.to_string())
    }
}
