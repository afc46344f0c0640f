//! Core data model for the Iris File Extension container.
//!
//! These types describe a slide independently of its byte layout: the
//! pyramid geometry ([`Extent`]), the per-tile locators ([`TileEntry`],
//! [`TileTable`]) and the metadata block ([`Metadata`], [`Attributes`]).
//! The wire encoding of each lives in [`super::layout`].

use std::collections::{BTreeMap, BTreeSet};

/// Pixel edge length of every tile. All slides are stored as grids of
/// 256x256 tiles; edge tiles are padded to full size with the background
/// color.
pub const TILE_EXTENT: u32 = 256;

/// Pixels per tile (256 * 256).
pub const TILE_PIX_AREA: usize = (TILE_EXTENT as usize) * (TILE_EXTENT as usize);

/// Sentinel offset meaning "block not present".
pub const NULL_OFFSET: u64 = 0;

/// Default image encoding quality (maps to the JPEG / AVIF quality scale).
pub const DEFAULT_QUALITY: u8 = 90;

// =============================================================================
// Version
// =============================================================================

/// Codec version triple recorded in encoded files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl Version {
    /// The version of this codec build, stamped into encoded files.
    pub fn codec() -> Version {
        Version {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            build: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

// =============================================================================
// Pixel formats and encodings
// =============================================================================

/// Uncompressed pixel byte layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    B8G8R8 = 1,
    R8G8B8 = 2,
    B8G8R8A8 = 3,
    R8G8B8A8 = 4,
}

impl Format {
    /// Decode the on-disk byte value.
    pub fn from_u8(value: u8) -> Option<Format> {
        match value {
            1 => Some(Format::B8G8R8),
            2 => Some(Format::R8G8B8),
            3 => Some(Format::B8G8R8A8),
            4 => Some(Format::R8G8B8A8),
            _ => None,
        }
    }

    /// Bytes per pixel.
    pub fn channels(&self) -> usize {
        match self {
            Format::B8G8R8 | Format::R8G8B8 => 3,
            Format::B8G8R8A8 | Format::R8G8B8A8 => 4,
        }
    }

    /// Whether red and blue are swapped relative to RGB order.
    pub fn is_bgr(&self) -> bool {
        matches!(self, Format::B8G8R8 | Format::B8G8R8A8)
    }

    /// Whether the format carries an alpha channel.
    pub fn has_alpha(&self) -> bool {
        self.channels() == 4
    }

    /// Byte size of one full tile in this format.
    pub fn tile_bytes(&self) -> usize {
        TILE_PIX_AREA * self.channels()
    }
}

/// Compressed encoding of tile byte streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Iris = 1,
    Jpeg = 2,
    Avif = 3,
}

impl Encoding {
    pub fn from_u8(value: u8) -> Option<Encoding> {
        match value {
            1 => Some(Encoding::Iris),
            2 => Some(Encoding::Jpeg),
            3 => Some(Encoding::Avif),
            _ => None,
        }
    }

    /// MIME type of a compressed tile stream in this encoding.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Encoding::Iris => "application/octet-stream",
            Encoding::Jpeg => "image/jpeg",
            Encoding::Avif => "image/avif",
        }
    }
}

/// Encoding of associated (non-pyramid) images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    Png = 1,
    Jpeg = 2,
    Avif = 3,
}

impl ImageEncoding {
    pub fn from_u8(value: u8) -> Option<ImageEncoding> {
        match value {
            1 => Some(ImageEncoding::Png),
            2 => Some(ImageEncoding::Jpeg),
            3 => Some(ImageEncoding::Avif),
            _ => None,
        }
    }
}

/// Display orientation of an associated image, in degrees clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Rotate0 = 0,
    Rotate90 = 90,
    Rotate180 = 180,
    Rotate270 = 270,
}

impl Orientation {
    pub fn from_u16(value: u16) -> Option<Orientation> {
        match value {
            0 => Some(Orientation::Rotate0),
            90 => Some(Orientation::Rotate90),
            180 => Some(Orientation::Rotate180),
            270 => Some(Orientation::Rotate270),
            _ => None,
        }
    }
}

/// Chroma subsampling options for lossy encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subsampling {
    S444,
    #[default]
    S422,
    S420,
}

// =============================================================================
// Extent
// =============================================================================

/// Geometry of one resolution layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerExtent {
    /// Number of tiles along the x axis
    pub x_tiles: u32,

    /// Number of tiles along the y axis
    pub y_tiles: u32,

    /// Scale relative to layer 0 (the lowest-resolution layer)
    pub scale: f32,

    /// Downsample factor relative to the highest-resolution layer
    pub downsample: f32,
}

impl LayerExtent {
    /// Number of tiles in this layer.
    pub fn tile_count(&self) -> u64 {
        self.x_tiles as u64 * self.y_tiles as u64
    }
}

/// The pyramid geometry of a slide.
///
/// Layers are ordered lowest to highest resolution: `layers[0]` has
/// `scale == 1` and the last layer has `downsample == 1`. `width` and
/// `height` are the pixel dimensions at layer 0 scale.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<LayerExtent>,
}

impl Extent {
    /// Total tiles across all layers.
    pub fn total_tiles(&self) -> u64 {
        self.layers.iter().map(LayerExtent::tile_count).sum()
    }

    /// Check the layer-ordering invariants.
    pub fn is_ordered(&self) -> bool {
        if self.layers.is_empty() {
            return false;
        }
        self.layers.windows(2).all(|pair| {
            pair[0].x_tiles <= pair[1].x_tiles && pair[0].y_tiles <= pair[1].y_tiles
        })
    }
}

// =============================================================================
// Tile table
// =============================================================================

/// Byte locator of one compressed tile inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileEntry {
    /// Absolute byte offset of the compressed stream
    pub offset: u64,

    /// Compressed stream length in bytes
    pub size: u32,
}

/// The queryable tile locator table of a parsed or in-progress file.
#[derive(Debug, Clone)]
pub struct TileTable {
    pub format: Format,
    pub encoding: Encoding,
    pub extent: Extent,
    /// Per layer, `x_tiles * y_tiles` entries in row-major tile order
    pub layers: Vec<Vec<TileEntry>>,
}

impl TileTable {
    /// Allocate a table with zeroed entries matching `extent`.
    pub fn with_extent(format: Format, encoding: Encoding, extent: Extent) -> TileTable {
        let layers = extent
            .layers
            .iter()
            .map(|layer| vec![TileEntry::default(); layer.tile_count() as usize])
            .collect();
        TileTable {
            format,
            encoding,
            extent,
            layers,
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Convention governing attribute keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeType {
    #[default]
    Undefined = 0,
    I2S = 1,
    Dicom = 2,
    FreeText = 3,
}

impl AttributeType {
    pub fn from_u8(value: u8) -> Option<AttributeType> {
        match value {
            0 => Some(AttributeType::Undefined),
            1 => Some(AttributeType::I2S),
            2 => Some(AttributeType::Dicom),
            3 => Some(AttributeType::FreeText),
            _ => None,
        }
    }
}

/// Key-value metadata attributes with unique keys.
///
/// Values are opaque byte strings; keys are UTF-8. The map is ordered so
/// serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attributes {
    pub kind: AttributeType,
    pub version: u16,
    pub entries: BTreeMap<String, Vec<u8>>,
}

impl Attributes {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Descriptor of an associated (non-pyramid) image such as a label or
/// thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedImageInfo {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    /// Pixel layout of the image before compression
    pub source_format: Format,
    pub orientation: Orientation,
}

/// Slide metadata parsed from (or destined for) the metadata block.
///
/// `microns_per_pixel` and `magnification` are normalized to layer 0.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Metadata {
    pub codec_version: Version,
    pub attributes: Attributes,
    /// Labels of the associated images stored in the file
    pub associated_images: Vec<String>,
    /// Raw ICC color profile, empty when absent
    pub icc_profile: Vec<u8>,
    pub annotation_ids: BTreeSet<u32>,
    pub annotation_groups: BTreeSet<String>,
    pub microns_per_pixel: f32,
    pub magnification: f32,
}

// =============================================================================
// Tests
// =============================================================================
