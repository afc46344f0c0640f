//! The Iris File Extension container format.
//!
//! Split into the data model ([`types`]), the bit-exact wire layout
//! ([`layout`]), structural validation ([`validate`]) and the parsed
//! runtime view ([`abstraction`]).

pub mod abstraction;
pub mod layout;
pub mod types;
pub mod validate;

pub use abstraction::{abstract_file_structure, image_block_bytes, FileAbstraction};
pub use layout::{is_iris_codec_file, AssociatedImageRecord, FileHeader, FILE_HEADER_SIZE};
pub use types::{
    AssociatedImageInfo, AttributeType, Attributes, Encoding, Extent, Format, ImageEncoding,
    LayerExtent, Metadata, Orientation, Subsampling, TileEntry, TileTable, Version,
    DEFAULT_QUALITY, NULL_OFFSET, TILE_EXTENT, TILE_PIX_AREA,
};
pub use validate::{validate_file_structure, ValidationReport};
