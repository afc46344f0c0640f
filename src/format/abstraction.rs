//! Runtime view of a parsed container.
//!
//! [`abstract_file_structure`] validates a mapped file once and parses it
//! into an immutable [`FileAbstraction`]: the tile table split per layer,
//! the metadata block, and locators for the associated image and ICC
//! blocks. Every offset inside the abstraction has been range-checked, so
//! readers can slice the mapping without re-validating.

use std::collections::HashMap;

use crate::error::FormatError;

use super::layout::{
    parse_attributes, parse_icc_header, parse_image_array, parse_layer_extents,
    parse_tile_entries, AssociatedImageRecord, AttributesHeader, FileHeader, MetadataHeader,
    TileTableHeader, ATTRIBUTE_SIZE_ENTRY, ICC_HEADER_SIZE, IMAGE_BLOCK_HEADER_SIZE,
};
use super::types::{Attributes, Extent, Metadata, TileTable, NULL_OFFSET};
use super::validate::validate_file_structure;

/// Immutable parsed view of an Iris container.
///
/// Produced once per open; all offsets are pre-validated.
#[derive(Debug, Clone)]
pub struct FileAbstraction {
    pub header: FileHeader,
    pub tile_table: TileTable,
    pub metadata: Metadata,
    /// Associated image locators, keyed by label
    pub images: HashMap<String, AssociatedImageRecord>,
}

/// Validate a mapped file and parse it into its runtime view.
pub fn abstract_file_structure(bytes: &[u8]) -> Result<FileAbstraction, FormatError> {
    validate_file_structure(bytes).into_result()?;

    let header = FileHeader::parse(bytes)?;
    let table_header = TileTableHeader::parse(&bytes[header.tile_table_offset as usize..])?;

    let layer_extents = parse_layer_extents(
        &bytes[table_header.layer_extents_offset as usize..],
        table_header.layers,
    )?;
    let flat_entries = parse_tile_entries(
        &bytes[table_header.tiles_offset as usize..],
        table_header.tile_count,
    )?;

    // Split the flat entry array back into per-layer tables.
    let mut layers = Vec::with_capacity(layer_extents.len());
    let mut cursor = 0usize;
    for extent in &layer_extents {
        let count = extent.tile_count() as usize;
        layers.push(flat_entries[cursor..cursor + count].to_vec());
        cursor += count;
    }

    let extent = Extent {
        width: table_header.width,
        height: table_header.height,
        layers: layer_extents,
    };
    let tile_table = TileTable {
        format: table_header.format,
        encoding: table_header.encoding,
        extent,
        layers,
    };

    let (metadata, images) = if header.metadata_offset != NULL_OFFSET {
        parse_metadata(bytes, header.metadata_offset)?
    } else {
        (Metadata::default(), HashMap::new())
    };

    Ok(FileAbstraction {
        header,
        tile_table,
        metadata,
        images,
    })
}

fn parse_metadata(
    bytes: &[u8],
    metadata_offset: u64,
) -> Result<(Metadata, HashMap<String, AssociatedImageRecord>), FormatError> {
    let header = MetadataHeader::parse(&bytes[metadata_offset as usize..])?;

    let attributes = if header.attributes_offset != NULL_OFFSET {
        let attr_header = AttributesHeader::parse(&bytes[header.attributes_offset as usize..])?;
        let sizes_len = attr_header.count as u64 * ATTRIBUTE_SIZE_ENTRY;
        let sizes = &bytes[attr_header.sizes_offset as usize
            ..(attr_header.sizes_offset + sizes_len) as usize];
        let blob = &bytes[attr_header.bytes_offset as usize..];
        parse_attributes(&attr_header, sizes, blob)?
    } else {
        Attributes::default()
    };

    let mut images = HashMap::new();
    if header.images_offset != NULL_OFFSET {
        let (_, records) = parse_image_array(&bytes[header.images_offset as usize..])?;
        for record in records {
            images.insert(record.info.label.clone(), record);
        }
    }

    let icc_profile = if header.icc_offset != NULL_OFFSET {
        let (_, size) = parse_icc_header(&bytes[header.icc_offset as usize..])?;
        let start = (header.icc_offset + ICC_HEADER_SIZE) as usize;
        bytes[start..start + size as usize].to_vec()
    } else {
        Vec::new()
    };

    let mut labels: Vec<String> = images.keys().cloned().collect();
    labels.sort();

    let metadata = Metadata {
        codec_version: header.codec_version,
        attributes,
        associated_images: labels,
        icc_profile,
        annotation_ids: Default::default(),
        annotation_groups: Default::default(),
        microns_per_pixel: header.microns_per_pixel,
        magnification: header.magnification,
    };
    Ok((metadata, images))
}

/// Borrow the compressed byte block of an associated image.
pub fn image_block_bytes<'a>(
    bytes: &'a [u8],
    record: &AssociatedImageRecord,
) -> Result<&'a [u8], FormatError> {
    let start = record.block_offset + IMAGE_BLOCK_HEADER_SIZE;
    let end = start + record.data_size;
    bytes
        .get(start as usize..end as usize)
        .ok_or(FormatError::BlockTruncated {
            block: "image block",
            offset: record.block_offset,
            len: IMAGE_BLOCK_HEADER_SIZE + record.data_size,
            file_size: bytes.len() as u64,
        })
}

// =============================================================================
// Tests
// =============================================================================
