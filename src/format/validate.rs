//! Structural validation of Iris container files.
//!
//! [`validate_file_structure`] performs the full walk the reader relies
//! on: every referenced offset must land inside
//! `[FILE_HEADER_SIZE, file_size)`, every declared array must fit, the
//! recovery offsets embedded in each block must match the block's actual
//! location, and the tile count must equal the sum of the layer extents.
//! A file failing any check is rejected before the reader ever
//! dereferences an offset, so the abstraction layer can trust what it
//! parses.

use crate::error::FormatError;

use super::layout::{
    parse_icc_header, parse_image_array, parse_layer_extents, parse_tile_entries,
    AttributesHeader, FileHeader, MetadataHeader, TileTableHeader, ATTRIBUTES_HEADER_SIZE,
    ATTRIBUTE_SIZE_ENTRY, FILE_HEADER_SIZE, ICC_HEADER_SIZE, LAYER_EXTENT_SIZE,
    METADATA_HEADER_SIZE, TILE_ENTRY_SIZE, TILE_TABLE_HEADER_SIZE,
};
use super::types::NULL_OFFSET;

// =============================================================================
// Validation report
// =============================================================================

/// Outcome of a structural validation pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Fatal structural errors (empty for a valid file)
    pub errors: Vec<FormatError>,

    /// Non-fatal observations
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Whether the file passed all structural checks.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn add_error(&mut self, error: FormatError) {
        self.errors.push(error);
    }

    fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Convert to a `Result`, surfacing the first error for invalid files.
    pub fn into_result(mut self) -> Result<(), FormatError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors.remove(0))
        }
    }
}

// =============================================================================
// Range checks
// =============================================================================

/// Check that `[offset, offset + len)` lies inside the data region of a
/// file of `file_size` bytes.
fn check_block(
    report: &mut ValidationReport,
    block: &'static str,
    offset: u64,
    len: u64,
    file_size: u64,
) -> bool {
    if offset < FILE_HEADER_SIZE || offset >= file_size {
        report.add_error(FormatError::OffsetOutOfBounds {
            block,
            offset,
            file_size,
        });
        return false;
    }
    let end = match offset.checked_add(len) {
        Some(end) => end,
        None => {
            report.add_error(FormatError::BlockTruncated {
                block,
                offset,
                len,
                file_size,
            });
            return false;
        }
    };
    if end > file_size {
        report.add_error(FormatError::BlockTruncated {
            block,
            offset,
            len,
            file_size,
        });
        return false;
    }
    true
}

fn check_recovery(
    report: &mut ValidationReport,
    block: &'static str,
    recorded: u64,
    actual: u64,
) -> bool {
    if recorded != actual {
        report.add_error(FormatError::RecoveryMismatch {
            block,
            recorded,
            actual,
        });
        return false;
    }
    true
}

// =============================================================================
// File structure walk
// =============================================================================

/// Walk all container blocks and range-check every reference.
pub fn validate_file_structure(bytes: &[u8]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let file_size = bytes.len() as u64;

    let header = match FileHeader::parse(bytes) {
        Ok(header) => header,
        Err(error) => {
            report.add_error(error);
            return report;
        }
    };

    if header.file_size != file_size {
        report.add_error(FormatError::FileTooSmall {
            required: header.file_size,
            actual: file_size,
        });
        return report;
    }

    validate_tile_table(&mut report, bytes, header.tile_table_offset, file_size);

    if header.metadata_offset != NULL_OFFSET {
        validate_metadata(&mut report, bytes, header.metadata_offset, file_size);
    } else {
        report.add_warning("file carries no metadata block".to_string());
    }

    report
}

fn validate_tile_table(
    report: &mut ValidationReport,
    bytes: &[u8],
    table_offset: u64,
    file_size: u64,
) {
    if !check_block(
        report,
        "tile table header",
        table_offset,
        TILE_TABLE_HEADER_SIZE,
        file_size,
    ) {
        return;
    }
    let header = match TileTableHeader::parse(&bytes[table_offset as usize..]) {
        Ok(header) => header,
        Err(error) => {
            report.add_error(error);
            return;
        }
    };
    if !check_recovery(report, "tile table header", header.self_offset, table_offset) {
        return;
    }

    // Layer extents
    let extents_len = header.layers as u64 * LAYER_EXTENT_SIZE;
    if !check_block(
        report,
        "layer extents",
        header.layer_extents_offset,
        extents_len,
        file_size,
    ) {
        return;
    }
    let layers = match parse_layer_extents(
        &bytes[header.layer_extents_offset as usize..],
        header.layers,
    ) {
        Ok(layers) => layers,
        Err(error) => {
            report.add_error(error);
            return;
        }
    };
    if layers.is_empty() {
        report.add_error(FormatError::InvalidField {
            field: "layer count",
            value: 0,
        });
        return;
    }

    // Extent invariants: lowest resolution first, anchored at both ends.
    if layers[0].scale != 1.0 {
        report.add_warning(format!(
            "layer 0 scale is {} (expected 1.0)",
            layers[0].scale
        ));
    }
    if let Some(last) = layers.last() {
        if last.downsample != 1.0 {
            report.add_warning(format!(
                "top layer downsample is {} (expected 1.0)",
                last.downsample
            ));
        }
    }
    for pair in layers.windows(2) {
        if pair[0].x_tiles > pair[1].x_tiles || pair[0].y_tiles > pair[1].y_tiles {
            report.add_error(FormatError::InvalidField {
                field: "layer ordering",
                value: pair[1].x_tiles as u64,
            });
            return;
        }
    }

    // Tile count arithmetic
    let computed: u64 = layers
        .iter()
        .map(|layer| layer.x_tiles as u64 * layer.y_tiles as u64)
        .sum();
    if computed != header.tile_count {
        report.add_error(FormatError::TileCountMismatch {
            declared: header.tile_count,
            computed,
        });
        return;
    }

    // Tile entries
    let entries_len = header.tile_count * TILE_ENTRY_SIZE;
    if !check_block(
        report,
        "tile offsets",
        header.tiles_offset,
        entries_len,
        file_size,
    ) {
        return;
    }
    let entries = match parse_tile_entries(&bytes[header.tiles_offset as usize..], header.tile_count)
    {
        Ok(entries) => entries,
        Err(error) => {
            report.add_error(error);
            return;
        }
    };

    let mut spans = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        if entry.size == 0 {
            report.add_error(FormatError::InvalidField {
                field: "tile entry size",
                value: index as u64,
            });
            return;
        }
        if !check_block(
            report,
            "tile bytes",
            entry.offset,
            entry.size as u64,
            file_size,
        ) {
            return;
        }
        spans.push((entry.offset, entry.size as u64));
    }

    // Pairwise non-overlap of tile byte ranges
    spans.sort_unstable();
    for pair in spans.windows(2) {
        if pair[0].0 + pair[0].1 > pair[1].0 {
            report.add_error(FormatError::Validation(format!(
                "tile byte ranges overlap: [{}, {}) and [{}, {})",
                pair[0].0,
                pair[0].0 + pair[0].1,
                pair[1].0,
                pair[1].0 + pair[1].1
            )));
            return;
        }
    }
}

fn validate_metadata(
    report: &mut ValidationReport,
    bytes: &[u8],
    metadata_offset: u64,
    file_size: u64,
) {
    if !check_block(
        report,
        "metadata header",
        metadata_offset,
        METADATA_HEADER_SIZE,
        file_size,
    ) {
        return;
    }
    let header = match MetadataHeader::parse(&bytes[metadata_offset as usize..]) {
        Ok(header) => header,
        Err(error) => {
            report.add_error(error);
            return;
        }
    };
    if !check_recovery(report, "metadata header", header.self_offset, metadata_offset) {
        return;
    }

    if header.icc_offset != NULL_OFFSET {
        validate_icc(report, bytes, header.icc_offset, file_size);
    }
    if header.images_offset != NULL_OFFSET {
        validate_images(report, bytes, header.images_offset, file_size);
    }
    if header.attributes_offset != NULL_OFFSET {
        validate_attributes(report, bytes, header.attributes_offset, file_size);
    }
    if header.annotations_offset != NULL_OFFSET {
        // Reserved block: tolerated but unread by this revision.
        report.add_warning(format!(
            "annotations block at {} is not supported by this codec revision",
            header.annotations_offset
        ));
        check_block(
            report,
            "annotations",
            header.annotations_offset,
            0,
            file_size,
        );
    }
}

fn validate_icc(report: &mut ValidationReport, bytes: &[u8], offset: u64, file_size: u64) {
    if !check_block(report, "ICC profile", offset, ICC_HEADER_SIZE, file_size) {
        return;
    }
    match parse_icc_header(&bytes[offset as usize..]) {
        Ok((self_offset, size)) => {
            if !check_recovery(report, "ICC profile", self_offset, offset) {
                return;
            }
            check_block(report, "ICC profile bytes", offset, ICC_HEADER_SIZE + size, file_size);
        }
        Err(error) => report.add_error(error),
    }
}

fn validate_images(report: &mut ValidationReport, bytes: &[u8], offset: u64, file_size: u64) {
    if !check_block(report, "image array", offset, 0, file_size) {
        return;
    }
    match parse_image_array(&bytes[offset as usize..]) {
        Ok((self_offset, records)) => {
            if !check_recovery(report, "image array", self_offset, offset) {
                return;
            }
            for record in &records {
                if !check_block(
                    report,
                    "image block",
                    record.block_offset,
                    record.data_size,
                    file_size,
                ) {
                    return;
                }
                match parse_icc_or_image_block(bytes, record.block_offset) {
                    Ok((block_self, data_size)) => {
                        if !check_recovery(report, "image block", block_self, record.block_offset) {
                            return;
                        }
                        if data_size != record.data_size {
                            report.add_error(FormatError::Validation(format!(
                                "image block at {} declares {} bytes, array record says {}",
                                record.block_offset, data_size, record.data_size
                            )));
                            return;
                        }
                    }
                    Err(error) => {
                        report.add_error(error);
                        return;
                    }
                }
            }
        }
        Err(error) => report.add_error(error),
    }
}

fn parse_icc_or_image_block(bytes: &[u8], offset: u64) -> Result<(u64, u64), FormatError> {
    super::layout::parse_image_block_header(&bytes[offset as usize..])
}

fn validate_attributes(report: &mut ValidationReport, bytes: &[u8], offset: u64, file_size: u64) {
    if !check_block(
        report,
        "attributes header",
        offset,
        ATTRIBUTES_HEADER_SIZE,
        file_size,
    ) {
        return;
    }
    let header = match AttributesHeader::parse(&bytes[offset as usize..]) {
        Ok(header) => header,
        Err(error) => {
            report.add_error(error);
            return;
        }
    };
    if !check_recovery(report, "attributes header", header.self_offset, offset) {
        return;
    }
    let sizes_len = header.count as u64 * ATTRIBUTE_SIZE_ENTRY;
    if !check_block(
        report,
        "attribute sizes",
        header.sizes_offset,
        sizes_len,
        file_size,
    ) {
        return;
    }
    // The blob length is the sum of the declared entry sizes.
    let sizes = &bytes[header.sizes_offset as usize..(header.sizes_offset + sizes_len) as usize];
    let mut blob_len = 0u64;
    for entry in 0..header.count as usize {
        let record = &sizes[entry * ATTRIBUTE_SIZE_ENTRY as usize..];
        blob_len += super::layout::read_u16_le(record) as u64
            + super::layout::read_u32_le(&record[2..]) as u64;
    }
    check_block(
        report,
        "attribute bytes",
        header.bytes_offset,
        blob_len,
        file_size,
    );
}

// =============================================================================
// Tests
// =============================================================================
