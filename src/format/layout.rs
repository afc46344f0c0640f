//! Bit-exact wire layout of the Iris container blocks.
//!
//! All integers are little-endian; all offsets are absolute from the
//! start of the file. Each block embeds its own offset as the first
//! field — a recovery check that validation compares against the block's
//! actual location. Blocks are written bottom-up (tiles, tile offsets,
//! layer extents, tile table header, metadata subblocks, metadata
//! header) and the file header is written last, so a half-written file
//! never carries a valid header.
//!
//! `store_*` functions assemble a block into an owned byte vector which
//! the caller copies into the mapping at the reserved offset; `size_*`
//! functions report the exact byte count a `store_*` call will produce.

use crate::error::FormatError;

use super::types::{
    AssociatedImageInfo, AttributeType, Attributes, Encoding, Format, ImageEncoding, LayerExtent,
    Orientation, TileEntry, Version,
};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes at offset 0 of every Iris container.
pub const MAGIC: [u8; 4] = *b"IRIS";

/// Revision of the extension layout written by this codec.
pub const EXTENSION_VERSION: u8 = 1;

/// Byte size of the fixed file header at offset 0.
pub const FILE_HEADER_SIZE: u64 = 36;

/// Byte size of one tile entry: `{offset: u64, size: u32}`.
pub const TILE_ENTRY_SIZE: u64 = 12;

/// Byte size of one layer extent record.
pub const LAYER_EXTENT_SIZE: u64 = 16;

/// Byte size of the tile table header.
pub const TILE_TABLE_HEADER_SIZE: u64 = 46;

/// Byte size of the metadata header.
pub const METADATA_HEADER_SIZE: u64 = 60;

/// Byte size of the attributes header.
pub const ATTRIBUTES_HEADER_SIZE: u64 = 31;

/// Byte size of one attribute sizes-array entry: `{key: u16, value: u32}`.
pub const ATTRIBUTE_SIZE_ENTRY: u64 = 6;

/// Byte size of the ICC profile block header.
pub const ICC_HEADER_SIZE: u64 = 16;

/// Byte size of an associated image byte-block header.
pub const IMAGE_BLOCK_HEADER_SIZE: u64 = 16;

/// Byte size of the associated image array header.
pub const IMAGE_ARRAY_HEADER_SIZE: u64 = 12;

/// Fixed byte size of one associated image record, before its label.
pub const IMAGE_RECORD_FIXED_SIZE: u64 = 30;

// =============================================================================
// Endian helpers
// =============================================================================

/// Read a little-endian u16 from the start of a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 2 bytes.
#[inline]
pub fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Read a little-endian u32 from the start of a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a little-endian u64 from the start of a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 8 bytes.
#[inline]
pub fn read_u64_le(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Read a little-endian f32 from the start of a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_f32_le(bytes: &[u8]) -> f32 {
    f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn require(buf: &[u8], len: u64, block: &'static str) -> Result<(), FormatError> {
    if (buf.len() as u64) < len {
        return Err(FormatError::BlockTruncated {
            block,
            offset: 0,
            len,
            file_size: buf.len() as u64,
        });
    }
    Ok(())
}

// =============================================================================
// File header
// =============================================================================

/// The fixed-size recovery header at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Total container length in bytes
    pub file_size: u64,

    /// Monotonic revision of the file contents
    pub revision: u32,

    /// Offset of the tile table header
    pub tile_table_offset: u64,

    /// Offset of the metadata header
    pub metadata_offset: u64,
}

impl FileHeader {
    /// Serialize the header into its 36-byte wire form.
    pub fn store(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILE_HEADER_SIZE as usize);
        out.extend_from_slice(&MAGIC);
        out.push(EXTENSION_VERSION);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.revision.to_le_bytes());
        out.extend_from_slice(&self.tile_table_offset.to_le_bytes());
        out.extend_from_slice(&self.metadata_offset.to_le_bytes());
        out
    }

    /// Parse and check the header from the first bytes of a file.
    pub fn parse(buf: &[u8]) -> Result<FileHeader, FormatError> {
        if (buf.len() as u64) < FILE_HEADER_SIZE {
            return Err(FormatError::FileTooSmall {
                required: FILE_HEADER_SIZE,
                actual: buf.len() as u64,
            });
        }
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(FormatError::InvalidMagic(magic));
        }
        if buf[4] != EXTENSION_VERSION {
            return Err(FormatError::UnsupportedVersion(buf[4]));
        }
        Ok(FileHeader {
            file_size: read_u64_le(&buf[8..]),
            revision: read_u32_le(&buf[16..]),
            tile_table_offset: read_u64_le(&buf[20..]),
            metadata_offset: read_u64_le(&buf[28..]),
        })
    }
}

/// Quick signature sniff: does this byte region begin with an Iris
/// container header?
pub fn is_iris_codec_file(bytes: &[u8]) -> bool {
    bytes.len() as u64 >= FILE_HEADER_SIZE
        && bytes[..4] == MAGIC
        && bytes[4] == EXTENSION_VERSION
}

// =============================================================================
// Tile table
// =============================================================================

/// Wire form of the tile table header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileTableHeader {
    /// Recovery copy of this header's own offset
    pub self_offset: u64,
    pub encoding: Encoding,
    pub format: Format,
    /// Offset of the packed tile entry array
    pub tiles_offset: u64,
    /// Offset of the layer extent array
    pub layer_extents_offset: u64,
    /// Number of layers
    pub layers: u32,
    /// Layer 0 pixel width
    pub width: u32,
    /// Layer 0 pixel height
    pub height: u32,
    /// Total tile entries across all layers
    pub tile_count: u64,
}

impl TileTableHeader {
    pub fn store(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TILE_TABLE_HEADER_SIZE as usize);
        out.extend_from_slice(&self.self_offset.to_le_bytes());
        out.push(self.encoding as u8);
        out.push(self.format as u8);
        out.extend_from_slice(&self.tiles_offset.to_le_bytes());
        out.extend_from_slice(&self.layer_extents_offset.to_le_bytes());
        out.extend_from_slice(&self.layers.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.tile_count.to_le_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<TileTableHeader, FormatError> {
        require(buf, TILE_TABLE_HEADER_SIZE, "tile table header")?;
        let encoding = Encoding::from_u8(buf[8]).ok_or(FormatError::InvalidField {
            field: "encoding",
            value: buf[8] as u64,
        })?;
        let format = Format::from_u8(buf[9]).ok_or(FormatError::InvalidField {
            field: "format",
            value: buf[9] as u64,
        })?;
        Ok(TileTableHeader {
            self_offset: read_u64_le(buf),
            encoding,
            format,
            tiles_offset: read_u64_le(&buf[10..]),
            layer_extents_offset: read_u64_le(&buf[18..]),
            layers: read_u32_le(&buf[26..]),
            width: read_u32_le(&buf[30..]),
            height: read_u32_le(&buf[34..]),
            tile_count: read_u64_le(&buf[38..]),
        })
    }
}

/// Exact byte size of the packed tile entry array.
pub fn size_tile_entries(layers: &[Vec<TileEntry>]) -> u64 {
    layers.iter().map(|layer| layer.len() as u64).sum::<u64>() * TILE_ENTRY_SIZE
}

/// Serialize all tile entries, layer-major, lowest resolution first.
pub fn store_tile_entries(layers: &[Vec<TileEntry>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(size_tile_entries(layers) as usize);
    for layer in layers {
        for entry in layer {
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.size.to_le_bytes());
        }
    }
    out
}

/// Parse `count` packed tile entries.
pub fn parse_tile_entries(buf: &[u8], count: u64) -> Result<Vec<TileEntry>, FormatError> {
    require(buf, count * TILE_ENTRY_SIZE, "tile offsets")?;
    let mut entries = Vec::with_capacity(count as usize);
    let mut cursor = 0usize;
    for _ in 0..count {
        entries.push(TileEntry {
            offset: read_u64_le(&buf[cursor..]),
            size: read_u32_le(&buf[cursor + 8..]),
        });
        cursor += TILE_ENTRY_SIZE as usize;
    }
    Ok(entries)
}

/// Exact byte size of the layer extent array.
pub fn size_layer_extents(layers: usize) -> u64 {
    layers as u64 * LAYER_EXTENT_SIZE
}

/// Serialize the layer extents, lowest resolution first.
pub fn store_layer_extents(layers: &[LayerExtent]) -> Vec<u8> {
    let mut out = Vec::with_capacity(size_layer_extents(layers.len()) as usize);
    for layer in layers {
        out.extend_from_slice(&layer.x_tiles.to_le_bytes());
        out.extend_from_slice(&layer.y_tiles.to_le_bytes());
        out.extend_from_slice(&layer.scale.to_le_bytes());
        out.extend_from_slice(&layer.downsample.to_le_bytes());
    }
    out
}

/// Parse `count` layer extent records.
pub fn parse_layer_extents(buf: &[u8], count: u32) -> Result<Vec<LayerExtent>, FormatError> {
    require(buf, count as u64 * LAYER_EXTENT_SIZE, "layer extents")?;
    let mut layers = Vec::with_capacity(count as usize);
    let mut cursor = 0usize;
    for _ in 0..count {
        layers.push(LayerExtent {
            x_tiles: read_u32_le(&buf[cursor..]),
            y_tiles: read_u32_le(&buf[cursor + 4..]),
            scale: read_f32_le(&buf[cursor + 8..]),
            downsample: read_f32_le(&buf[cursor + 12..]),
        });
        cursor += LAYER_EXTENT_SIZE as usize;
    }
    Ok(layers)
}

// =============================================================================
// ICC profile block
// =============================================================================

/// Exact byte size of the ICC profile block.
pub fn size_icc_profile(profile: &[u8]) -> u64 {
    ICC_HEADER_SIZE + profile.len() as u64
}

/// Serialize the ICC profile block at its reserved `offset`.
pub fn store_icc_profile(offset: u64, profile: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(size_icc_profile(profile) as usize);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&(profile.len() as u64).to_le_bytes());
    out.extend_from_slice(profile);
    out
}

/// Parse the ICC profile block header, returning the profile length.
pub fn parse_icc_header(buf: &[u8]) -> Result<(u64, u64), FormatError> {
    require(buf, ICC_HEADER_SIZE, "ICC profile")?;
    Ok((read_u64_le(buf), read_u64_le(&buf[8..])))
}

// =============================================================================
// Associated images
// =============================================================================

/// Locator of one associated image within the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedImageRecord {
    /// Offset of the image's byte block
    pub block_offset: u64,

    /// Compressed image length in bytes
    pub data_size: u64,

    pub info: AssociatedImageInfo,
}

/// Exact byte size of an image byte block.
pub fn size_image_block(data_len: u64) -> u64 {
    IMAGE_BLOCK_HEADER_SIZE + data_len
}

/// Serialize an associated image byte block at its reserved `offset`.
pub fn store_image_block(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(size_image_block(data.len() as u64) as usize);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Parse an image byte-block header, returning `(self_offset, data_size)`.
pub fn parse_image_block_header(buf: &[u8]) -> Result<(u64, u64), FormatError> {
    require(buf, IMAGE_BLOCK_HEADER_SIZE, "image block")?;
    Ok((read_u64_le(buf), read_u64_le(&buf[8..])))
}

/// Exact byte size of the associated image array.
pub fn size_image_array(records: &[AssociatedImageRecord]) -> u64 {
    IMAGE_ARRAY_HEADER_SIZE
        + records
            .iter()
            .map(|record| IMAGE_RECORD_FIXED_SIZE + record.info.label.len() as u64)
            .sum::<u64>()
}

/// Serialize the associated image array at its reserved `offset`.
pub fn store_image_array(offset: u64, records: &[AssociatedImageRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(size_image_array(records) as usize);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        out.extend_from_slice(&record.block_offset.to_le_bytes());
        out.extend_from_slice(&record.data_size.to_le_bytes());
        out.extend_from_slice(&record.info.width.to_le_bytes());
        out.extend_from_slice(&record.info.height.to_le_bytes());
        out.push(record.info.encoding as u8);
        out.push(record.info.source_format as u8);
        out.extend_from_slice(&(record.info.orientation as u16).to_le_bytes());
        out.extend_from_slice(&(record.info.label.len() as u16).to_le_bytes());
        out.extend_from_slice(record.info.label.as_bytes());
    }
    out
}

/// Parse the associated image array from a slice beginning at the array
/// header. Consumes only the declared records.
pub fn parse_image_array(buf: &[u8]) -> Result<(u64, Vec<AssociatedImageRecord>), FormatError> {
    require(buf, IMAGE_ARRAY_HEADER_SIZE, "image array")?;
    let self_offset = read_u64_le(buf);
    let count = read_u32_le(&buf[8..]);
    let mut records = Vec::with_capacity(count as usize);
    let mut cursor = IMAGE_ARRAY_HEADER_SIZE as usize;
    for _ in 0..count {
        if buf.len() < cursor + IMAGE_RECORD_FIXED_SIZE as usize {
            return Err(FormatError::BlockTruncated {
                block: "image record",
                offset: cursor as u64,
                len: IMAGE_RECORD_FIXED_SIZE,
                file_size: buf.len() as u64,
            });
        }
        let record = &buf[cursor..];
        let block_offset = read_u64_le(record);
        let data_size = read_u64_le(&record[8..]);
        let width = read_u32_le(&record[16..]);
        let height = read_u32_le(&record[20..]);
        let encoding = ImageEncoding::from_u8(record[24]).ok_or(FormatError::InvalidField {
            field: "image encoding",
            value: record[24] as u64,
        })?;
        let source_format = Format::from_u8(record[25]).ok_or(FormatError::InvalidField {
            field: "image format",
            value: record[25] as u64,
        })?;
        let orientation_raw = read_u16_le(&record[26..]);
        let orientation =
            Orientation::from_u16(orientation_raw).ok_or(FormatError::InvalidField {
                field: "image orientation",
                value: orientation_raw as u64,
            })?;
        let label_len = read_u16_le(&record[28..]) as usize;
        cursor += IMAGE_RECORD_FIXED_SIZE as usize;
        if buf.len() < cursor + label_len {
            return Err(FormatError::BlockTruncated {
                block: "image label",
                offset: cursor as u64,
                len: label_len as u64,
                file_size: buf.len() as u64,
            });
        }
        let label = String::from_utf8_lossy(&buf[cursor..cursor + label_len]).into_owned();
        cursor += label_len;
        records.push(AssociatedImageRecord {
            block_offset,
            data_size,
            info: AssociatedImageInfo {
                label,
                width,
                height,
                encoding,
                source_format,
                orientation,
            },
        });
    }
    Ok((self_offset, records))
}

// =============================================================================
// Attributes
// =============================================================================

/// Wire form of the attributes header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributesHeader {
    pub self_offset: u64,
    pub kind: AttributeType,
    pub version: u16,
    pub count: u32,
    /// Offset of the sizes array slicing the byte blob
    pub sizes_offset: u64,
    /// Offset of the key/value byte blob
    pub bytes_offset: u64,
}

impl AttributesHeader {
    pub fn store(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ATTRIBUTES_HEADER_SIZE as usize);
        out.extend_from_slice(&self.self_offset.to_le_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.sizes_offset.to_le_bytes());
        out.extend_from_slice(&self.bytes_offset.to_le_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<AttributesHeader, FormatError> {
        require(buf, ATTRIBUTES_HEADER_SIZE, "attributes header")?;
        let kind = AttributeType::from_u8(buf[8]).ok_or(FormatError::InvalidField {
            field: "attribute type",
            value: buf[8] as u64,
        })?;
        Ok(AttributesHeader {
            self_offset: read_u64_le(buf),
            kind,
            version: read_u16_le(&buf[9..]),
            count: read_u32_le(&buf[11..]),
            sizes_offset: read_u64_le(&buf[15..]),
            bytes_offset: read_u64_le(&buf[23..]),
        })
    }
}

/// Exact byte size of the attribute sizes array.
pub fn size_attribute_sizes(attributes: &Attributes) -> u64 {
    attributes.len() as u64 * ATTRIBUTE_SIZE_ENTRY
}

/// Serialize the sizes array: `{key_len: u16, value_len: u32}` per entry
/// in map order.
pub fn store_attribute_sizes(attributes: &Attributes) -> Vec<u8> {
    let mut out = Vec::with_capacity(size_attribute_sizes(attributes) as usize);
    for (key, value) in &attributes.entries {
        out.extend_from_slice(&(key.len() as u16).to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    }
    out
}

/// Exact byte size of the attribute byte blob.
pub fn size_attribute_bytes(attributes: &Attributes) -> u64 {
    attributes
        .entries
        .iter()
        .map(|(key, value)| key.len() as u64 + value.len() as u64)
        .sum()
}

/// Serialize the byte blob: key bytes then value bytes, entry after entry
/// in map order.
pub fn store_attribute_bytes(attributes: &Attributes) -> Vec<u8> {
    let mut out = Vec::with_capacity(size_attribute_bytes(attributes) as usize);
    for (key, value) in &attributes.entries {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(value);
    }
    out
}

/// Rebuild the attribute map from its sizes array and byte blob.
pub fn parse_attributes(
    header: &AttributesHeader,
    sizes: &[u8],
    bytes: &[u8],
) -> Result<Attributes, FormatError> {
    require(sizes, header.count as u64 * ATTRIBUTE_SIZE_ENTRY, "attribute sizes")?;
    let mut attributes = Attributes {
        kind: header.kind,
        version: header.version,
        entries: Default::default(),
    };
    let mut size_cursor = 0usize;
    let mut blob_cursor = 0usize;
    for _ in 0..header.count {
        let key_len = read_u16_le(&sizes[size_cursor..]) as usize;
        let value_len = read_u32_le(&sizes[size_cursor + 2..]) as usize;
        size_cursor += ATTRIBUTE_SIZE_ENTRY as usize;
        if bytes.len() < blob_cursor + key_len + value_len {
            return Err(FormatError::BlockTruncated {
                block: "attribute bytes",
                offset: blob_cursor as u64,
                len: (key_len + value_len) as u64,
                file_size: bytes.len() as u64,
            });
        }
        let key = String::from_utf8_lossy(&bytes[blob_cursor..blob_cursor + key_len]).into_owned();
        blob_cursor += key_len;
        let value = bytes[blob_cursor..blob_cursor + value_len].to_vec();
        blob_cursor += value_len;
        attributes.entries.insert(key, value);
    }
    Ok(attributes)
}

// =============================================================================
// Metadata header
// =============================================================================

/// Wire form of the metadata header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetadataHeader {
    pub self_offset: u64,
    pub codec_version: Version,
    /// Offset of the attributes header, or `NULL_OFFSET`
    pub attributes_offset: u64,
    /// Offset of the associated image array, or `NULL_OFFSET`
    pub images_offset: u64,
    /// Offset of the ICC profile block, or `NULL_OFFSET`
    pub icc_offset: u64,
    /// Offset of the annotations block, or `NULL_OFFSET` (reserved)
    pub annotations_offset: u64,
    pub microns_per_pixel: f32,
    pub magnification: f32,
}

impl MetadataHeader {
    pub fn store(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_HEADER_SIZE as usize);
        out.extend_from_slice(&self.self_offset.to_le_bytes());
        out.extend_from_slice(&self.codec_version.major.to_le_bytes());
        out.extend_from_slice(&self.codec_version.minor.to_le_bytes());
        out.extend_from_slice(&self.codec_version.build.to_le_bytes());
        out.extend_from_slice(&self.attributes_offset.to_le_bytes());
        out.extend_from_slice(&self.images_offset.to_le_bytes());
        out.extend_from_slice(&self.icc_offset.to_le_bytes());
        out.extend_from_slice(&self.annotations_offset.to_le_bytes());
        out.extend_from_slice(&self.microns_per_pixel.to_le_bytes());
        out.extend_from_slice(&self.magnification.to_le_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<MetadataHeader, FormatError> {
        require(buf, METADATA_HEADER_SIZE, "metadata header")?;
        Ok(MetadataHeader {
            self_offset: read_u64_le(buf),
            codec_version: Version {
                major: read_u32_le(&buf[8..]),
                minor: read_u32_le(&buf[12..]),
                build: read_u32_le(&buf[16..]),
            },
            attributes_offset: read_u64_le(&buf[20..]),
            images_offset: read_u64_le(&buf[28..]),
            icc_offset: read_u64_le(&buf[36..]),
            annotations_offset: read_u64_le(&buf[44..]),
            microns_per_pixel: read_f32_le(&buf[52..]),
            magnification: read_f32_le(&buf[56..]),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header_roundtrip() {
        let header = FileHeader {
            file_size: 123_456_789,
            revision: 3,
            tile_table_offset: 99_000,
            metadata_offset: 120_000,
        };
        let bytes = header.store();
        assert_eq!(bytes.len() as u64, FILE_HEADER_SIZE);
        assert!(is_iris_codec_file(&bytes));
        assert_eq!(FileHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_file_header_bad_magic() {
        let mut bytes = FileHeader {
            file_size: 0,
            revision: 0,
            tile_table_offset: 0,
            metadata_offset: 0,
        }
        .store();
        bytes[0] = b'X';
        assert!(!is_iris_codec_file(&bytes));
        assert!(matches!(
            FileHeader::parse(&bytes),
            Err(FormatError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_file_header_truncated() {
        assert!(matches!(
            FileHeader::parse(&[0u8; 10]),
            Err(FormatError::FileTooSmall { .. })
        ));
    }

    #[test]
    fn test_tile_table_header_roundtrip() {
        let header = TileTableHeader {
            self_offset: 4096,
            encoding: Encoding::Jpeg,
            format: Format::R8G8B8A8,
            tiles_offset: 36,
            layer_extents_offset: 2048,
            layers: 3,
            width: 1024,
            height: 768,
            tile_count: 21,
        };
        let bytes = header.store();
        assert_eq!(bytes.len() as u64, TILE_TABLE_HEADER_SIZE);
        assert_eq!(TileTableHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_tile_table_header_invalid_encoding() {
        let mut bytes = TileTableHeader {
            self_offset: 0,
            encoding: Encoding::Jpeg,
            format: Format::R8G8B8,
            tiles_offset: 0,
            layer_extents_offset: 0,
            layers: 0,
            width: 0,
            height: 0,
            tile_count: 0,
        }
        .store();
        bytes[8] = 0xEE;
        assert!(matches!(
            TileTableHeader::parse(&bytes),
            Err(FormatError::InvalidField {
                field: "encoding",
                ..
            })
        ));
    }

    #[test]
    fn test_tile_entries_roundtrip() {
        let layers = vec![
            vec![TileEntry {
                offset: 36,
                size: 100,
            }],
            vec![
                TileEntry {
                    offset: 136,
                    size: 200,
                },
                TileEntry {
                    offset: 336,
                    size: 300,
                },
            ],
        ];
        let bytes = store_tile_entries(&layers);
        assert_eq!(bytes.len() as u64, size_tile_entries(&layers));

        let parsed = parse_tile_entries(&bytes, 3).unwrap();
        assert_eq!(parsed[0], layers[0][0]);
        assert_eq!(parsed[1], layers[1][0]);
        assert_eq!(parsed[2], layers[1][1]);
    }

    #[test]
    fn test_layer_extents_roundtrip() {
        let layers = vec![
            LayerExtent {
                x_tiles: 1,
                y_tiles: 1,
                scale: 1.0,
                downsample: 4.0,
            },
            LayerExtent {
                x_tiles: 4,
                y_tiles: 3,
                scale: 4.0,
                downsample: 1.0,
            },
        ];
        let bytes = store_layer_extents(&layers);
        assert_eq!(bytes.len() as u64, size_layer_extents(2));
        assert_eq!(parse_layer_extents(&bytes, 2).unwrap(), layers);
    }

    #[test]
    fn test_icc_block_roundtrip() {
        let profile = vec![0xAB; 64];
        let bytes = store_icc_profile(5000, &profile);
        assert_eq!(bytes.len() as u64, size_icc_profile(&profile));

        let (self_offset, size) = parse_icc_header(&bytes).unwrap();
        assert_eq!(self_offset, 5000);
        assert_eq!(size, 64);
        assert_eq!(&bytes[ICC_HEADER_SIZE as usize..], profile.as_slice());
    }

    #[test]
    fn test_image_array_roundtrip() {
        let records = vec![
            AssociatedImageRecord {
                block_offset: 1000,
                data_size: 50,
                info: AssociatedImageInfo {
                    label: "label".to_string(),
                    width: 400,
                    height: 300,
                    encoding: ImageEncoding::Png,
                    source_format: Format::R8G8B8A8,
                    orientation: Orientation::Rotate90,
                },
            },
            AssociatedImageRecord {
                block_offset: 2000,
                data_size: 75,
                info: AssociatedImageInfo {
                    label: "thumbnail".to_string(),
                    width: 128,
                    height: 96,
                    encoding: ImageEncoding::Jpeg,
                    source_format: Format::B8G8R8A8,
                    orientation: Orientation::Rotate0,
                },
            },
        ];
        let bytes = store_image_array(7777, &records);
        assert_eq!(bytes.len() as u64, size_image_array(&records));

        let (self_offset, parsed) = parse_image_array(&bytes).unwrap();
        assert_eq!(self_offset, 7777);
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_attributes_roundtrip() {
        let mut attributes = Attributes {
            kind: AttributeType::FreeText,
            version: 2,
            entries: Default::default(),
        };
        attributes
            .entries
            .insert("vendor".to_string(), b"aperio".to_vec());
        attributes
            .entries
            .insert("objective".to_string(), b"40".to_vec());

        let sizes = store_attribute_sizes(&attributes);
        let bytes = store_attribute_bytes(&attributes);
        assert_eq!(sizes.len() as u64, size_attribute_sizes(&attributes));
        assert_eq!(bytes.len() as u64, size_attribute_bytes(&attributes));

        let header = AttributesHeader {
            self_offset: 9000,
            kind: attributes.kind,
            version: attributes.version,
            count: attributes.len() as u32,
            sizes_offset: 8000,
            bytes_offset: 8500,
        };
        let header_bytes = header.store();
        assert_eq!(header_bytes.len() as u64, ATTRIBUTES_HEADER_SIZE);
        assert_eq!(AttributesHeader::parse(&header_bytes).unwrap(), header);

        let parsed = parse_attributes(&header, &sizes, &bytes).unwrap();
        assert_eq!(parsed, attributes);
    }

    #[test]
    fn test_metadata_header_roundtrip() {
        let header = MetadataHeader {
            self_offset: 12_345,
            codec_version: Version {
                major: 1,
                minor: 2,
                build: 3,
            },
            attributes_offset: 100,
            images_offset: 0,
            icc_offset: 200,
            annotations_offset: 0,
            microns_per_pixel: 0.25,
            magnification: 40.0,
        };
        let bytes = header.store();
        assert_eq!(bytes.len() as u64, METADATA_HEADER_SIZE);

        let parsed = MetadataHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
    }
}
