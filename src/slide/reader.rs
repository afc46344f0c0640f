//! Local slide reader.
//!
//! A [`Slide`] shares a memory-mapped container file with any number of
//! sibling readers. The file structure is parsed and validated once at
//! open; tile reads afterwards are a bounds check, a table lookup, and a
//! decompress of the mapped bytes. Reads hold the shared side of the
//! file's resize lock for exactly as long as they dereference the
//! mapping.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::codec::CodecContext;
use crate::error::SlideError;
use crate::format::{
    abstract_file_structure, image_block_bytes, is_iris_codec_file, validate_file_structure,
    AssociatedImageInfo, Encoding, Extent, FileAbstraction, Format, Metadata, Version,
};
use crate::io::{Buffer, SlideFile};

/// Snapshot of a slide's identity: pixel format, tile encoding, pyramid
/// geometry and metadata.
#[derive(Debug, Clone)]
pub struct SlideInfo {
    pub format: Format,
    pub encoding: Encoding,
    pub extent: Extent,
    pub metadata: Metadata,
}

/// An open Iris slide backed by a shared memory-mapped file.
pub struct Slide {
    file: Arc<SlideFile>,
    context: Arc<CodecContext>,
    abstraction: FileAbstraction,
}

impl Slide {
    /// Open and parse a slide file.
    ///
    /// The structure is validated before any offset is trusted; an
    /// invalid file is rejected here, never at tile-read time.
    pub fn open(
        path: impl AsRef<Path>,
        context: Option<Arc<CodecContext>>,
    ) -> Result<Slide, SlideError> {
        let file = Arc::new(SlideFile::open(path.as_ref(), false)?);
        let context = context.unwrap_or_default();

        let abstraction = {
            let region = file.read_mapping();
            abstract_file_structure(region.bytes())?
        };
        debug!(
            path = %path.as_ref().display(),
            layers = abstraction.tile_table.layers.len(),
            "opened slide"
        );
        Ok(Slide {
            file,
            context,
            abstraction,
        })
    }

    /// Quick signature check: is the file at `path` an Iris container?
    pub fn is_iris_file(path: impl AsRef<Path>) -> Result<bool, SlideError> {
        let file = SlideFile::open(path.as_ref(), false)?;
        let region = file.read_mapping();
        Ok(is_iris_codec_file(region.bytes()))
    }

    /// Run full structural validation on the file at `path`.
    pub fn validate(path: impl AsRef<Path>) -> Result<(), SlideError> {
        let file = SlideFile::open(path.as_ref(), false)?;
        let region = file.read_mapping();
        validate_file_structure(region.bytes())
            .into_result()
            .map_err(SlideError::from)
    }

    /// The slide's format, encoding, extent and metadata.
    pub fn info(&self) -> SlideInfo {
        SlideInfo {
            format: self.abstraction.tile_table.format,
            encoding: self.abstraction.tile_table.encoding,
            extent: self.abstraction.tile_table.extent.clone(),
            metadata: self.abstraction.metadata.clone(),
        }
    }

    /// Version of the codec that wrote this slide.
    pub fn codec_version(&self) -> Version {
        self.abstraction.metadata.codec_version
    }

    /// The pyramid geometry.
    pub fn extent(&self) -> &Extent {
        &self.abstraction.tile_table.extent
    }

    /// Pixel format of the stored tiles.
    pub fn format(&self) -> Format {
        self.abstraction.tile_table.format
    }

    /// Encoding of the stored tile streams.
    pub fn encoding(&self) -> Encoding {
        self.abstraction.tile_table.encoding
    }

    fn lookup(&self, layer: u32, tile: u32) -> Result<crate::format::TileEntry, SlideError> {
        let table = &self.abstraction.tile_table;
        let layers = table.layers.len() as u32;
        if layer >= layers {
            return Err(SlideError::LayerOutOfBounds { layer, layers });
        }
        let entries = &table.layers[layer as usize];
        if tile as usize >= entries.len() {
            return Err(SlideError::TileOutOfBounds {
                layer,
                tile,
                tiles: entries.len() as u32,
            });
        }
        Ok(entries[tile as usize])
    }

    /// Read and decompress one tile into `desired_format` pixels.
    ///
    /// `layer` and `tile` are bounds-checked against the extent. When
    /// `destination` is provided with sufficient capacity the pixels are
    /// written into it; otherwise a fresh buffer is returned.
    pub fn read_tile(
        &self,
        layer: u32,
        tile: u32,
        desired_format: Format,
        destination: Option<Buffer>,
    ) -> Result<Buffer, SlideError> {
        let entry = self.lookup(layer, tile)?;

        // Hold the shared resize lock across the decompress: the weak
        // buffer views the mapping directly.
        let region = self.file.read_mapping();
        let mapped = region.slice(entry.offset, entry.size as u64)?;
        let compressed = unsafe { Buffer::wrap_weak_slice(mapped) };
        let pixels = self.context.decompress_tile(
            compressed.data(),
            self.abstraction.tile_table.encoding,
            desired_format,
            destination,
        )?;
        Ok(pixels)
    }

    /// Read the raw compressed byte stream of one tile.
    pub fn read_tile_compressed(&self, layer: u32, tile: u32) -> Result<Vec<u8>, SlideError> {
        let entry = self.lookup(layer, tile)?;
        let region = self.file.read_mapping();
        Ok(region.slice(entry.offset, entry.size as u64)?.to_vec())
    }

    /// Descriptor of the associated image with the given label.
    pub fn associated_image_info(&self, label: &str) -> Result<&AssociatedImageInfo, SlideError> {
        self.abstraction
            .images
            .get(label)
            .map(|record| &record.info)
            .ok_or_else(|| SlideError::UnknownImageLabel(label.to_string()))
    }

    /// Read and decompress an associated image into `desired_format`
    /// pixels.
    pub fn read_associated_image(
        &self,
        label: &str,
        desired_format: Format,
    ) -> Result<Buffer, SlideError> {
        let record = self
            .abstraction
            .images
            .get(label)
            .ok_or_else(|| SlideError::UnknownImageLabel(label.to_string()))?;
        let region = self.file.read_mapping();
        let bytes = image_block_bytes(region.bytes(), record)?;
        let pixels = self.context.decompress_image(
            bytes,
            record.info.encoding,
            desired_format,
            record.info.width,
            record.info.height,
        )?;
        Ok(pixels)
    }

    /// Read the raw compressed byte block of an associated image.
    pub fn read_associated_image_compressed(&self, label: &str) -> Result<Vec<u8>, SlideError> {
        let record = self
            .abstraction
            .images
            .get(label)
            .ok_or_else(|| SlideError::UnknownImageLabel(label.to_string()))?;
        let region = self.file.read_mapping();
        Ok(image_block_bytes(region.bytes(), record)?.to_vec())
    }
}

impl std::fmt::Debug for Slide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slide")
            .field("path", &self.file.path())
            .field("layers", &self.abstraction.tile_table.layers.len())
            .field("encoding", &self.abstraction.tile_table.encoding)
            .finish()
    }
}
