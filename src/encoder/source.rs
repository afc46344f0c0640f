//! Tile sources feeding the encoder.
//!
//! [`SourceReader`] is the capability seam behind which vendor-format
//! decoders live: anything that can report an extent, hand out 256x256
//! pixel tiles, and describe its metadata can be encoded. Two readers
//! ship in-tree — re-encoding an existing Iris slide, and rasterizing a
//! flat image file (PNG/JPEG) as a single-layer source. Probing order
//! follows the container signature first, then the raster decoders.

use std::path::Path;
use std::sync::Arc;

use crate::codec::CodecContext;
use crate::error::EncodeError;
use crate::format::{
    AssociatedImageInfo, Extent, Format, LayerExtent, Metadata, Version, TILE_EXTENT,
};
use crate::slide::Slide;

/// A readable tile source for the encoder.
///
/// Implementations must be thread-safe: encoder workers call
/// [`SourceReader::read_tile`] concurrently.
pub trait SourceReader: Send + Sync {
    /// The source's pyramid geometry, lowest resolution first.
    fn extent(&self) -> &Extent;

    /// Pixel layout of tiles returned by [`SourceReader::read_tile`].
    fn format(&self) -> Format;

    /// Read one full 256x256 tile at `(layer, tile)` in
    /// [`SourceReader::format`] pixels. Edge tiles are padded to full
    /// size with the white background.
    fn read_tile(&self, layer: u32, tile: u32) -> Result<Vec<u8>, EncodeError>;

    /// The source's metadata, normalized to layer 0.
    fn metadata(&self) -> Result<Metadata, EncodeError>;

    /// Descriptor and compressed bytes of an associated image, ready to
    /// store.
    fn associated_image(&self, label: &str) -> Result<(AssociatedImageInfo, Vec<u8>), EncodeError>;
}

/// Probe a source file and open the matching reader.
pub fn open_source(
    path: impl AsRef<Path>,
    context: Arc<CodecContext>,
) -> Result<Box<dyn SourceReader>, EncodeError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(EncodeError::MissingSource(path.to_path_buf()));
    }
    if Slide::is_iris_file(path).unwrap_or(false) {
        return Ok(Box::new(IrisSource::open(path, context)?));
    }
    if RasterSource::claims(path) {
        return Ok(Box::new(RasterSource::open(path)?));
    }
    Err(EncodeError::UnrecognizedSource(path.to_path_buf()))
}

// =============================================================================
// Iris-to-Iris transcode source
// =============================================================================

/// Source reading tiles out of an existing Iris slide.
pub struct IrisSource {
    slide: Slide,
    extent: Extent,
    format: Format,
}

impl IrisSource {
    pub fn open(path: impl AsRef<Path>, context: Arc<CodecContext>) -> Result<Self, EncodeError> {
        let slide = Slide::open(path, Some(context))?;
        let extent = slide.extent().clone();
        let format = slide.format();
        Ok(IrisSource {
            slide,
            extent,
            format,
        })
    }
}

impl SourceReader for IrisSource {
    fn extent(&self) -> &Extent {
        &self.extent
    }

    fn format(&self) -> Format {
        self.format
    }

    fn read_tile(&self, layer: u32, tile: u32) -> Result<Vec<u8>, EncodeError> {
        let pixels = self.slide.read_tile(layer, tile, self.format, None)?;
        Ok(pixels.into_vec())
    }

    fn metadata(&self) -> Result<Metadata, EncodeError> {
        Ok(self.slide.info().metadata)
    }

    fn associated_image(&self, label: &str) -> Result<(AssociatedImageInfo, Vec<u8>), EncodeError> {
        let info = self.slide.associated_image_info(label)?.clone();
        let bytes = self.slide.read_associated_image_compressed(label)?;
        Ok((info, bytes))
    }
}

// =============================================================================
// Flat raster source
// =============================================================================

/// Source rasterizing a flat image file as a single-layer pyramid.
///
/// Tiles outside the image bounds are filled with the white background,
/// matching the edge-padding rule of the container.
pub struct RasterSource {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    extent: Extent,
    metadata: Metadata,
}

impl RasterSource {
    /// Whether the raster decoders claim this file, judged by extension.
    pub fn claims(path: &Path) -> bool {
        matches!(
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase())
                .as_deref(),
            Some("png" | "jpg" | "jpeg")
        )
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, EncodeError> {
        let image = image::open(path.as_ref()).map_err(|e| EncodeError::SourceRead {
            layer: 0,
            tile: 0,
            message: e.to_string(),
        })?;
        Ok(Self::from_rgba(
            image.to_rgba8().into_raw(),
            image.width(),
            image.height(),
        ))
    }

    /// Build a source from raw R8G8B8A8 pixels.
    pub fn from_rgba(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        let extent = Extent {
            width,
            height,
            layers: vec![LayerExtent {
                x_tiles: width.div_ceil(TILE_EXTENT),
                y_tiles: height.div_ceil(TILE_EXTENT),
                scale: 1.0,
                downsample: 1.0,
            }],
        };
        RasterSource {
            pixels,
            width,
            height,
            extent,
            metadata: Metadata {
                codec_version: Version::codec(),
                ..Metadata::default()
            },
        }
    }

    /// Attach metadata (calibration, attributes) to carry into the
    /// encoded file.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl SourceReader for RasterSource {
    fn extent(&self) -> &Extent {
        &self.extent
    }

    fn format(&self) -> Format {
        Format::R8G8B8A8
    }

    fn read_tile(&self, layer: u32, tile: u32) -> Result<Vec<u8>, EncodeError> {
        let layer_extent = self
            .extent
            .layers
            .first()
            .filter(|_| layer == 0)
            .ok_or(EncodeError::SourceRead {
                layer,
                tile,
                message: "raster source has a single layer".to_string(),
            })?;
        if tile as u64 >= layer_extent.tile_count() {
            return Err(EncodeError::SourceRead {
                layer,
                tile,
                message: "tile index out of bounds".to_string(),
            });
        }

        let tile_x = tile % layer_extent.x_tiles;
        let tile_y = tile / layer_extent.x_tiles;
        let origin_x = (tile_x * TILE_EXTENT) as usize;
        let origin_y = (tile_y * TILE_EXTENT) as usize;

        let channels = 4usize;
        let tile_dim = TILE_EXTENT as usize;
        let mut out = vec![0xFFu8; tile_dim * tile_dim * channels];

        let copy_rows = (self.height as usize).saturating_sub(origin_y).min(tile_dim);
        let copy_cols = (self.width as usize).saturating_sub(origin_x).min(tile_dim);
        let src_stride = self.width as usize * channels;
        for row in 0..copy_rows {
            let src_start = (origin_y + row) * src_stride + origin_x * channels;
            let dst_start = row * tile_dim * channels;
            out[dst_start..dst_start + copy_cols * channels]
                .copy_from_slice(&self.pixels[src_start..src_start + copy_cols * channels]);
        }
        Ok(out)
    }

    fn metadata(&self) -> Result<Metadata, EncodeError> {
        Ok(self.metadata.clone())
    }

    fn associated_image(&self, label: &str) -> Result<(AssociatedImageInfo, Vec<u8>), EncodeError> {
        Err(EncodeError::SourceRead {
            layer: 0,
            tile: 0,
            message: format!("raster source has no associated image \"{label}\""),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
