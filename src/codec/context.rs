//! Image codec context.
//!
//! The one place in the crate that touches third-party image codecs.
//! Everything above this seam works in terms of raw pixel buffers and
//! [`Encoding`] / [`ImageEncoding`] tags; the context dispatches to the
//! `image` crate's JPEG, PNG and AVIF backends and handles the pixel
//! swizzles between the container's BGR/RGB layouts and the codecs'
//! native RGB order.
//!
//! Tile dimensions are fixed at 256x256; associated images go through the
//! arbitrary-size `compress_image` / `decompress_image` pair.

use std::io::Cursor;

use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, ImageReader};

use crate::error::CodecError;
use crate::format::{Encoding, Format, ImageEncoding, Subsampling, TILE_EXTENT};
use crate::io::Buffer;

/// Opaque GPU device handle.
///
/// Accepted for API parity with accelerated builds and passed through;
/// the CPU backends in this crate do not use it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Device;

/// Codec dispatch context.
///
/// Cheap to construct and thread-safe; encoders share one context across
/// all worker threads.
#[derive(Debug, Default)]
pub struct CodecContext {
    _device: Option<Device>,
}

impl CodecContext {
    /// Create a CPU-only codec context.
    pub fn new() -> Self {
        CodecContext { _device: None }
    }

    /// Create a context routing through an optional GPU device.
    pub fn with_device(device: Option<Device>) -> Self {
        CodecContext { _device: device }
    }

    // =========================================================================
    // Tiles
    // =========================================================================

    /// Compress one 256x256 tile.
    ///
    /// `pixels` must be exactly `256 * 256 * format.channels()` bytes.
    pub fn compress_tile(
        &self,
        pixels: &[u8],
        format: Format,
        encoding: Encoding,
        quality: u8,
        subsampling: Subsampling,
    ) -> Result<Vec<u8>, CodecError> {
        check_pixel_len(pixels, TILE_EXTENT, TILE_EXTENT, format)?;
        match encoding {
            Encoding::Jpeg => {
                encode_jpeg(pixels, TILE_EXTENT, TILE_EXTENT, format, quality, subsampling)
            }
            Encoding::Avif => {
                encode_avif(pixels, TILE_EXTENT, TILE_EXTENT, format, quality, subsampling)
            }
            Encoding::Iris => Err(CodecError::UnsupportedEncoding("IRIS")),
        }
    }

    /// Decompress one tile into `desired_format` pixels.
    ///
    /// When `destination` is provided and has sufficient capacity the
    /// pixels are written into it; otherwise a new buffer is allocated.
    pub fn decompress_tile(
        &self,
        bytes: &[u8],
        encoding: Encoding,
        desired_format: Format,
        destination: Option<Buffer>,
    ) -> Result<Buffer, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::EmptySource);
        }
        let image = decode(bytes, tile_image_format(encoding)?)?;
        if image.width() != TILE_EXTENT || image.height() != TILE_EXTENT {
            return Err(CodecError::Decode {
                message: format!(
                    "tile decoded to {}x{} instead of {}x{}",
                    image.width(),
                    image.height(),
                    TILE_EXTENT,
                    TILE_EXTENT
                ),
            });
        }
        into_destination(image_to_pixels(&image, desired_format), destination)
    }

    // =========================================================================
    // Associated images
    // =========================================================================

    /// Compress an arbitrary-size associated image.
    pub fn compress_image(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: Format,
        encoding: ImageEncoding,
        quality: u8,
        subsampling: Subsampling,
    ) -> Result<Vec<u8>, CodecError> {
        check_pixel_len(pixels, width, height, format)?;
        match encoding {
            ImageEncoding::Jpeg => encode_jpeg(pixels, width, height, format, quality, subsampling),
            ImageEncoding::Avif => encode_avif(pixels, width, height, format, quality, subsampling),
            ImageEncoding::Png => encode_png(pixels, width, height, format),
        }
    }

    /// Decompress an associated image into `desired_format` pixels.
    ///
    /// `width` and `height` are the dimensions recorded in the container
    /// and are checked against the decoded stream.
    pub fn decompress_image(
        &self,
        bytes: &[u8],
        encoding: ImageEncoding,
        desired_format: Format,
        width: u32,
        height: u32,
    ) -> Result<Buffer, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::EmptySource);
        }
        let image = decode(bytes, image_image_format(encoding))?;
        if image.width() != width || image.height() != height {
            return Err(CodecError::Decode {
                message: format!(
                    "image decoded to {}x{}, container records {}x{}",
                    image.width(),
                    image.height(),
                    width,
                    height
                ),
            });
        }
        Ok(Buffer::from_vec(image_to_pixels(&image, desired_format)))
    }
}

// =============================================================================
// Dispatch helpers
// =============================================================================

fn tile_image_format(encoding: Encoding) -> Result<ImageFormat, CodecError> {
    match encoding {
        Encoding::Jpeg => Ok(ImageFormat::Jpeg),
        Encoding::Avif => Ok(ImageFormat::Avif),
        Encoding::Iris => Err(CodecError::UnsupportedEncoding("IRIS")),
    }
}

fn image_image_format(encoding: ImageEncoding) -> ImageFormat {
    match encoding {
        ImageEncoding::Png => ImageFormat::Png,
        ImageEncoding::Jpeg => ImageFormat::Jpeg,
        ImageEncoding::Avif => ImageFormat::Avif,
    }
}

fn check_pixel_len(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: Format,
) -> Result<(), CodecError> {
    let expected = width as usize * height as usize * format.channels();
    if pixels.len() != expected {
        return Err(CodecError::PixelSizeMismatch {
            expected,
            actual: pixels.len(),
            width,
            height,
        });
    }
    Ok(())
}

fn decode(bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, CodecError> {
    ImageReader::with_format(Cursor::new(bytes), format)
        .decode()
        .map_err(|e| CodecError::Decode {
            message: e.to_string(),
        })
}

/// Convert decoded image pixels into the container pixel layout.
fn image_to_pixels(image: &DynamicImage, format: Format) -> Vec<u8> {
    let mut pixels = if format.has_alpha() {
        image.to_rgba8().into_raw()
    } else {
        image.to_rgb8().into_raw()
    };
    if format.is_bgr() {
        swap_red_blue(&mut pixels, format.channels());
    }
    pixels
}

/// Normalize container pixels to tightly-packed RGB (alpha stripped).
fn pixels_to_rgb(pixels: &[u8], format: Format) -> Vec<u8> {
    let channels = format.channels();
    let mut rgb = Vec::with_capacity(pixels.len() / channels * 3);
    for pixel in pixels.chunks_exact(channels) {
        if format.is_bgr() {
            rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
        } else {
            rgb.extend_from_slice(&pixel[..3]);
        }
    }
    rgb
}

/// Normalize container pixels to RGBA.
fn pixels_to_rgba(pixels: &[u8], format: Format) -> Vec<u8> {
    let channels = format.channels();
    let mut rgba = Vec::with_capacity(pixels.len() / channels * 4);
    for pixel in pixels.chunks_exact(channels) {
        let (r, b) = if format.is_bgr() {
            (pixel[2], pixel[0])
        } else {
            (pixel[0], pixel[2])
        };
        let alpha = if format.has_alpha() { pixel[3] } else { 0xFF };
        rgba.extend_from_slice(&[r, pixel[1], b, alpha]);
    }
    rgba
}

fn swap_red_blue(pixels: &mut [u8], channels: usize) {
    for pixel in pixels.chunks_exact_mut(channels) {
        pixel.swap(0, 2);
    }
}

/// Convert raw pixels between container pixel layouts.
///
/// Dropping an alpha channel discards it; adding one fills with opaque.
pub fn convert_pixels(pixels: &[u8], from: Format, to: Format) -> Vec<u8> {
    if from == to {
        return pixels.to_vec();
    }
    let mut converted = if to.has_alpha() {
        pixels_to_rgba(pixels, from)
    } else {
        pixels_to_rgb(pixels, from)
    };
    if to.is_bgr() {
        swap_red_blue(&mut converted, to.channels());
    }
    converted
}

fn into_destination(pixels: Vec<u8>, destination: Option<Buffer>) -> Result<Buffer, CodecError> {
    match destination {
        Some(mut buffer) if buffer.capacity() >= pixels.len() => {
            if buffer.set_size(pixels.len()).is_ok() {
                if let Some(slice) = buffer.data_mut() {
                    slice.copy_from_slice(&pixels);
                    return Ok(buffer);
                }
            }
            // Weak or otherwise unwritable destination: fall back to a
            // fresh allocation.
            Ok(Buffer::from_vec(pixels))
        }
        _ => Ok(Buffer::from_vec(pixels)),
    }
}

// =============================================================================
// Backends
// =============================================================================

fn encode_jpeg(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: Format,
    quality: u8,
    _subsampling: Subsampling,
) -> Result<Vec<u8>, CodecError> {
    // The JPEG backend applies its own chroma subsampling; the requested
    // level is accepted for API stability.
    let quality = quality.clamp(1, 100);
    let rgb = pixels_to_rgb(pixels, format);
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode(&rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| CodecError::Encode {
            message: e.to_string(),
        })?;
    Ok(out)
}

fn encode_png(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: Format,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut out);
    let result = if format.has_alpha() {
        encoder.write_image(
            &pixels_to_rgba(pixels, format),
            width,
            height,
            ExtendedColorType::Rgba8,
        )
    } else {
        encoder.write_image(
            &pixels_to_rgb(pixels, format),
            width,
            height,
            ExtendedColorType::Rgb8,
        )
    };
    result.map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })?;
    Ok(out)
}

fn encode_avif(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: Format,
    quality: u8,
    _subsampling: Subsampling,
) -> Result<Vec<u8>, CodecError> {
    // The AVIF backend converts at its own chroma subsampling level; the
    // requested level is accepted for API stability.
    let quality = quality.clamp(1, 100);
    let mut out = Vec::new();
    let encoder =
        image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut out, 10, quality);
    encoder
        .write_image(
            &pixels_to_rgb(pixels, format),
            width,
            height,
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| CodecError::Encode {
            message: e.to_string(),
        })?;
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================
