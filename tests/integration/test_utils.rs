//! Test utilities for integration tests.
//!
//! Synthetic pixel sources, PSNR measurement and a helper that runs an
//! encoder to completion.

use std::path::{Path, PathBuf};
use std::time::Duration;

use iris_codec::{EncodeOptions, Encoder, EncoderStatus, Metadata, SourceReader};

/// An RGBA gradient image: smooth ramps compress cleanly, so fidelity
/// checks are stable across codec backends.
pub fn gradient_rgba(width: u32, height: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.extend_from_slice(&[x as u8, y as u8, ((x + y) / 2) as u8, 0xFF]);
        }
    }
    pixels
}

/// A black/white checkerboard with `cell`-pixel squares.
pub fn checkerboard_rgba(width: u32, height: u32, cell: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let value = if ((x / cell) + (y / cell)) % 2 == 0 {
                0u8
            } else {
                255u8
            };
            pixels.extend_from_slice(&[value, value, value, 0xFF]);
        }
    }
    pixels
}

/// Peak signal-to-noise ratio between two equal-length pixel arrays.
pub fn psnr(a: &[u8], b: &[u8]) -> f64 {
    assert_eq!(a.len(), b.len(), "PSNR inputs must match in size");
    let mse: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        / a.len() as f64;
    if mse == 0.0 {
        return f64::INFINITY;
    }
    10.0 * (255.0f64 * 255.0 / mse).log10()
}

/// Extract one 256x256 RGBA tile from a raw image, padding with white.
pub fn reference_tile_rgba(
    pixels: &[u8],
    width: u32,
    height: u32,
    tiles_x: u32,
    tile_index: u32,
) -> Vec<u8> {
    let tile_x = (tile_index % tiles_x) as usize * 256;
    let tile_y = (tile_index / tiles_x) as usize * 256;
    let mut out = vec![0xFFu8; 256 * 256 * 4];
    let copy_rows = (height as usize).saturating_sub(tile_y).min(256);
    let copy_cols = (width as usize).saturating_sub(tile_x).min(256);
    for row in 0..copy_rows {
        let src = ((tile_y + row) * width as usize + tile_x) * 4;
        let dst = row * 256 * 4;
        out[dst..dst + copy_cols * 4].copy_from_slice(&pixels[src..src + copy_cols * 4]);
    }
    out
}

/// Write a stub source file so the encoder has a path (and output stem)
/// even when the tile source is injected.
pub fn stub_source_path(dir: &Path, stem: &str) -> PathBuf {
    let path = dir.join(format!("{stem}.png"));
    std::fs::write(&path, b"stub source").unwrap();
    path
}

/// Run an encoder over an injected source and wait for completion.
/// Returns the path of the finished `.iris` file.
pub fn encode_to_completion(options: EncodeOptions, source: Box<dyn SourceReader>) -> PathBuf {
    let encoder = Encoder::new(options).expect("encoder creation");
    encoder
        .dispatch_with_source(source)
        .expect("encoder dispatch");
    encoder.wait();

    let progress = encoder.progress();
    assert_eq!(
        progress.status,
        EncoderStatus::Inactive,
        "encode failed: {}",
        progress.error_msg
    );
    assert!(progress.dst_path.exists(), "output file must exist");
    progress.dst_path
}

// =============================================================================
// Slow source for interrupt tests
// =============================================================================

/// Wraps a source, delaying every tile read to keep a run in flight.
pub struct SlowSource<S: SourceReader> {
    inner: S,
    delay: Duration,
}

impl<S: SourceReader> SlowSource<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        SlowSource { inner, delay }
    }
}

impl<S: SourceReader> SourceReader for SlowSource<S> {
    fn extent(&self) -> &iris_codec::Extent {
        self.inner.extent()
    }

    fn format(&self) -> iris_codec::Format {
        self.inner.format()
    }

    fn read_tile(&self, layer: u32, tile: u32) -> Result<Vec<u8>, iris_codec::EncodeError> {
        std::thread::sleep(self.delay);
        self.inner.read_tile(layer, tile)
    }

    fn metadata(&self) -> Result<Metadata, iris_codec::EncodeError> {
        self.inner.metadata()
    }

    fn associated_image(
        &self,
        label: &str,
    ) -> Result<(iris_codec::AssociatedImageInfo, Vec<u8>), iris_codec::EncodeError> {
        self.inner.associated_image(label)
    }
}
