//! Pyramid derivation: extent generation, subtile bookkeeping and the
//! downsampling merges.
//!
//! When deriving lower-resolution layers, a parent tile at layer `L-1`
//! is the averaged merge of 4 (2x mode) or 16 (4x mode) child tiles at
//! layer `L`. Children arrive asynchronously from many threads; each
//! writes its downsampled block into a disjoint region of the parent's
//! canvas and flips its bit in the parent's subtile mask. Parents on the
//! image edge have their never-to-arrive positions pre-set in the mask,
//! so the last real child always completes it.

use crate::error::EncodeError;
use crate::format::{Extent, LayerExtent, TILE_EXTENT};

use super::tracker::{TileCanvas, SUBTILES_COMPLETE};

/// How the output pyramid's lower-resolution layers are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Derivation {
    /// Copy every layer the source already has.
    #[default]
    UseSource,
    /// Derive half-size layers from the source's highest resolution
    /// (eight derived layers, like DZI pyramids).
    Derive2x,
    /// Derive quarter-size layers (four derived layers, like SVS files).
    Derive4x,
}

impl Derivation {
    /// Coordinate shift between a child layer and its parent.
    pub fn shift(&self) -> u32 {
        match self {
            Derivation::UseSource => 0,
            Derivation::Derive2x => 1,
            Derivation::Derive4x => 2,
        }
    }

    /// Residual bitmask for partial-tile detection.
    fn residual_mask(&self) -> u32 {
        (1 << self.shift()) - 1
    }

    /// Number of derived layers below the source layer.
    fn derived_layers(&self) -> usize {
        match self {
            Derivation::UseSource => 0,
            // 256 px -> 128, 64, 32, 16, 8, 4, 2, 1
            Derivation::Derive2x => 8,
            // 256 px -> 64, 16, 4, 1
            Derivation::Derive4x => 4,
        }
    }
}

// =============================================================================
// Derived extent generation
// =============================================================================

/// Generate the output extent for a derived pyramid.
///
/// Starting from the source's highest-resolution layer, each derived
/// layer shifts the tile counts right by the derivation shift, adding
/// one tile where a residual remains (partial tiles are counted).
/// Generation stops when either axis reaches zero and empty prefix
/// layers are dropped, so the lowest layer can be larger than 1x1 for
/// wide or tall slides. The viewable width and height are recomputed
/// against the front layer's downsample.
pub fn derived_extent(derivation: Derivation, source: &Extent) -> Result<Extent, EncodeError> {
    if derivation == Derivation::UseSource {
        return Err(EncodeError::InvalidState {
            state: "use-source",
            message: "derived extent requested without a derivation strategy",
        });
    }
    let base = source
        .layers
        .last()
        .ok_or(EncodeError::InvalidState {
            state: "empty",
            message: "source extent has no layers",
        })?;

    let shift = derivation.shift();
    let residual = derivation.residual_mask();
    let total_layers = derivation.derived_layers() + 1;

    // Fill from the back: the source layer lands at the top, each pass
    // shrinks the counts by one shift.
    let mut layers = vec![
        LayerExtent {
            x_tiles: 0,
            y_tiles: 0,
            scale: 0.0,
            downsample: 0.0,
        };
        total_layers
    ];
    let mut x_tiles = base.x_tiles;
    let mut y_tiles = base.y_tiles;
    let mut downsample = 1u32;
    let mut index = total_layers;
    while index > 0 && x_tiles > 0 && y_tiles > 0 {
        index -= 1;
        layers[index] = LayerExtent {
            x_tiles,
            y_tiles,
            scale: 0.0,
            downsample: downsample as f32,
        };
        // The pyramid apex: further shifts would only repeat 1x1.
        if x_tiles == 1 && y_tiles == 1 {
            break;
        }
        x_tiles = (x_tiles >> shift) + u32::from(x_tiles & residual != 0);
        y_tiles = (y_tiles >> shift) + u32::from(y_tiles & residual != 0);
        downsample <<= shift;
    }
    // Drop layers the loop never reached (small sources top out early).
    layers.drain(..index);

    // Scale is relative to layer 0 of this extent, which differs from
    // the reciprocal of downsample whenever prefix layers were dropped.
    let mut scale = 1u64;
    for layer in layers.iter_mut() {
        layer.scale = scale as f32;
        scale <<= shift;
    }

    let front_downsample = layers
        .first()
        .ok_or(EncodeError::InvalidState {
            state: "empty",
            message: "derived extent produced no layers",
        })?
        .downsample;
    let source_front_downsample = source
        .layers
        .first()
        .map(|layer| layer.downsample)
        .unwrap_or(1.0);

    Ok(Extent {
        width: (source.width as f32 / front_downsample * source_front_downsample).round() as u32,
        height: (source.height as f32 / front_downsample * source_front_downsample).round() as u32,
        layers,
    })
}

// =============================================================================
// Subtile mask seeding
// =============================================================================

/// Seed a parent tile's subtile mask, given one of its children.
///
/// Bits for child positions that exist start cleared; positions falling
/// outside the image (edge parents) stay set, so the mask completes when
/// the last real child merges. `child_layer` is the extent of the layer
/// the child lives in and `(child_y, child_x)` its tile coordinates.
pub fn preset_subtile_mask(
    derivation: Derivation,
    child_layer: &LayerExtent,
    child_y: u32,
    child_x: u32,
) -> u16 {
    let shift = derivation.shift();
    let residual = derivation.residual_mask();
    let span = 1u32 << shift;

    let full_y = child_layer.y_tiles & !residual;
    let full_x = child_layer.x_tiles & !residual;

    let y_extent = if child_y < full_y {
        span
    } else {
        child_layer.y_tiles & residual
    };
    let x_extent = if child_x < full_x {
        span
    } else {
        child_layer.x_tiles & residual
    };

    let mut mask = SUBTILES_COMPLETE;
    for sub_y in 0..y_extent {
        for sub_x in 0..x_extent {
            mask ^= 1 << (sub_y * span + sub_x);
        }
    }
    mask
}

// =============================================================================
// Downsample merge
// =============================================================================

/// Average-downsample a child tile into its parent's canvas.
///
/// The child's 256x256 pixels shrink to a 128x128 (2x) or 64x64 (4x)
/// block written into the parent quadrant or sub-position selected by
/// the child's low coordinate bits. Averaging rounds half up, so the
/// operation is byte-exact and deterministic. Returns the child's bit in
/// the parent's subtile mask.
///
/// Safety of the shared canvas: each child owns a disjoint block by
/// construction, which is exactly the contract of
/// [`TileCanvas::write_at`].
pub fn downsample_into(
    child: &[u8],
    parent: &TileCanvas,
    derivation: Derivation,
    child_y: u32,
    child_x: u32,
    channels: usize,
) -> u16 {
    let shift = derivation.shift();
    let residual = derivation.residual_mask();
    let span = 1usize << shift;
    let block = 1usize << shift; // source pixels per output pixel, per axis
    let out_dim = (TILE_EXTENT as usize) >> shift;
    let half = (block * block / 2) as u32;
    let divisor_shift = 2 * shift;

    let sub_y = (child_y & residual) as usize;
    let sub_x = (child_x & residual) as usize;

    let tile = TILE_EXTENT as usize;
    let row_stride = tile * channels;
    let mut row = vec![0u8; out_dim * channels];

    for out_y in 0..out_dim {
        for out_x in 0..out_dim {
            for channel in 0..channels {
                let mut sum = 0u32;
                for dy in 0..block {
                    let src_row = (out_y * block + dy) * row_stride;
                    for dx in 0..block {
                        sum += child[src_row + (out_x * block + dx) * channels + channel] as u32;
                    }
                }
                row[out_x * channels + channel] = ((sum + half) >> divisor_shift) as u8;
            }
        }
        let parent_row = sub_y * out_dim + out_y;
        let parent_col = sub_x * out_dim;
        let offset = parent_row * row_stride + parent_col * channels;
        unsafe { parent.write_at(offset, &row) };
    }

    1 << ((sub_y as u16) * (span as u16) + sub_x as u16)
}

/// Parent tile coordinates of a child at `(y, x)`.
pub fn parent_coords(derivation: Derivation, y: u32, x: u32) -> (u32, u32) {
    (y >> derivation.shift(), x >> derivation.shift())
}

// =============================================================================
// Tests
// =============================================================================
