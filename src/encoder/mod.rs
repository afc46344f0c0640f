//! The encoder pipeline: sources, pyramid derivation, tile tracking and
//! the multi-threaded read/derive/compress/write orchestration.

pub mod derive;
mod pipeline;
mod pool;
pub mod source;
mod tracker;

pub use derive::{derived_extent, Derivation};
pub use pipeline::{EncodeOptions, Encoder, EncoderProgress, EncoderStatus};
pub use pool::{TaskHandle, TaskPool};
pub use source::{open_source, IrisSource, RasterSource, SourceReader};
pub use tracker::{TileCanvas, TileStatus, TileTracker};
