//! Compression and decompression dispatch.

mod context;

pub use context::{convert_pixels, CodecContext, Device};
