//! I/O layer: the memory-mapped file handle and the byte buffer primitive.

mod buffer;
mod file;

pub use buffer::{Buffer, Strength};
pub use file::{page_align, page_size, MappedRegion, SlideFile, GROWTH_INCREMENT};
