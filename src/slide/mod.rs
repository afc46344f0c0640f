//! Slide abstraction: local bounds-checked reads over a parsed container.

mod reader;

pub use reader::{Slide, SlideInfo};
