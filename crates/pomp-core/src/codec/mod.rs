//! Typed and printf/scanf-style argument encoding and decoding.

mod decoder;
mod encoder;
pub mod format;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use format::{Conversion, Value, WidthFlags};
