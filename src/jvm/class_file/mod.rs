//! Reading and writing the binary class file format
//!
//! Parsing is lossless for everything the rest of the crate doesn't need to understand: unknown
//! attributes are carried along as raw bytes and the constant pool keeps its indices, so an
//! untouched class file serializes back to the same bytes.

mod attribute;
mod class;
mod constants;
mod field;
mod method;
mod serialize;
mod version;

pub use attribute::*;
pub use class::*;
pub use constants::*;
pub use field::*;
pub use method::*;
pub use serialize::*;
pub use version::*;
