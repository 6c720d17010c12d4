//! Reading, editing, and writing JVM class files
//!
//! Class files come in from the host as bytes, get parsed into [`class_file::ClassFile`], have
//! their method bodies edited through [`code::MethodBody`], and are serialized back. Frames for
//! the edited code are recomputed by [`verifier`].

mod access_flags;
pub mod class_file;
pub mod code;
mod descriptors;
mod errors;
mod names;
pub mod verifier;

pub use access_flags::*;
pub use descriptors::*;
pub use errors::*;
pub use names::*;
