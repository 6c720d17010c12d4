//! Runtime side of the probes woven into methods
//!
//! Woven code only ever calls static methods of a small bridge class (see [`BridgeNames`]) with
//! primitives, strings, and plain objects. The host binds those calls to a [`SpyRegistry`], which
//! finds the handler of the namespace the code was woven for and hands back a [`Ret`] telling the
//! woven code whether to carry on, return, or throw.

mod barrier;
mod bridge;
mod registry;
mod value;

pub use barrier::*;
pub use bridge::*;
pub use registry::*;
pub use value::*;
