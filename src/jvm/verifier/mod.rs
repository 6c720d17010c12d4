//! Stack map frame inference
//!
//! For any specific instruction inside a method body, the stack and locals should have the same
//! structure, regardless of which control flow was used to reach that instruction. In other words:
//! although the values on the stack and in the locals may obviously be different, the types and
//! order of the stack and local variables cannot. This information is referred to as the _stack
//! map frame_ (represented using [`Frame`]) and the set of stack map frames for all possible jump
//! targets in a method is the _stack map table_.
//!
//! Splicing code into a method invalidates its stack map table, so the table has to be inferred
//! again from scratch (see [`analyze`]). The "types" used (represented using
//! [`VerificationType`]) are slightly augmented to take into account initialization and null.
//! Where control flow paths meet, reference types are merged using a [`TypeHierarchy`].
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.10.1

mod analysis;
mod frame;
mod hierarchy;
mod types;

pub use analysis::*;
pub use frame::*;
pub use hierarchy::*;
pub use types::*;
