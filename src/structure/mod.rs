//! Structural model of types and their behaviors
//!
//! A [`TypeStructure`] can be built either from the live metadata the runtime reports for a loaded
//! type, or from the raw class file. Both paths go through the same [`TypeMetadata`] shape so
//! they produce the same structure. Everything a type refers to (super class, interfaces,
//! annotations, parameter types) is resolved lazily through the [`StructureFactory`], from the
//! same loader and along the same path as the type that refers to it.
//!
//! [`TypeMetadata`]: crate::host::TypeMetadata

mod behavior;
mod factory;
mod metadata;
mod type_structure;

pub use behavior::*;
pub use factory::*;
pub use metadata::*;
pub use type_structure::*;

use crate::host::HostError;
use crate::jvm;
use std::fmt::{Display, Formatter};

/// Where a structure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Parsed from class file bytes found through a loader
    Raw,

    /// Reported by the runtime for a loaded type
    Live,
}

#[derive(Debug)]
pub enum ResolveError {
    /// Class file could not be read
    Class(jvm::Error),

    /// Runtime could not answer (most notably, a type that can't be linked yet)
    Host(HostError),

    /// Factory which built the structure has been dropped
    Detached,
}

impl ResolveError {
    /// Would re-deriving the structure from raw bytes get around this error?
    pub fn is_linkage(&self) -> bool {
        matches!(self, ResolveError::Host(HostError::NotLinkable(_)))
    }
}

impl From<jvm::Error> for ResolveError {
    fn from(err: jvm::Error) -> ResolveError {
        ResolveError::Class(err)
    }
}

impl From<HostError> for ResolveError {
    fn from(err: HostError) -> ResolveError {
        ResolveError::Host(err)
    }
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Class(err) => write!(f, "malformed class file: {}", err),
            ResolveError::Host(err) => err.fmt(f),
            ResolveError::Detached => f.write_str("structure factory is gone"),
        }
    }
}

impl std::error::Error for ResolveError {}
