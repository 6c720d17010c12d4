//! Everything the engine needs from the managed runtime it instruments
//!
//! The engine never talks to a JVM directly. Enumerating classes, asking for retransformation,
//! finding class files, and making the bridge class visible all go through [`HostRuntime`],
//! which the embedding agent implements on top of JVMTI (or, for offline use, on top of a class
//! path, see [`ClassPathHost`]).

mod classpath;

pub use classpath::*;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Identity of a class loader, as handed across the probe ABI
///
/// The root (bootstrap) loader has no identity and is represented as `None` everywhere. When a
/// loader id must be pushed as an `int` operand, the root loader is `0`.
pub type LoaderId = i32;

/// Type currently loaded in the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadedType {
    /// Java name (`com.example.Calculator$Inner`)
    pub name: String,

    /// Defining loader
    pub loader: Option<LoaderId>,
}

impl LoadedType {
    pub fn new(name: impl Into<String>, loader: Option<LoaderId>) -> LoadedType {
        LoadedType {
            name: name.into(),
            loader,
        }
    }

    /// Internal name (`com/example/Calculator$Inner`)
    pub fn internal_name(&self) -> String {
        self.name.replace('.', "/")
    }
}

impl Display for LoadedType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.loader {
            None => write!(f, "{}@root", self.name),
            Some(loader) => write!(f, "{}@{}", self.name, loader),
        }
    }
}

/// Class file found through a loader's resource lookup
#[derive(Debug, Clone)]
pub struct ClassResource {
    /// Loader which actually holds the resource (after parent delegation)
    pub loader: Option<LoaderId>,
    pub bytes: Vec<u8>,
}

/// Shape of a loaded type, as reflection reports it
///
/// All names are Java names. Access flags use the class file encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMetadata {
    pub name: String,
    pub access: u16,

    /// Defining loader
    pub loader: Option<LoaderId>,
    pub super_name: Option<String>,
    pub interface_names: Vec<String>,

    /// Runtime-visible annotation types
    pub annotation_names: Vec<String>,

    /// Declared methods and constructors (no static initializer)
    pub behaviors: Vec<BehaviorMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorMetadata {
    /// `<init>` for constructors
    pub name: String,
    pub access: u16,
    pub parameter_type_names: Vec<String>,

    /// `void` for constructors and methods without a result
    pub return_type_name: String,
    pub exception_type_names: Vec<String>,
    pub annotation_names: Vec<String>,
}

/// Hook called by the runtime whenever a class is loaded or retransformed
pub trait ClassTransformer: Send + Sync {
    /// New class bytes, or `None` to leave the class as it is
    fn transform(
        &self,
        loader: Option<LoaderId>,
        internal_name: &str,
        being_redefined: bool,
        class_bytes: &[u8],
    ) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// No such type is visible from the loader
    TypeNotFound(String),

    /// Type exists but the defining loader cannot link it yet
    NotLinkable(String),

    /// Runtime refused to retransform
    Retransform(String),

    Unsupported(&'static str),
}

impl Display for HostError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::TypeNotFound(name) => write!(f, "type {} not found", name),
            HostError::NotLinkable(name) => write!(f, "type {} cannot be linked yet", name),
            HostError::Retransform(msg) => write!(f, "retransform failed: {}", msg),
            HostError::Unsupported(what) => write!(f, "{} is not supported by the host", what),
        }
    }
}

impl std::error::Error for HostError {}

/// Services consumed from the instrumented runtime
pub trait HostRuntime: Send + Sync {
    /// Every type loaded right now
    fn loaded_types(&self) -> Vec<LoadedType>;

    /// Run the registered transformers again over the given types
    fn retransform(&self, types: &[LoadedType]) -> Result<(), HostError>;

    /// Look up a resource (eg. `java/lang/String.class`) from a loader
    fn find_resource(&self, loader: Option<LoaderId>, path: &str) -> Option<ClassResource>;

    /// Reflective view of a type, resolved by Java name from a loader
    fn live_metadata(
        &self,
        loader: Option<LoaderId>,
        name: &str,
    ) -> Result<TypeMetadata, HostError>;

    /// Make the bridge class visible to a loader (`false` if that is impossible)
    fn expose_bridge(&self, loader: Option<LoaderId>) -> bool;

    fn add_transformer(&self, id: u32, transformer: Arc<dyn ClassTransformer>);

    fn remove_transformer(&self, id: u32);

    /// Has the loader opted out of instrumentation?
    fn is_stealth_loader(&self, loader: Option<LoaderId>) -> bool;

    /// Can native methods be wrapped through prefix substitution?
    fn supports_native_prefix(&self) -> bool;
}
