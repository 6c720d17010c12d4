use super::Filter;
use crate::host::{HostRuntime, LoaderId};
use crate::jvm::{ClassAccessFlags, MethodAccessFlags, UnqualifiedName};
use crate::structure::BehaviorStructure;
use std::sync::Arc;

/// Name fragments of generated proxy and enhancement classes
const PROXY_MARKERS: [&str; 4] = [
    "$$FastClassBySpringCGLIB$$",
    "$$EnhancerBySpringCGLIB$$",
    "$$EnhancerByCGLIB$$",
    "$$FastClassByCGLIB$$",
];

/// Filter rejecting everything that must never be instrumented
///
/// This is always combined (with `And`) with the matcher of a watch. It rejects lambda and hidden
/// classes, generated proxies, the engine's own classes, classes of loaders that opted out, and
/// (unless unsafe mode is on) classes of the root loader. Among behaviors, it rejects abstract
/// methods, native methods the host can't wrap, program entry points, and methods renamed by
/// native prefix substitution.
pub struct UnsupportedGuard {
    host: Arc<dyn HostRuntime>,
    unsafe_enabled: bool,
    excluded_packages: Vec<String>,
    native_prefix: String,
}

impl UnsupportedGuard {
    /// `excluded_packages` are Java package prefixes (eg. `jvm.sandbox.`)
    pub fn new(
        host: Arc<dyn HostRuntime>,
        unsafe_enabled: bool,
        excluded_packages: Vec<String>,
        native_prefix: impl Into<String>,
    ) -> UnsupportedGuard {
        UnsupportedGuard {
            host,
            unsafe_enabled,
            excluded_packages,
            native_prefix: native_prefix.into(),
        }
    }

    fn is_unsupported_name(&self, name: &str) -> bool {
        name.contains("$$Lambda$")
            || name.contains('/')
            || PROXY_MARKERS.iter().any(|marker| name.contains(marker))
            || self
                .excluded_packages
                .iter()
                .any(|package| name.starts_with(package.as_str()))
    }
}

impl Filter for UnsupportedGuard {
    fn matches_type(
        &self,
        _access: ClassAccessFlags,
        name: &str,
        _super_name: Option<&str>,
        _interface_names: &[String],
        _annotation_names: &[String],
    ) -> bool {
        !self.is_unsupported_name(name)
    }

    fn matches_behavior(
        &self,
        access: MethodAccessFlags,
        name: &str,
        _parameter_type_names: &[String],
        _exception_type_names: &[String],
        _annotation_names: &[String],
    ) -> bool {
        if access.contains(MethodAccessFlags::ABSTRACT) {
            return false;
        }
        if access.contains(MethodAccessFlags::NATIVE) && !self.host.supports_native_prefix() {
            return false;
        }
        self.native_prefix.is_empty() || !name.starts_with(&self.native_prefix)
    }

    /// Program entry points are `public static void main(String[])`, nothing else
    fn accepts_behavior(&self, behavior: &BehaviorStructure) -> bool {
        let is_entry_point = behavior
            .access()
            .contains(MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC)
            && behavior.name() == UnqualifiedName::MAIN.as_ref()
            && behavior.parameter_type_names().len() == 1
            && behavior.parameter_type_names()[0] == "java.lang.String[]"
            && behavior.return_type_name() == "void";
        !is_entry_point
    }

    fn include_root_loaded(&self) -> bool {
        self.unsafe_enabled
    }

    fn matches_loader(&self, loader: Option<LoaderId>) -> bool {
        !self.host.is_stealth_loader(loader)
    }
}
