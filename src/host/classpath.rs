use super::{
    ClassResource, ClassTransformer, HostError, HostRuntime, LoadedType, LoaderId, TypeMetadata,
};
use crate::structure::read_type_metadata;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loader id given to every class found on the class path
pub const CLASS_PATH_LOADER: LoaderId = 1;

/// Host backed by directories of class files, for working on classes outside of a live runtime
///
/// Every class under one of the roots counts as loaded by [`CLASS_PATH_LOADER`]. The root loader
/// sees nothing, so references to JDK types resolve to nothing and are skipped. Retransforming
/// runs the registered transformers over the class file on disk and keeps the result in memory.
pub struct ClassPathHost {
    roots: Vec<PathBuf>,
    transformers: Mutex<Vec<(u32, Arc<dyn ClassTransformer>)>>,
    transformed: Mutex<HashMap<String, Vec<u8>>>,
}

impl ClassPathHost {
    pub fn new(roots: Vec<PathBuf>) -> ClassPathHost {
        ClassPathHost {
            roots,
            transformers: Mutex::new(vec![]),
            transformed: Mutex::new(HashMap::new()),
        }
    }

    /// Original bytes of a resource (eg. `com/example/Calc.class`)
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.roots
            .iter()
            .find_map(|root| fs::read(root.join(path)).ok())
    }

    /// Bytes produced by the last retransformation of a class (by internal name)
    pub fn transformed_bytes(&self, internal_name: &str) -> Option<Vec<u8>> {
        self.transformed.lock().get(internal_name).cloned()
    }

    fn collect_classes(dir: &Path, package: &str, found: &mut Vec<LoadedType>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::debug!("Skipping '{}': {}", dir.display(), err);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                let nested = if package.is_empty() {
                    file_name
                } else {
                    format!("{}.{}", package, file_name)
                };
                ClassPathHost::collect_classes(&path, &nested, found);
            } else if let Some(simple_name) = file_name.strip_suffix(".class") {
                let name = if package.is_empty() {
                    String::from(simple_name)
                } else {
                    format!("{}.{}", package, simple_name)
                };
                found.push(LoadedType::new(name, Some(CLASS_PATH_LOADER)));
            }
        }
    }
}

impl HostRuntime for ClassPathHost {
    fn loaded_types(&self) -> Vec<LoadedType> {
        let mut found = vec![];
        for root in &self.roots {
            ClassPathHost::collect_classes(root, "", &mut found);
        }
        found.sort();
        found.dedup();
        found
    }

    fn retransform(&self, types: &[LoadedType]) -> Result<(), HostError> {
        let transformers = self.transformers.lock().clone();
        for loaded in types {
            let internal_name = loaded.internal_name();
            let original = self
                .read(&format!("{}.class", internal_name))
                .ok_or_else(|| HostError::TypeNotFound(loaded.name.clone()))?;
            let mut bytes = original;
            for (_, transformer) in &transformers {
                if let Some(updated) =
                    transformer.transform(loaded.loader, &internal_name, true, &bytes)
                {
                    bytes = updated;
                }
            }
            self.transformed.lock().insert(internal_name, bytes);
        }
        Ok(())
    }

    fn find_resource(&self, loader: Option<LoaderId>, path: &str) -> Option<ClassResource> {
        if loader.is_none() {
            return None;
        }
        self.read(path).map(|bytes| ClassResource {
            loader: Some(CLASS_PATH_LOADER),
            bytes,
        })
    }

    fn live_metadata(
        &self,
        loader: Option<LoaderId>,
        name: &str,
    ) -> Result<TypeMetadata, HostError> {
        let path = format!("{}.class", name.replace('.', "/"));
        let resource = self
            .find_resource(loader, &path)
            .ok_or_else(|| HostError::TypeNotFound(String::from(name)))?;
        read_type_metadata(resource.loader, &resource.bytes)
            .map_err(|_| HostError::TypeNotFound(String::from(name)))
    }

    fn expose_bridge(&self, _loader: Option<LoaderId>) -> bool {
        true
    }

    fn add_transformer(&self, id: u32, transformer: Arc<dyn ClassTransformer>) {
        self.transformers.lock().push((id, transformer));
    }

    fn remove_transformer(&self, id: u32) {
        self.transformers.lock().retain(|(existing, _)| *existing != id);
    }

    fn is_stealth_loader(&self, _loader: Option<LoaderId>) -> bool {
        false
    }

    fn supports_native_prefix(&self) -> bool {
        false
    }
}
