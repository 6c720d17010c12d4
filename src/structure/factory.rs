use super::{read_type_metadata, Origin, ResolveError, TypeStructure};
use crate::host::{HostError, HostRuntime, LoadedType, LoaderId, TypeMetadata};
use crate::jvm::BaseType;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

type CacheKey = (Option<LoaderId>, String, Origin);

/// Builds type structures and caches the ones resolved by name
///
/// The cache holds at most `capacity` structures and evicts the oldest first. Structures keep a
/// weak reference back to the factory to resolve what they refer to.
pub struct StructureFactory {
    host: Arc<dyn HostRuntime>,
    this: Weak<StructureFactory>,
    cache: Mutex<StructureCache>,
}

struct StructureCache {
    capacity: usize,
    entries: HashMap<CacheKey, Arc<TypeStructure>>,
    order: VecDeque<CacheKey>,
}

impl StructureCache {
    fn get(&self, key: &CacheKey) -> Option<Arc<TypeStructure>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, structure: Arc<TypeStructure>) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, structure);
    }
}

impl StructureFactory {
    pub fn new(host: Arc<dyn HostRuntime>, capacity: usize) -> Arc<StructureFactory> {
        Arc::new_cyclic(|this| StructureFactory {
            host,
            this: this.clone(),
            cache: Mutex::new(StructureCache {
                capacity,
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        })
    }

    pub fn host(&self) -> &Arc<dyn HostRuntime> {
        &self.host
    }

    /// Structure of a class being defined or transformed, from its bytes
    pub fn from_bytes(
        &self,
        loader: Option<LoaderId>,
        bytes: &[u8],
    ) -> Result<Arc<TypeStructure>, ResolveError> {
        let metadata = read_type_metadata(loader, bytes)?;
        self.from_metadata(metadata, Origin::Raw)
    }

    /// Structure of a loaded type, from what the runtime reports about it
    pub fn from_live(&self, loaded: &LoadedType) -> Result<Arc<TypeStructure>, ResolveError> {
        let metadata = self.host.live_metadata(loaded.loader, &loaded.name)?;
        self.from_metadata(metadata, Origin::Live)
    }

    /// Structure of a loaded type, from its class file as seen by its loader
    pub fn from_resource(&self, loaded: &LoadedType) -> Result<Arc<TypeStructure>, ResolveError> {
        let path = format!("{}.class", loaded.internal_name());
        let resource = self
            .host
            .find_resource(loaded.loader, &path)
            .ok_or_else(|| HostError::TypeNotFound(loaded.name.clone()))?;
        let metadata = read_type_metadata(resource.loader, &resource.bytes)?;
        self.from_metadata(metadata, Origin::Raw)
    }

    pub fn from_metadata(
        &self,
        metadata: TypeMetadata,
        origin: Origin,
    ) -> Result<Arc<TypeStructure>, ResolveError> {
        TypeStructure::new(metadata, origin, self.this.clone())
    }

    /// Resolve a type by Java name from a loader, or `None` if the loader can't find it
    pub fn resolve(
        &self,
        loader: Option<LoaderId>,
        name: &str,
        origin: Origin,
    ) -> Result<Option<Arc<TypeStructure>>, ResolveError> {
        if name.ends_with("[]") || BaseType::from_keyword(name).is_some() || name == "void" {
            return Ok(Some(TypeStructure::synthetic(name, origin)));
        }

        let key = (loader, String::from(name), origin);
        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok(Some(cached));
        }

        let metadata = match origin {
            Origin::Raw => {
                let path = format!("{}.class", name.replace('.', "/"));
                match self.host.find_resource(loader, &path) {
                    None => {
                        log::debug!("No resource for {} from loader {:?}, skipping", name, loader);
                        return Ok(None);
                    }
                    Some(resource) => read_type_metadata(resource.loader, &resource.bytes)?,
                }
            }
            Origin::Live => match self.host.live_metadata(loader, name) {
                Ok(metadata) => metadata,
                Err(HostError::TypeNotFound(_)) => return Ok(None),
                Err(err) => return Err(ResolveError::Host(err)),
            },
        };

        let structure = self.from_metadata(metadata, origin)?;
        self.cache.lock().insert(key, structure.clone());
        Ok(Some(structure))
    }

    /// Number of cached structures
    pub fn cached(&self) -> usize {
        self.cache.lock().entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{ClassResource, ClassTransformer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Host reporting an empty class for every name, counting how often it is asked
    #[derive(Default)]
    struct Lookups(AtomicUsize);

    impl HostRuntime for Lookups {
        fn loaded_types(&self) -> Vec<LoadedType> {
            vec![]
        }
        fn retransform(&self, _: &[LoadedType]) -> Result<(), HostError> {
            Ok(())
        }
        fn find_resource(&self, _: Option<LoaderId>, _: &str) -> Option<ClassResource> {
            None
        }
        fn live_metadata(
            &self,
            loader: Option<LoaderId>,
            name: &str,
        ) -> Result<TypeMetadata, HostError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(TypeMetadata {
                name: String::from(name),
                access: 0x0001,
                loader,
                super_name: Some(String::from("java.lang.Object")),
                interface_names: vec![],
                annotation_names: vec![],
                behaviors: vec![],
            })
        }
        fn expose_bridge(&self, _: Option<LoaderId>) -> bool {
            true
        }
        fn add_transformer(&self, _: u32, _: Arc<dyn ClassTransformer>) {}
        fn remove_transformer(&self, _: u32) {}
        fn is_stealth_loader(&self, _: Option<LoaderId>) -> bool {
            false
        }
        fn supports_native_prefix(&self) -> bool {
            false
        }
    }

    fn resolve(factory: &StructureFactory, name: &str) -> Arc<TypeStructure> {
        factory
            .resolve(Some(1), name, Origin::Live)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn oldest_structure_is_evicted_first() {
        let host = Arc::new(Lookups::default());
        let factory = StructureFactory::new(host.clone(), 2);

        let first = resolve(&factory, "demo.First");
        let second = resolve(&factory, "demo.Second");
        assert_eq!(factory.cached(), 2);

        resolve(&factory, "demo.Third");
        assert_eq!(factory.cached(), 2);
        assert_eq!(host.0.load(Ordering::SeqCst), 3);

        // Still cached
        assert!(Arc::ptr_eq(&second, &resolve(&factory, "demo.Second")));
        assert_eq!(host.0.load(Ordering::SeqCst), 3);

        // Evicted, so looked up again
        assert!(!Arc::ptr_eq(&first, &resolve(&factory, "demo.First")));
        assert_eq!(host.0.load(Ordering::SeqCst), 4);
        assert_eq!(factory.cached(), 2);
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let host = Arc::new(Lookups::default());
        let factory = StructureFactory::new(host.clone(), 0);

        resolve(&factory, "demo.First");
        resolve(&factory, "demo.First");
        assert_eq!(factory.cached(), 0);
        assert_eq!(host.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn synthetic_types_bypass_the_cache() {
        let host = Arc::new(Lookups::default());
        let factory = StructureFactory::new(host.clone(), 2);

        resolve(&factory, "int");
        resolve(&factory, "java.lang.String[]");
        assert_eq!(factory.cached(), 0);
        assert_eq!(host.0.load(Ordering::SeqCst), 0);
    }
}
