use crate::host::{HostRuntime, LoaderId};
use crate::jvm::class_file::ClassFile;
use crate::jvm::verifier::TypeHierarchy;
use crate::jvm::{BinaryName, ClassAccessFlags, Name};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Super class and kind of a class, as read from its class file
#[derive(Debug, Clone)]
struct ClassHeader {
    super_name: Option<BinaryName>,
    is_interface: bool,
}

/// Class hierarchy as seen from a loader, read lazily from class file resources
///
/// Any class which can't be found or parsed makes the merge fall back to `java/lang/Object`,
/// which the verifier accepts for every reference.
pub struct LoaderHierarchy<'a> {
    host: &'a dyn HostRuntime,
    loader: Option<LoaderId>,
    headers: Mutex<HashMap<BinaryName, Option<ClassHeader>>>,
}

impl<'a> LoaderHierarchy<'a> {
    pub fn new(host: &'a dyn HostRuntime, loader: Option<LoaderId>) -> LoaderHierarchy<'a> {
        LoaderHierarchy {
            host,
            loader,
            headers: Mutex::new(HashMap::new()),
        }
    }

    fn header(&self, name: &BinaryName) -> Option<ClassHeader> {
        if let Some(header) = self.headers.lock().get(name) {
            return header.clone();
        }
        let header = self.read_header(name);
        if header.is_none() {
            log::debug!("No class file for {} from loader {:?}", name, self.loader);
        }
        self.headers.lock().insert(name.clone(), header.clone());
        header
    }

    fn read_header(&self, name: &BinaryName) -> Option<ClassHeader> {
        let resource = self.host.find_resource(self.loader, &name.resource_path())?;
        let class = ClassFile::from_bytes(&resource.bytes).ok()?;
        let super_name = match class.super_class_name().ok()? {
            None => None,
            Some(super_name) => Some(BinaryName::from_string(String::from(super_name)).ok()?),
        };
        Some(ClassHeader {
            super_name,
            is_interface: class.access_flags.contains(ClassAccessFlags::INTERFACE),
        })
    }

    /// The class followed by all of its super classes, ending in `java/lang/Object`
    fn super_chain(&self, name: &BinaryName) -> Option<Vec<BinaryName>> {
        let mut chain = vec![name.clone()];
        let mut current = name.clone();
        while current != BinaryName::OBJECT {
            match self.header(&current)?.super_name {
                Some(super_name) => {
                    chain.push(super_name.clone());
                    current = super_name;
                }
                None => break,
            }
        }
        Some(chain)
    }

    fn try_common_super_class(&self, left: &BinaryName, right: &BinaryName) -> Option<BinaryName> {
        if self.header(left)?.is_interface || self.header(right)?.is_interface {
            return None;
        }
        let left_chain = self.super_chain(left)?;
        self.super_chain(right)?
            .into_iter()
            .find(|name| left_chain.contains(name))
    }
}

impl<'a> TypeHierarchy for LoaderHierarchy<'a> {
    fn common_super_class(&self, left: &BinaryName, right: &BinaryName) -> BinaryName {
        if left == right {
            return left.clone();
        }
        self.try_common_super_class(left, right)
            .unwrap_or(BinaryName::OBJECT)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{ClassResource, ClassTransformer, HostError, LoadedType, TypeMetadata};
    use crate::jvm::class_file::{ConstantPool, Version};
    use std::sync::Arc;

    /// Host holding a few hand-built class headers
    struct Headers(HashMap<String, Vec<u8>>);

    fn class_bytes(name: &str, super_name: &str, interface: bool) -> Vec<u8> {
        let mut constants = ConstantPool::new();
        let this_class = constants.get_class(name).unwrap();
        let super_class = constants.get_class(super_name).unwrap();
        let mut access_flags = ClassAccessFlags::PUBLIC;
        if interface {
            access_flags |= ClassAccessFlags::INTERFACE | ClassAccessFlags::ABSTRACT;
        }
        let class = ClassFile {
            version: Version::JAVA8,
            constants,
            access_flags,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        };
        class.to_bytes().unwrap()
    }

    impl HostRuntime for Headers {
        fn loaded_types(&self) -> Vec<LoadedType> {
            vec![]
        }
        fn retransform(&self, _: &[LoadedType]) -> Result<(), HostError> {
            Ok(())
        }
        fn find_resource(&self, _: Option<LoaderId>, path: &str) -> Option<ClassResource> {
            self.0.get(path).map(|bytes| ClassResource {
                loader: None,
                bytes: bytes.clone(),
            })
        }
        fn live_metadata(&self, _: Option<LoaderId>, name: &str) -> Result<TypeMetadata, HostError> {
            Err(HostError::TypeNotFound(String::from(name)))
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

    fn name(name: &str) -> BinaryName {
        BinaryName::from_string(String::from(name)).unwrap()
    }

    fn host() -> Headers {
        let mut classes = HashMap::new();
        for (class, super_name, interface) in [
            ("demo/Animal", "java/lang/Object", false),
            ("demo/Dog", "demo/Animal", false),
            ("demo/Cat", "demo/Animal", false),
            ("demo/Puppy", "demo/Dog", false),
            ("demo/Pet", "java/lang/Object", true),
        ] {
            classes.insert(
                format!("{}.class", class),
                class_bytes(class, super_name, interface),
            );
        }
        Headers(classes)
    }

    #[test]
    fn siblings_merge_to_their_parent() {
        let host = host();
        let hierarchy = LoaderHierarchy::new(&host, Some(1));
        let merged = hierarchy.common_super_class(&name("demo/Puppy"), &name("demo/Cat"));
        assert_eq!(merged, name("demo/Animal"));
    }

    #[test]
    fn assignable_types_merge_to_the_more_general() {
        let host = host();
        let hierarchy = LoaderHierarchy::new(&host, Some(1));
        assert_eq!(
            hierarchy.common_super_class(&name("demo/Dog"), &name("demo/Puppy")),
            name("demo/Dog")
        );
        assert_eq!(
            hierarchy.common_super_class(&name("demo/Puppy"), &name("demo/Dog")),
            name("demo/Dog")
        );
    }

    #[test]
    fn interfaces_and_unknown_types_merge_to_object() {
        let host = host();
        let hierarchy = LoaderHierarchy::new(&host, Some(1));
        assert_eq!(
            hierarchy.common_super_class(&name("demo/Pet"), &name("demo/Dog")),
            BinaryName::OBJECT
        );
        assert_eq!(
            hierarchy.common_super_class(&name("demo/Dog"), &name("demo/Missing")),
            BinaryName::OBJECT
        );
    }
}
