use super::{BehaviorStructure, Origin, ResolveError, StructureFactory};
use crate::host::{LoaderId, TypeMetadata};
use crate::jvm::{BinaryName, ClassAccessFlags};
use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

/// Shape of a type, with its family of super types computed on demand
///
/// Two structures are equal when their names are.
pub struct TypeStructure {
    metadata: TypeMetadata,
    origin: Origin,
    factory: Weak<StructureFactory>,
    behaviors: Vec<Arc<BehaviorStructure>>,

    super_type: OnceCell<Option<Arc<TypeStructure>>>,
    interface_types: OnceCell<Vec<Arc<TypeStructure>>>,
    annotation_types: OnceCell<Vec<Arc<TypeStructure>>>,
    family_super_types: OnceCell<Vec<Arc<TypeStructure>>>,
    family_interface_types: OnceCell<Vec<Arc<TypeStructure>>>,
    family_annotation_types: OnceCell<Vec<Arc<TypeStructure>>>,
    family_types: OnceCell<Vec<Arc<TypeStructure>>>,
}

impl TypeStructure {
    pub(super) fn new(
        metadata: TypeMetadata,
        origin: Origin,
        factory: Weak<StructureFactory>,
    ) -> Result<Arc<TypeStructure>, ResolveError> {
        let mut descriptors = Vec::with_capacity(metadata.behaviors.len());
        for behavior in &metadata.behaviors {
            descriptors.push(BehaviorStructure::descriptor_of(behavior)?);
        }

        Ok(Arc::new_cyclic(|this: &Weak<TypeStructure>| {
            let behaviors = metadata
                .behaviors
                .iter()
                .zip(descriptors)
                .map(|(behavior, descriptor)| {
                    Arc::new(BehaviorStructure::new(
                        behavior.clone(),
                        descriptor,
                        &metadata.name,
                        this.clone(),
                    ))
                })
                .collect();
            TypeStructure {
                metadata,
                origin,
                factory,
                behaviors,
                super_type: OnceCell::new(),
                interface_types: OnceCell::new(),
                annotation_types: OnceCell::new(),
                family_super_types: OnceCell::new(),
                family_interface_types: OnceCell::new(),
                family_annotation_types: OnceCell::new(),
                family_types: OnceCell::new(),
            }
        }))
    }

    /// Structure of a primitive (`int`) or array (`java.lang.String[]`) type
    ///
    /// These have no super types, interfaces, annotations, or behaviors.
    pub(super) fn synthetic(name: &str, origin: Origin) -> Arc<TypeStructure> {
        let metadata = TypeMetadata {
            name: String::from(name),
            access: (ClassAccessFlags::PUBLIC | ClassAccessFlags::FINAL | ClassAccessFlags::ABSTRACT)
                .bits(),
            loader: None,
            super_name: None,
            interface_names: vec![],
            annotation_names: vec![],
            behaviors: vec![],
        };
        Arc::new(TypeStructure {
            metadata,
            origin,
            factory: Weak::new(),
            behaviors: vec![],
            super_type: OnceCell::with_value(None),
            interface_types: OnceCell::with_value(vec![]),
            annotation_types: OnceCell::with_value(vec![]),
            family_super_types: OnceCell::with_value(vec![]),
            family_interface_types: OnceCell::with_value(vec![]),
            family_annotation_types: OnceCell::with_value(vec![]),
            family_types: OnceCell::with_value(vec![]),
        })
    }

    /// Java name (`com.example.Calculator`)
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Internal name (`com/example/Calculator`)
    pub fn internal_name(&self) -> String {
        self.metadata.name.replace('.', "/")
    }

    pub fn access(&self) -> ClassAccessFlags {
        ClassAccessFlags::from_bits_truncate(self.metadata.access)
    }

    /// Defining loader (`None` for the root loader)
    pub fn loader(&self) -> Option<LoaderId> {
        self.metadata.loader
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Declared shape, before any references are resolved
    pub fn metadata(&self) -> &TypeMetadata {
        &self.metadata
    }

    pub fn behaviors(&self) -> &[Arc<BehaviorStructure>] {
        &self.behaviors
    }

    pub fn is_interface(&self) -> bool {
        self.access().contains(ClassAccessFlags::INTERFACE)
    }

    pub fn is_annotation(&self) -> bool {
        self.access().contains(ClassAccessFlags::ANNOTATION)
    }

    /// Is this an annotation type whose presence is inherited by subtypes?
    pub fn is_inheritable_annotation(&self) -> bool {
        let inherited = BinaryName::INHERITED.to_java_name();
        self.is_annotation()
            && self
                .metadata
                .annotation_names
                .iter()
                .any(|name| *name == inherited)
    }

    pub fn super_type(&self) -> Result<Option<Arc<TypeStructure>>, ResolveError> {
        self.super_type
            .get_or_try_init(|| match &self.metadata.super_name {
                None => Ok(None),
                Some(name) => self.resolve(name),
            })
            .map(Clone::clone)
    }

    pub fn interface_types(&self) -> Result<&[Arc<TypeStructure>], ResolveError> {
        self.interface_types
            .get_or_try_init(|| self.resolve_all(&self.metadata.interface_names))
            .map(Vec::as_slice)
    }

    pub fn annotation_types(&self) -> Result<&[Arc<TypeStructure>], ResolveError> {
        self.annotation_types
            .get_or_try_init(|| self.resolve_all(&self.metadata.annotation_names))
            .map(Vec::as_slice)
    }

    /// Super class chain up to the root
    pub fn family_super_types(&self) -> Result<&[Arc<TypeStructure>], ResolveError> {
        self.family_super_types
            .get_or_try_init(|| {
                let mut family = Family::default();
                if let Some(parent) = self.super_type()? {
                    family.add(&parent);
                    family.extend(parent.family_super_types()?);
                }
                Ok(family.into_vec())
            })
            .map(Vec::as_slice)
    }

    /// Every interface implemented, directly or through super classes and super interfaces
    pub fn family_interface_types(&self) -> Result<&[Arc<TypeStructure>], ResolveError> {
        self.family_interface_types
            .get_or_try_init(|| {
                let mut family = Family::default();
                for interface in self.interface_types()? {
                    family.add(interface);
                    family.extend(interface.family_interface_types()?);
                }
                for parent in self.family_super_types()? {
                    for interface in parent.interface_types()? {
                        family.add(interface);
                        family.extend(interface.family_interface_types()?);
                    }
                }
                Ok(family.into_vec())
            })
            .map(Vec::as_slice)
    }

    /// All super classes and interfaces
    pub fn family_types(&self) -> Result<&[Arc<TypeStructure>], ResolveError> {
        self.family_types
            .get_or_try_init(|| {
                let mut family = Family::default();
                for parent in self.family_super_types()? {
                    family.add(parent);
                    family.extend(parent.family_interface_types()?);
                }
                for interface in self.family_interface_types()? {
                    family.add(interface);
                    family.extend(interface.family_interface_types()?);
                }
                Ok(family.into_vec())
            })
            .map(Vec::as_slice)
    }

    /// Declared annotations, plus inheritable annotations of the family types
    pub fn family_annotation_types(&self) -> Result<&[Arc<TypeStructure>], ResolveError> {
        self.family_annotation_types
            .get_or_try_init(|| {
                let mut family = Family::default();
                family.extend(self.annotation_types()?);
                for member in self.family_types()? {
                    for annotation in member.family_annotation_types()? {
                        if annotation.is_inheritable_annotation() {
                            family.add(annotation);
                        }
                    }
                }
                Ok(family.into_vec())
            })
            .map(Vec::as_slice)
    }

    /// Resolve a type referenced from this one
    pub(super) fn resolve(&self, name: &str) -> Result<Option<Arc<TypeStructure>>, ResolveError> {
        let factory = self.factory.upgrade().ok_or(ResolveError::Detached)?;
        factory.resolve(self.metadata.loader, name, self.origin)
    }

    /// Resolve referenced types, skipping those that can't be found
    pub(super) fn resolve_all(
        &self,
        names: &[String],
    ) -> Result<Vec<Arc<TypeStructure>>, ResolveError> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            if let Some(structure) = self.resolve(name)? {
                resolved.push(structure);
            }
        }
        Ok(resolved)
    }
}

impl PartialEq for TypeStructure {
    fn eq(&self, other: &Self) -> bool {
        self.metadata.name == other.metadata.name
    }
}

impl Eq for TypeStructure {}

impl Debug for TypeStructure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeStructure")
            .field("name", &self.metadata.name)
            .field("loader", &self.metadata.loader)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Types in first-seen order, without repeats
#[derive(Default)]
struct Family {
    seen: HashSet<String>,
    members: Vec<Arc<TypeStructure>>,
}

impl Family {
    fn add(&mut self, member: &Arc<TypeStructure>) {
        if self.seen.insert(member.metadata.name.clone()) {
            self.members.push(member.clone());
        }
    }

    fn extend(&mut self, members: &[Arc<TypeStructure>]) {
        for member in members {
            self.add(member);
        }
    }

    fn into_vec(self) -> Vec<Arc<TypeStructure>> {
        self.members
    }
}
