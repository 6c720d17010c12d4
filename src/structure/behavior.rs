use super::{ResolveError, TypeStructure};
use crate::host::BehaviorMetadata;
use crate::jvm::{
    BinaryName, Error, FieldType, MethodAccessFlags, MethodDescriptor, RenderDescriptor,
    UnqualifiedName,
};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

/// Method or constructor declared by a type
pub struct BehaviorStructure {
    metadata: BehaviorMetadata,
    descriptor: String,
    declaring_name: String,
    declaring: Weak<TypeStructure>,
}

impl BehaviorStructure {
    pub(super) fn new(
        metadata: BehaviorMetadata,
        descriptor: String,
        declaring_name: &str,
        declaring: Weak<TypeStructure>,
    ) -> BehaviorStructure {
        BehaviorStructure {
            metadata,
            descriptor,
            declaring_name: String::from(declaring_name),
            declaring,
        }
    }

    /// JVM method descriptor, rebuilt from the parameter and return type names
    pub(super) fn descriptor_of(metadata: &BehaviorMetadata) -> Result<String, Error> {
        let field_type = |name: &str| {
            FieldType::<BinaryName>::from_java_name(name)
                .ok_or_else(|| Error::BadDescriptor(String::from(name)))
        };
        let parameters = metadata
            .parameter_type_names
            .iter()
            .map(|name| field_type(name))
            .collect::<Result<Vec<_>, _>>()?;
        let return_type = match metadata.return_type_name.as_str() {
            "void" => None,
            name => Some(field_type(name)?),
        };
        Ok(MethodDescriptor {
            parameters,
            return_type,
        }
        .render())
    }

    /// `<init>` for constructors
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn access(&self) -> MethodAccessFlags {
        MethodAccessFlags::from_bits_truncate(self.metadata.access)
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn metadata(&self) -> &BehaviorMetadata {
        &self.metadata
    }

    pub fn is_constructor(&self) -> bool {
        self.metadata.name == UnqualifiedName::INIT.as_ref()
    }

    /// Java name of the declaring type
    pub fn declaring_type_name(&self) -> &str {
        &self.declaring_name
    }

    pub fn declaring_type(&self) -> Option<Arc<TypeStructure>> {
        self.declaring.upgrade()
    }

    pub fn parameter_type_names(&self) -> &[String] {
        &self.metadata.parameter_type_names
    }

    pub fn exception_type_names(&self) -> &[String] {
        &self.metadata.exception_type_names
    }

    pub fn annotation_names(&self) -> &[String] {
        &self.metadata.annotation_names
    }

    /// Java name of the return type (the declaring type, for constructors)
    pub fn return_type_name(&self) -> &str {
        if self.is_constructor() {
            &self.declaring_name
        } else {
            &self.metadata.return_type_name
        }
    }

    /// `declaring#name(parameter,...)`, unique among the behaviors of the declaring type
    pub fn signature_code(&self) -> String {
        signature_code(
            &self.declaring_name,
            &self.metadata.name,
            &self.metadata.parameter_type_names,
        )
    }

    pub fn parameter_types(&self) -> Result<Vec<Arc<TypeStructure>>, ResolveError> {
        self.declaring()?
            .resolve_all(&self.metadata.parameter_type_names)
    }

    pub fn exception_types(&self) -> Result<Vec<Arc<TypeStructure>>, ResolveError> {
        self.declaring()?
            .resolve_all(&self.metadata.exception_type_names)
    }

    pub fn annotation_types(&self) -> Result<Vec<Arc<TypeStructure>>, ResolveError> {
        self.declaring()?.resolve_all(&self.metadata.annotation_names)
    }

    pub fn return_type(&self) -> Result<Option<Arc<TypeStructure>>, ResolveError> {
        let declaring = self.declaring()?;
        if self.is_constructor() {
            Ok(Some(declaring))
        } else {
            declaring.resolve(&self.metadata.return_type_name)
        }
    }

    fn declaring(&self) -> Result<Arc<TypeStructure>, ResolveError> {
        self.declaring.upgrade().ok_or(ResolveError::Detached)
    }
}

/// Signature code of a behavior, from Java names
pub fn signature_code(declaring: &str, name: &str, parameter_type_names: &[String]) -> String {
    format!("{}#{}({})", declaring, name, parameter_type_names.join(","))
}

impl Debug for BehaviorStructure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.signature_code())
    }
}
