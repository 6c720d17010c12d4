use crate::host::{BehaviorMetadata, LoaderId, TypeMetadata};
use crate::jvm::class_file::{
    Attribute, ClassFile, ConstantPool, Exceptions, RuntimeVisibleAnnotations,
};
use crate::jvm::{
    BinaryName, Error, FieldType, MethodDescriptor, ParseDescriptor, RenderJavaName,
    UnqualifiedName,
};

/// Read the shape of a type straight out of its class file
///
/// This is what reflection would report for the type once it is loaded by `loader`, so
/// structures built from it agree with structures built from live metadata.
pub fn read_type_metadata(loader: Option<LoaderId>, bytes: &[u8]) -> Result<TypeMetadata, Error> {
    let class = ClassFile::from_bytes(bytes)?;
    type_metadata(loader, &class)
}

pub fn type_metadata(loader: Option<LoaderId>, class: &ClassFile) -> Result<TypeMetadata, Error> {
    let constants = &class.constants;

    let mut behaviors = vec![];
    for method in &class.methods {
        let name = method.name(constants)?;
        if name == UnqualifiedName::CLINIT.as_ref() {
            continue;
        }
        let descriptor = parse_method_descriptor(method.descriptor(constants)?)?;
        let exception_type_names = match Attribute::find::<Exceptions>(&method.attributes, constants)? {
            None => vec![],
            Some(Exceptions(classes)) => classes
                .iter()
                .map(|class| constants.class_name(*class).map(internal_to_java))
                .collect::<Result<_, _>>()?,
        };
        behaviors.push(BehaviorMetadata {
            name: String::from(name),
            access: method.access_flags.bits(),
            parameter_type_names: descriptor
                .parameters
                .iter()
                .map(RenderJavaName::java_name)
                .collect(),
            return_type_name: descriptor
                .return_type
                .as_ref()
                .map_or_else(|| String::from("void"), RenderJavaName::java_name),
            exception_type_names,
            annotation_names: annotation_names(&method.attributes, constants)?,
        });
    }

    Ok(TypeMetadata {
        name: internal_to_java(class.this_class_name()?),
        access: class.access_flags.bits(),
        loader,
        super_name: class.super_class_name()?.map(internal_to_java),
        interface_names: class
            .interface_names()?
            .into_iter()
            .map(internal_to_java)
            .collect(),
        annotation_names: annotation_names(&class.attributes, constants)?,
        behaviors,
    })
}

pub(crate) fn parse_method_descriptor(
    descriptor: &str,
) -> Result<MethodDescriptor<BinaryName>, Error> {
    MethodDescriptor::parse(descriptor).map_err(|_| Error::BadDescriptor(String::from(descriptor)))
}

fn annotation_names(attributes: &[Attribute], constants: &ConstantPool) -> Result<Vec<String>, Error> {
    let annotations = match Attribute::find::<RuntimeVisibleAnnotations>(attributes, constants)? {
        None => return Ok(vec![]),
        Some(annotations) => annotations,
    };
    annotations
        .0
        .iter()
        .map(|descriptor| {
            let descriptor = constants.utf8(*descriptor)?;
            FieldType::<BinaryName>::parse(descriptor)
                .map(|typ| typ.java_name())
                .map_err(|_| Error::BadDescriptor(String::from(descriptor)))
        })
        .collect()
}

fn internal_to_java(internal_name: &str) -> String {
    internal_name.replace('/', ".")
}
