#![allow(dead_code)]

use jvm_sandbox::host::{
    ClassResource, ClassTransformer, HostError, HostRuntime, LoadedType, LoaderId, TypeMetadata,
};
use jvm_sandbox::jvm::class_file::{
    ClassFile, Code, ConstantPool, Exceptions, Method, RuntimeVisibleAnnotations, Version,
};
use jvm_sandbox::jvm::code::opcodes::*;
use jvm_sandbox::jvm::code::{CodeElement, Instruction, MethodBody};
use jvm_sandbox::jvm::verifier::{MethodContext, ObjectHierarchy};
use jvm_sandbox::jvm::{
    BinaryName, ClassAccessFlags, FieldType, MethodAccessFlags, MethodDescriptor, Name,
    ParseDescriptor, UnqualifiedName,
};
use jvm_sandbox::structure::read_type_metadata;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Loader id of the application classes in the tests
pub const APP_LOADER: LoaderId = 1;

pub const INHERITED: &str = "java.lang.annotation.Inherited";

enum Body {
    Given(Vec<CodeElement>),

    /// `this.super()`, then return
    Constructor,
    Missing,
}

struct MethodDef {
    name: String,
    descriptor: String,
    access: MethodAccessFlags,
    body: Body,
    annotations: Vec<String>,
    exceptions: Vec<String>,
}

/// Builds small class files
pub struct ClassBuilder {
    name: String,
    access: ClassAccessFlags,
    super_name: String,
    interfaces: Vec<String>,
    annotations: Vec<String>,
    methods: Vec<MethodDef>,
}

fn internal(java_name: &str) -> String {
    java_name.replace('.', "/")
}

fn descriptor_of(java_name: &str) -> String {
    format!("L{};", internal(java_name))
}

impl ClassBuilder {
    /// Public class extending `java.lang.Object`
    pub fn class(name: &str) -> ClassBuilder {
        ClassBuilder {
            name: String::from(name),
            access: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            super_name: String::from("java.lang.Object"),
            interfaces: vec![],
            annotations: vec![],
            methods: vec![],
        }
    }

    pub fn interface(name: &str) -> ClassBuilder {
        let mut builder = ClassBuilder::class(name);
        builder.access =
            ClassAccessFlags::PUBLIC | ClassAccessFlags::INTERFACE | ClassAccessFlags::ABSTRACT;
        builder
    }

    /// Annotation type, inherited by subclasses if `inherited`
    pub fn annotation(name: &str, inherited: bool) -> ClassBuilder {
        let mut builder = ClassBuilder::interface(name)
            .implements("java.lang.annotation.Annotation");
        builder.access |= ClassAccessFlags::ANNOTATION;
        if inherited {
            builder = builder.annotated(INHERITED);
        }
        builder
    }

    pub fn extends(mut self, super_name: &str) -> ClassBuilder {
        self.super_name = String::from(super_name);
        self
    }

    pub fn implements(mut self, interface: &str) -> ClassBuilder {
        self.interfaces.push(String::from(interface));
        self
    }

    pub fn annotated(mut self, annotation: &str) -> ClassBuilder {
        self.annotations.push(String::from(annotation));
        self
    }

    /// Constructor calling the super class constructor
    pub fn constructor(mut self) -> ClassBuilder {
        self.methods.push(MethodDef {
            name: String::from("<init>"),
            descriptor: String::from("()V"),
            access: MethodAccessFlags::PUBLIC,
            body: Body::Constructor,
            annotations: vec![],
            exceptions: vec![],
        });
        self
    }

    /// Method with a body returning a default value
    pub fn method(mut self, name: &str, descriptor: &str, access: MethodAccessFlags) -> ClassBuilder {
        let body = default_body(descriptor);
        self.methods.push(MethodDef {
            name: String::from(name),
            descriptor: String::from(descriptor),
            access,
            body: Body::Given(body),
            annotations: vec![],
            exceptions: vec![],
        });
        self
    }

    /// Method with the given body
    pub fn method_with(
        mut self,
        name: &str,
        descriptor: &str,
        access: MethodAccessFlags,
        body: Vec<CodeElement>,
    ) -> ClassBuilder {
        self.methods.push(MethodDef {
            name: String::from(name),
            descriptor: String::from(descriptor),
            access,
            body: Body::Given(body),
            annotations: vec![],
            exceptions: vec![],
        });
        self
    }

    /// Method without a body (`abstract` or `native`)
    pub fn bodiless(mut self, name: &str, descriptor: &str, access: MethodAccessFlags) -> ClassBuilder {
        self.methods.push(MethodDef {
            name: String::from(name),
            descriptor: String::from(descriptor),
            access,
            body: Body::Missing,
            annotations: vec![],
            exceptions: vec![],
        });
        self
    }

    /// Annotate the last added method
    pub fn method_annotated(mut self, annotation: &str) -> ClassBuilder {
        if let Some(method) = self.methods.last_mut() {
            method.annotations.push(String::from(annotation));
        }
        self
    }

    /// Declare a checked exception on the last added method
    pub fn throwing(mut self, exception: &str) -> ClassBuilder {
        if let Some(method) = self.methods.last_mut() {
            method.exceptions.push(String::from(exception));
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut constants = ConstantPool::new();
        let this_class = constants.get_class(&internal(&self.name)).unwrap();
        let super_class = constants.get_class(&internal(&self.super_name)).unwrap();
        let interfaces = self
            .interfaces
            .iter()
            .map(|interface| constants.get_class(&internal(interface)).unwrap())
            .collect();

        let super_internal = internal(&self.super_name);
        let mut methods = vec![];
        for method in self.methods {
            let mut attributes = vec![];
            let elements = match method.body {
                Body::Given(elements) => Some(elements),
                Body::Constructor => {
                    let super_init = constants
                        .get_method_ref(&super_internal, "<init>", "()V", false)
                        .unwrap()
                        .0;
                    Some(vec![
                        Instruction::Local(ALOAD, 0).into(),
                        Instruction::Invoke(INVOKESPECIAL, super_init).into(),
                        Instruction::Simple(RETURN).into(),
                    ])
                }
                Body::Missing => None,
            };
            if let Some(elements) = elements {
                let mut body = MethodBody::new(0);
                body.elements = elements;
                let context = MethodContext {
                    class_name: BinaryName::from_string(internal(&self.name)).unwrap(),
                    method_name: UnqualifiedName::from_string(method.name.clone()).unwrap(),
                    descriptor: MethodDescriptor::parse(&method.descriptor).unwrap(),
                    is_static: method.access.contains(MethodAccessFlags::STATIC),
                };
                let code: Code = body
                    .encode(&context, &mut constants, &ObjectHierarchy, true)
                    .unwrap();
                attributes.push(constants.get_attribute(code).unwrap());
            }
            if !method.exceptions.is_empty() {
                let exceptions = method
                    .exceptions
                    .iter()
                    .map(|exception| constants.get_class(&internal(exception)).unwrap())
                    .collect();
                attributes.push(constants.get_attribute(Exceptions(exceptions)).unwrap());
            }
            if !method.annotations.is_empty() {
                let annotations = annotation_attribute(&mut constants, &method.annotations);
                attributes.push(constants.get_attribute(annotations).unwrap());
            }
            methods.push(Method {
                access_flags: method.access,
                name_index: constants.get_utf8(method.name.as_str()).unwrap(),
                descriptor_index: constants.get_utf8(method.descriptor.as_str()).unwrap(),
                attributes,
            });
        }

        let mut attributes = vec![];
        if !self.annotations.is_empty() {
            let annotations = annotation_attribute(&mut constants, &self.annotations);
            attributes.push(constants.get_attribute(annotations).unwrap());
        }

        ClassFile {
            version: Version::JAVA8,
            constants,
            access_flags: self.access,
            this_class,
            super_class,
            interfaces,
            fields: vec![],
            methods,
            attributes,
        }
        .to_bytes()
        .unwrap()
    }
}

fn annotation_attribute(constants: &mut ConstantPool, names: &[String]) -> RuntimeVisibleAnnotations {
    RuntimeVisibleAnnotations(
        names
            .iter()
            .map(|name| constants.get_utf8(descriptor_of(name)).unwrap())
            .collect(),
    )
}

/// Body doing nothing but returning zero, `false`, or `null`
fn default_body(descriptor: &str) -> Vec<CodeElement> {
    let parsed: MethodDescriptor<BinaryName> = MethodDescriptor::parse(descriptor).unwrap();
    let ret = match parsed.return_type {
        None => vec![Instruction::Simple(RETURN)],
        Some(FieldType::Base(base)) => {
            use jvm_sandbox::jvm::BaseType;
            match base {
                BaseType::Long => vec![Instruction::Simple(LCONST_0), Instruction::Simple(LRETURN)],
                BaseType::Float => vec![Instruction::Simple(FCONST_0), Instruction::Simple(FRETURN)],
                BaseType::Double => {
                    vec![Instruction::Simple(DCONST_0), Instruction::Simple(DRETURN)]
                }
                _ => vec![Instruction::Simple(ICONST_0), Instruction::Simple(IRETURN)],
            }
        }
        Some(FieldType::Ref(_)) => vec![
            Instruction::Simple(ACONST_NULL),
            Instruction::Simple(ARETURN),
        ],
    };
    ret.into_iter().map(CodeElement::from).collect()
}

/// `demo.Calc` with a constructor, `static int add(int, int)`, `static int sum(int[])`, and a
/// native `int hash()`
pub fn calc_class() -> Vec<u8> {
    ClassBuilder::class("demo.Calc")
        .constructor()
        .method_with(
            "add",
            "(II)I",
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            vec![
                CodeElement::Line(7),
                Instruction::Local(ILOAD, 0).into(),
                Instruction::Local(ILOAD, 1).into(),
                Instruction::Simple(IADD).into(),
                Instruction::Simple(IRETURN).into(),
            ],
        )
        .method(
            "sum",
            "([I)I",
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
        )
        .bodiless(
            "hash",
            "()I",
            MethodAccessFlags::PUBLIC | MethodAccessFlags::NATIVE,
        )
        .build()
}

/// Runtime holding a fixed set of classes, all of them loaded
///
/// Classes loaded by a loader are visible from that loader only. Root loaded classes are visible
/// from everywhere. Retransforming runs the registered transformers over the original bytes.
#[derive(Default)]
pub struct MockHost {
    classes: Mutex<BTreeMap<String, (Option<LoaderId>, Vec<u8>)>>,
    not_linkable: Mutex<BTreeSet<String>>,
    stealth: Mutex<BTreeSet<LoaderId>>,
    transformers: Mutex<Vec<(u32, Arc<dyn ClassTransformer>)>>,
    transformed: Mutex<BTreeMap<String, Vec<u8>>>,
    retransform_calls: AtomicUsize,
    bridge_hidden: Mutex<BTreeSet<LoaderId>>,
}

impl MockHost {
    pub fn new() -> MockHost {
        MockHost::default()
    }

    /// Load a class (the name is taken from the class file)
    pub fn load(&self, loader: Option<LoaderId>, bytes: Vec<u8>) -> &MockHost {
        let name = read_type_metadata(loader, &bytes).unwrap().name;
        self.classes.lock().insert(name, (loader, bytes));
        self
    }

    /// Reflection on this type fails as if it couldn't be linked yet
    pub fn not_linkable(&self, name: &str) -> &MockHost {
        self.not_linkable.lock().insert(String::from(name));
        self
    }

    pub fn stealth(&self, loader: LoaderId) -> &MockHost {
        self.stealth.lock().insert(loader);
        self
    }

    pub fn hide_bridge_from(&self, loader: LoaderId) -> &MockHost {
        self.bridge_hidden.lock().insert(loader);
        self
    }

    /// Bytes the last retransformation of a type ended up with
    pub fn current_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.transformed.lock().get(name).cloned()
    }

    pub fn original_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.classes.lock().get(name).map(|(_, bytes)| bytes.clone())
    }

    pub fn retransform_calls(&self) -> usize {
        self.retransform_calls.load(Ordering::SeqCst)
    }

    pub fn transformer_count(&self) -> usize {
        self.transformers.lock().len()
    }

    fn visible(&self, loader: Option<LoaderId>, name: &str) -> Option<(Option<LoaderId>, Vec<u8>)> {
        let classes = self.classes.lock();
        let (defining, bytes) = classes.get(name)?;
        if defining.is_none() || *defining == loader {
            Some((*defining, bytes.clone()))
        } else {
            None
        }
    }
}

impl HostRuntime for MockHost {
    fn loaded_types(&self) -> Vec<LoadedType> {
        self.classes
            .lock()
            .iter()
            .map(|(name, (loader, _))| LoadedType::new(name.clone(), *loader))
            .collect()
    }

    fn retransform(&self, types: &[LoadedType]) -> Result<(), HostError> {
        self.retransform_calls.fetch_add(1, Ordering::SeqCst);
        let transformers = self.transformers.lock().clone();
        for loaded in types {
            let mut bytes = self
                .original_bytes(&loaded.name)
                .ok_or_else(|| HostError::TypeNotFound(loaded.name.clone()))?;
            for (_, transformer) in &transformers {
                if let Some(woven) =
                    transformer.transform(loaded.loader, &loaded.internal_name(), true, &bytes)
                {
                    bytes = woven;
                }
            }
            self.transformed.lock().insert(loaded.name.clone(), bytes);
        }
        Ok(())
    }

    fn find_resource(&self, loader: Option<LoaderId>, path: &str) -> Option<ClassResource> {
        let name = path.strip_suffix(".class")?.replace('/', ".");
        self.visible(loader, &name)
            .map(|(loader, bytes)| ClassResource { loader, bytes })
    }

    fn live_metadata(
        &self,
        loader: Option<LoaderId>,
        name: &str,
    ) -> Result<TypeMetadata, HostError> {
        if self.not_linkable.lock().contains(name) {
            return Err(HostError::NotLinkable(String::from(name)));
        }
        let (defining, bytes) = self
            .visible(loader, name)
            .ok_or_else(|| HostError::TypeNotFound(String::from(name)))?;
        read_type_metadata(defining, &bytes).map_err(|err| HostError::Retransform(err.to_string()))
    }

    fn expose_bridge(&self, loader: Option<LoaderId>) -> bool {
        match loader {
            Some(loader) => !self.bridge_hidden.lock().contains(&loader),
            None => true,
        }
    }

    fn add_transformer(&self, id: u32, transformer: Arc<dyn ClassTransformer>) {
        self.transformers.lock().push((id, transformer));
    }

    fn remove_transformer(&self, id: u32) {
        self.transformers.lock().retain(|(existing, _)| *existing != id);
    }

    fn is_stealth_loader(&self, loader: Option<LoaderId>) -> bool {
        match loader {
            Some(loader) => self.stealth.lock().contains(&loader),
            None => false,
        }
    }

    fn supports_native_prefix(&self) -> bool {
        false
    }
}

/// Names of the static methods of the bridge class a woven method calls, in order
pub fn probes_called(bytes: &[u8], method_name: &str) -> Vec<String> {
    let class = ClassFile::from_bytes(bytes).unwrap();
    let method = class
        .methods
        .iter()
        .find(|method| method.name(&class.constants).unwrap() == method_name)
        .unwrap();
    let code = match method.code(&class.constants).unwrap() {
        Some(code) => code,
        None => return vec![],
    };
    let body = MethodBody::decode(&code, &class.constants).unwrap();
    body.instructions()
        .filter_map(|(_, insn)| match insn {
            Instruction::Invoke(INVOKESTATIC, index) => {
                let member = class.constants.member_ref(*index).unwrap();
                if member.owner == "java/sandbox/spy/Spy" {
                    Some(String::from(member.name))
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect()
}
