//! Rewriting class files so their methods report to the spy bridge
//!
//! Every selected method gets:
//!
//!   - an entry probe which reports the arguments and lets the listener replace them, return
//!     early, or throw
//!   - an exit probe before every `xreturn`
//!   - a handler around the whole body which reports exceptions on their way out
//!   - when asked for, probes on source lines and around every method call
//!
//! Injected snippets are bracketed by `iconst_2; pop` and `iconst_3; pop`. Weaving skips over
//! anything between those markers, so that a class woven for several watches at once doesn't
//! get probes around the probes of another watch.

mod hierarchy;
mod probes;

pub use hierarchy::*;

use crate::event::EventTypes;
use crate::host::LoaderId;
use crate::jvm::class_file::{Attribute, ClassFile};
use crate::jvm::code::MethodBody;
use crate::jvm::verifier::{MethodContext, TypeHierarchy};
use crate::jvm::{BinaryName, Error, MethodAccessFlags, Name, RenderJavaName, UnqualifiedName};
use crate::spy::BridgeNames;
use crate::structure::{parse_method_descriptor, signature_code};
use probes::ProbeSite;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// What to weave into one class, on behalf of one watch
#[derive(Debug, Clone)]
pub struct WeaveRequest {
    pub namespace: String,
    pub listener_id: i32,

    /// Loader defining the class being woven
    pub loader: Option<LoaderId>,
    pub event_types: EventTypes,

    /// Behaviors to instrument, as signature codes (`com.example.Calc#add(int,int)`)
    pub signature_codes: BTreeSet<String>,
}

/// Class bytes after weaving
#[derive(Debug, Clone)]
pub struct Woven {
    pub bytes: Vec<u8>,

    /// Signature codes of the behaviors that got probes
    pub behaviors: Vec<String>,
}

#[derive(Debug)]
pub enum WeaveError {
    /// The class file itself is unreadable or could not be written back
    Class(Error),

    /// One of the selected methods could not be rewritten
    Method { signature_code: String, error: Error },
}

impl Display for WeaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WeaveError::Class(error) => write!(f, "cannot weave class: {}", error),
            WeaveError::Method {
                signature_code,
                error,
            } => write!(f, "cannot weave {}: {}", signature_code, error),
        }
    }
}

impl std::error::Error for WeaveError {}

impl From<Error> for WeaveError {
    fn from(error: Error) -> WeaveError {
        WeaveError::Class(error)
    }
}

/// Stateless class rewriter
#[derive(Debug, Clone, Default)]
pub struct Weaver {
    bridge: BridgeNames,
}

impl Weaver {
    pub fn new(bridge: BridgeNames) -> Weaver {
        Weaver { bridge }
    }

    pub fn bridge(&self) -> &BridgeNames {
        &self.bridge
    }

    /// Weave probes into the requested behaviors of a class
    ///
    /// Returns `None` when none of the requested behaviors has a body which could be woven, in
    /// which case the class should be left as it was.
    pub fn weave(
        &self,
        bytes: &[u8],
        request: &WeaveRequest,
        hierarchy: &dyn TypeHierarchy,
    ) -> Result<Option<Woven>, WeaveError> {
        let mut class = ClassFile::from_bytes(bytes)?;
        let class_name = BinaryName::from_string(String::from(class.this_class_name()?))
            .map_err(Error::BadDescriptor)?;
        let java_class_name = class_name.to_java_name();
        let compute_frames = class.version.requires_stack_map_frames();

        let mut behaviors = vec![];
        for method_idx in 0..class.methods.len() {
            let method = &class.methods[method_idx];
            let access = method.access_flags;
            if access.intersects(MethodAccessFlags::ABSTRACT | MethodAccessFlags::NATIVE) {
                continue;
            }
            let method_name = String::from(method.name(&class.constants)?);
            if method_name == UnqualifiedName::CLINIT.as_str() {
                continue;
            }
            let descriptor_str = String::from(method.descriptor(&class.constants)?);
            let descriptor = parse_method_descriptor(&descriptor_str)?;
            let parameter_names: Vec<String> = descriptor
                .parameters
                .iter()
                .map(RenderJavaName::java_name)
                .collect();
            let code = signature_code(&java_class_name, &method_name, &parameter_names);
            if !request.signature_codes.contains(&code) {
                continue;
            }

            let method_error = |error: Error| WeaveError::Method {
                signature_code: code.clone(),
                error,
            };
            let original = match method.code(&class.constants).map_err(method_error)? {
                Some(original) => original,
                None => continue,
            };
            let body = MethodBody::decode(&original, &class.constants).map_err(method_error)?;

            let is_static = access.contains(MethodAccessFlags::STATIC);
            let site = ProbeSite {
                bridge: &self.bridge,
                namespace: &request.namespace,
                listener_id: request.listener_id,
                loader_id: request.loader.unwrap_or(0),
                event_types: request.event_types,
                class_name: &java_class_name,
                method_name: &method_name,
                descriptor_str: &descriptor_str,
                descriptor: &descriptor,
                is_static,
                is_constructor: method_name == UnqualifiedName::INIT.as_str(),
            };
            let body = match probes::weave_body(&site, body, &mut class.constants)
                .map_err(method_error)?
            {
                Some(body) => body,
                None => {
                    log::warn!("Skipping {}: no call to a super constructor found", code);
                    continue;
                }
            };

            let context = MethodContext {
                class_name: class_name.clone(),
                method_name: UnqualifiedName::from_string(method_name.clone())
                    .map_err(|msg| method_error(Error::BadDescriptor(msg)))?,
                descriptor,
                is_static,
            };
            let woven = body
                .encode(&context, &mut class.constants, hierarchy, compute_frames)
                .map_err(method_error)?;
            let attribute = class
                .constants
                .get_attribute(woven)
                .map_err(method_error)?;
            replace_code(&mut class, method_idx, attribute);
            behaviors.push(code);
        }

        if behaviors.is_empty() {
            return Ok(None);
        }
        log::debug!(
            "Wove {} behavior(s) of {} for listener {}",
            behaviors.len(),
            java_class_name,
            request.listener_id
        );
        Ok(Some(Woven {
            bytes: class.to_bytes()?,
            behaviors,
        }))
    }
}

fn replace_code(class: &mut ClassFile, method_idx: usize, code: Attribute) {
    let constants = &class.constants;
    let attributes = &mut class.methods[method_idx].attributes;
    match attributes
        .iter_mut()
        .find(|attribute| attribute.is_named(constants, "Code"))
    {
        Some(existing) => *existing = code,
        None => attributes.push(code),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{
        ClassConstantIndex, Code, ConstantIndex, ConstantPool, Method, Version,
    };
    use crate::jvm::code::opcodes::*;
    use crate::jvm::code::{CodeElement, Instruction};
    use crate::jvm::verifier::ObjectHierarchy;
    use crate::jvm::{ClassAccessFlags, ParseDescriptor};

    /// `demo.Calc` with a constructor, `static int add(int, int)`, and `String show()`
    fn calc_class() -> Vec<u8> {
        let mut constants = ConstantPool::new();
        let this_class = constants.get_class("demo/Calc").unwrap();
        let super_class = constants.get_class("java/lang/Object").unwrap();
        let object_init = constants
            .get_method_ref("java/lang/Object", "<init>", "()V", false)
            .unwrap()
            .0;
        let to_string = constants
            .get_method_ref("java/lang/Object", "toString", "()Ljava/lang/String;", false)
            .unwrap()
            .0;

        let mut methods = vec![];
        let mut method = |name: &str,
                          descriptor: &str,
                          access: MethodAccessFlags,
                          elements: Vec<CodeElement>,
                          constants: &mut ConstantPool| {
            let mut body = MethodBody::new(0);
            body.elements = elements;
            let context = MethodContext {
                class_name: BinaryName::from_string(String::from("demo/Calc")).unwrap(),
                method_name: UnqualifiedName::from_string(String::from(name)).unwrap(),
                descriptor: crate::jvm::MethodDescriptor::parse(descriptor).unwrap(),
                is_static: access.contains(MethodAccessFlags::STATIC),
            };
            let code: Code = body
                .encode(&context, constants, &ObjectHierarchy, true)
                .unwrap();
            methods.push(Method {
                access_flags: access,
                name_index: constants.get_utf8(name).unwrap(),
                descriptor_index: constants.get_utf8(descriptor).unwrap(),
                attributes: vec![constants.get_attribute(code).unwrap()],
            });
        };

        method(
            "<init>",
            "()V",
            MethodAccessFlags::PUBLIC,
            vec![
                Instruction::Local(ALOAD, 0).into(),
                Instruction::Invoke(INVOKESPECIAL, object_init).into(),
                Instruction::Simple(RETURN).into(),
            ],
            &mut constants,
        );
        method(
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
            &mut constants,
        );
        method(
            "show",
            "()Ljava/lang/String;",
            MethodAccessFlags::PUBLIC,
            vec![
                CodeElement::Line(12),
                Instruction::Local(ALOAD, 0).into(),
                Instruction::Invoke(INVOKEVIRTUAL, to_string).into(),
                Instruction::Simple(ARETURN).into(),
            ],
            &mut constants,
        );

        let class = ClassFile {
            version: Version::JAVA8,
            constants,
            access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods,
            attributes: vec![],
        };
        class.to_bytes().unwrap()
    }

    fn request(event_types: EventTypes, codes: &[&str]) -> WeaveRequest {
        WeaveRequest {
            namespace: String::from("default"),
            listener_id: 1000,
            loader: Some(1),
            event_types,
            signature_codes: codes.iter().map(|code| String::from(*code)).collect(),
        }
    }

    fn woven_body(bytes: &[u8], name: &str) -> (MethodBody, Code, ConstantPool) {
        let class = ClassFile::from_bytes(bytes).unwrap();
        let method = class
            .methods
            .iter()
            .find(|method| method.name(&class.constants).unwrap() == name)
            .unwrap();
        let code = method.code(&class.constants).unwrap().unwrap();
        let body = MethodBody::decode(&code, &class.constants).unwrap();
        (body, code, class.constants)
    }

    fn probes_called(body: &MethodBody, constants: &ConstantPool) -> Vec<String> {
        body.instructions()
            .filter_map(|(_, insn)| match insn {
                Instruction::Invoke(INVOKESTATIC, index) => {
                    let member = constants.member_ref(*index).unwrap();
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

    fn throwable_handler_is_last(code: &Code, constants: &ConstantPool) -> bool {
        let last = code.exception_table.last().unwrap();
        constants.class_name(last.catch_type).unwrap() == "java/lang/Throwable"
    }

    #[test]
    fn unselected_classes_are_left_alone() {
        let weaver = Weaver::default();
        let request = request(EventTypes::all(), &["demo.Calc#sub(int,int)"]);
        let woven = weaver
            .weave(&calc_class(), &request, &ObjectHierarchy)
            .unwrap();
        assert!(woven.is_none());
    }

    #[test]
    fn entry_and_exits_are_probed() {
        let weaver = Weaver::default();
        let request = request(
            EventTypes::BEFORE | EventTypes::RETURN | EventTypes::THROWS,
            &["demo.Calc#add(int,int)"],
        );
        let woven = weaver
            .weave(&calc_class(), &request, &ObjectHierarchy)
            .unwrap()
            .unwrap();
        assert_eq!(woven.behaviors, vec!["demo.Calc#add(int,int)"]);

        let (body, code, constants) = woven_body(&woven.bytes, "add");
        assert_eq!(
            probes_called(&body, &constants),
            vec!["spyMethodOnBefore", "spyMethodOnReturn", "spyMethodOnThrows"]
        );
        assert!(throwable_handler_is_last(&code, &constants));

        // Arguments are read into the array and written back
        assert!(body
            .instructions()
            .any(|(_, insn)| *insn == Instruction::Local(ISTORE, 1)));

        // Untouched methods keep their code
        let (show, _, _) = woven_body(&woven.bytes, "show");
        assert_eq!(show.instructions().count(), 3);
    }

    #[test]
    fn lines_and_calls_are_probed() {
        let weaver = Weaver::default();
        let request = request(
            EventTypes::LINE | EventTypes::CALLS,
            &["demo.Calc#show()"],
        );
        let woven = weaver
            .weave(&calc_class(), &request, &ObjectHierarchy)
            .unwrap()
            .unwrap();
        let (body, code, constants) = woven_body(&woven.bytes, "show");
        assert_eq!(
            probes_called(&body, &constants),
            vec![
                "spyMethodOnBefore",
                "spyMethodOnLine",
                "spyMethodOnCallBefore",
                "spyMethodOnCallReturn",
                "spyMethodOnCallThrows",
                "spyMethodOnReturn",
                "spyMethodOnThrows",
            ]
        );

        // Handler around the call first, whole-method handler last
        assert_eq!(code.exception_table.len(), 2);
        assert_eq!(code.exception_table[0].catch_type, ClassConstantIndex(ConstantIndex(0)));
        assert!(throwable_handler_is_last(&code, &constants));
    }

    #[test]
    fn constructors_are_probed_after_the_super_call() {
        let weaver = Weaver::default();
        let request = request(EventTypes::BEFORE | EventTypes::CALLS, &["demo.Calc#<init>()"]);
        let woven = weaver
            .weave(&calc_class(), &request, &ObjectHierarchy)
            .unwrap()
            .unwrap();
        let (body, code, constants) = woven_body(&woven.bytes, "<init>");

        let instructions: Vec<&Instruction> = body.instructions().map(|(_, insn)| insn).collect();
        assert_eq!(instructions[0], &Instruction::Local(ALOAD, 0));
        assert!(matches!(instructions[1], Instruction::Invoke(INVOKESPECIAL, _)));

        // The super call happens before the body starts, so it is not a probed call
        let probes = probes_called(&body, &constants);
        assert_eq!(probes[0], "spyMethodOnBefore");
        assert!(!probes.iter().any(|probe| probe == "spyMethodOnCallBefore"));
        assert_eq!(code.exception_table.len(), 1);
    }

    #[test]
    fn weaving_twice_stacks_probes() {
        let weaver = Weaver::default();
        let first = request(EventTypes::all(), &["demo.Calc#show()"]);
        let mut second = first.clone();
        second.listener_id = 1001;

        let once = weaver
            .weave(&calc_class(), &first, &ObjectHierarchy)
            .unwrap()
            .unwrap();
        let twice = weaver
            .weave(&once.bytes, &second, &ObjectHierarchy)
            .unwrap()
            .unwrap();

        let (once_body, _, once_constants) = woven_body(&once.bytes, "show");
        let (twice_body, twice_code, twice_constants) = woven_body(&twice.bytes, "show");
        let once_probes = probes_called(&once_body, &once_constants);
        let twice_probes = probes_called(&twice_body, &twice_constants);

        // The second pass doesn't probe the calls made by the first pass's probes
        assert_eq!(twice_probes.len(), 2 * once_probes.len());
        assert!(throwable_handler_is_last(&twice_code, &twice_constants));
    }
}
