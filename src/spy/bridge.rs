use crate::jvm::class_file::{ClassFile, ConstantPool, ConstantValue, Field, Method, Version};
use crate::jvm::code::opcodes::*;
use crate::jvm::code::{Instruction, MethodBody};
use crate::jvm::verifier::{MethodContext, ObjectHierarchy};
use crate::jvm::{
    BinaryName, ClassAccessFlags, Error, FieldAccessFlags, MethodAccessFlags, MethodDescriptor,
    Name, ParseDescriptor, UnqualifiedName,
};

const BRIDGE_CLASS_ACCESS: ClassAccessFlags = ClassAccessFlags::from_bits_truncate(
    ClassAccessFlags::PUBLIC.bits()
        | ClassAccessFlags::FINAL.bits()
        | ClassAccessFlags::SUPER.bits(),
);

/// The probe methods of the bridge class
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Probe {
    Before,
    Return,
    Throws,
    Line,
    CallBefore,
    CallReturn,
    CallThrows,
}

impl Probe {
    pub const ALL: [Probe; 7] = [
        Probe::Before,
        Probe::Return,
        Probe::Throws,
        Probe::Line,
        Probe::CallBefore,
        Probe::CallReturn,
        Probe::CallThrows,
    ];

    pub const fn method_name(&self) -> UnqualifiedName {
        match self {
            Probe::Before => UnqualifiedName::ON_BEFORE,
            Probe::Return => UnqualifiedName::ON_RETURN,
            Probe::Throws => UnqualifiedName::ON_THROWS,
            Probe::Line => UnqualifiedName::ON_LINE,
            Probe::CallBefore => UnqualifiedName::ON_CALL_BEFORE,
            Probe::CallReturn => UnqualifiedName::ON_CALL_RETURN,
            Probe::CallThrows => UnqualifiedName::ON_CALL_THROWS,
        }
    }

    /// Does the probe hand back a result object the woven code must branch on?
    pub const fn returns_ret(&self) -> bool {
        matches!(self, Probe::Before | Probe::Return | Probe::Throws)
    }
}

/// Names of the two bridge classes woven code calls into
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BridgeNames {
    pub spy: BinaryName,
    pub ret: BinaryName,
}

impl Default for BridgeNames {
    fn default() -> Self {
        BridgeNames {
            spy: BinaryName::SPY,
            ret: BinaryName::SPY_RET,
        }
    }
}

impl BridgeNames {
    pub const DEFAULT_SPY_CLASS: &'static str = "java.sandbox.spy.Spy";

    /// Bridge names from the Java name of the probe class (eg. `java.sandbox.spy.Spy`)
    pub fn from_java_name(spy_class: &str) -> Result<BridgeNames, String> {
        let spy = BinaryName::from_java_name(spy_class)?;
        let ret = BinaryName::from_string(format!("{}$Ret", spy.as_str()))?;
        Ok(BridgeNames { spy, ret })
    }

    /// Java package of the bridge classes, with a trailing dot (empty for the default package)
    pub fn java_package(&self) -> String {
        let java_name = self.spy.to_java_name();
        match java_name.rfind('.') {
            Some(idx) => String::from(&java_name[..=idx]),
            None => String::new(),
        }
    }

    /// Descriptor of a probe method
    pub fn descriptor(&self, probe: Probe) -> String {
        let ret = format!("L{};", self.ret.as_str());
        match probe {
            Probe::Before => format!(
                "([Ljava/lang/Object;Ljava/lang/String;IILjava/lang/String;Ljava/lang/String;\
                 Ljava/lang/String;Ljava/lang/Object;){}",
                ret
            ),
            Probe::Return => format!("(Ljava/lang/Object;Ljava/lang/String;I){}", ret),
            Probe::Throws => format!("(Ljava/lang/Throwable;Ljava/lang/String;I){}", ret),
            Probe::Line => String::from("(ILjava/lang/String;I)V"),
            Probe::CallBefore => String::from(
                "(ILjava/lang/String;Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;I)V",
            ),
            Probe::CallReturn => String::from("(Ljava/lang/String;I)V"),
            Probe::CallThrows => String::from("(Ljava/lang/String;Ljava/lang/String;I)V"),
        }
    }

    /// Descriptor of the result object's constructor
    pub const RET_INIT_DESCRIPTOR: &'static str = "(ILjava/lang/Object;)V";

    /// Generate the class files for both bridge classes
    ///
    /// These are meant to be defined by the root loader, so every loader sees them. Probe methods
    /// are `native`: the host binds them to [`super::SpyRegistry`].
    pub fn generate(&self) -> Result<Vec<(BinaryName, Vec<u8>)>, Error> {
        Ok(vec![
            (self.spy.clone(), self.spy_class()?.to_bytes()?),
            (self.ret.clone(), self.ret_class()?.to_bytes()?),
        ])
    }

    fn spy_class(&self) -> Result<ClassFile, Error> {
        let mut constants = ConstantPool::new();
        let this_class = constants.get_class(self.spy.as_str())?;
        let super_class = constants.get_class(BinaryName::OBJECT.as_str())?;

        let mut methods = vec![];
        for probe in Probe::ALL {
            let name = probe.method_name();
            methods.push(Method {
                access_flags: MethodAccessFlags::PUBLIC
                    | MethodAccessFlags::STATIC
                    | MethodAccessFlags::NATIVE,
                name_index: constants.get_utf8(name.as_str())?,
                descriptor_index: constants.get_utf8(self.descriptor(probe))?,
                attributes: vec![],
            });
        }

        Ok(ClassFile {
            version: Version::JAVA8,
            constants,
            access_flags: BRIDGE_CLASS_ACCESS,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods,
            attributes: vec![],
        })
    }

    fn ret_class(&self) -> Result<ClassFile, Error> {
        let mut constants = ConstantPool::new();
        let this_class = constants.get_class(self.ret.as_str())?;
        let super_class = constants.get_class(BinaryName::OBJECT.as_str())?;

        let mut fields = vec![];
        for (name, value) in [
            ("STATE_NONE", crate::spy::Ret::STATE_NONE),
            ("STATE_RETURN", crate::spy::Ret::STATE_RETURN),
            ("STATE_THROWS", crate::spy::Ret::STATE_THROWS),
        ] {
            let initial = constants.get_integer(value)?;
            fields.push(Field {
                access_flags: FieldAccessFlags::PUBLIC
                    | FieldAccessFlags::STATIC
                    | FieldAccessFlags::FINAL,
                name_index: constants.get_utf8(name)?,
                descriptor_index: constants.get_utf8("I")?,
                attributes: vec![constants.get_attribute(ConstantValue(initial))?],
            });
        }
        fields.push(Field {
            access_flags: FieldAccessFlags::PUBLIC | FieldAccessFlags::FINAL,
            name_index: constants.get_utf8(UnqualifiedName::STATE.as_str())?,
            descriptor_index: constants.get_utf8("I")?,
            attributes: vec![],
        });
        fields.push(Field {
            access_flags: FieldAccessFlags::PUBLIC | FieldAccessFlags::FINAL,
            name_index: constants.get_utf8(UnqualifiedName::RESPOND.as_str())?,
            descriptor_index: constants.get_utf8("Ljava/lang/Object;")?,
            attributes: vec![],
        });

        let init = self.ret_init(&mut constants)?;

        Ok(ClassFile {
            version: Version::JAVA8,
            constants,
            access_flags: BRIDGE_CLASS_ACCESS,
            this_class,
            super_class,
            interfaces: vec![],
            fields,
            methods: vec![init],
            attributes: vec![],
        })
    }

    /// `public Ret(int state, Object respond)`
    fn ret_init(&self, constants: &mut ConstantPool) -> Result<Method, Error> {
        let object_init = constants.get_method_ref(
            BinaryName::OBJECT.as_str(),
            UnqualifiedName::INIT.as_str(),
            "()V",
            false,
        )?;
        let state = constants.get_field_ref(
            self.ret.as_str(),
            UnqualifiedName::STATE.as_str(),
            "I",
        )?;
        let respond = constants.get_field_ref(
            self.ret.as_str(),
            UnqualifiedName::RESPOND.as_str(),
            "Ljava/lang/Object;",
        )?;

        let mut body = MethodBody::new(3);
        body.push(Instruction::Local(ALOAD, 0));
        body.push(Instruction::Invoke(INVOKESPECIAL, object_init.0));
        body.push(Instruction::Local(ALOAD, 0));
        body.push(Instruction::Local(ILOAD, 1));
        body.push(Instruction::Field(PUTFIELD, state.0));
        body.push(Instruction::Local(ALOAD, 0));
        body.push(Instruction::Local(ALOAD, 2));
        body.push(Instruction::Field(PUTFIELD, respond.0));
        body.push(Instruction::Simple(RETURN));

        let descriptor = MethodDescriptor::parse(BridgeNames::RET_INIT_DESCRIPTOR)
            .map_err(|_| Error::BadDescriptor(String::from(BridgeNames::RET_INIT_DESCRIPTOR)))?;
        let context = MethodContext {
            class_name: self.ret.clone(),
            method_name: UnqualifiedName::INIT,
            descriptor,
            is_static: false,
        };
        let code = body.encode(&context, constants, &ObjectHierarchy, true)?;

        Ok(Method {
            access_flags: MethodAccessFlags::PUBLIC,
            name_index: constants.get_utf8(UnqualifiedName::INIT.as_str())?,
            descriptor_index: constants.get_utf8(BridgeNames::RET_INIT_DESCRIPTOR)?,
            attributes: vec![constants.get_attribute(code)?],
        })
    }
}

/// Find a field's `ConstantValue`, if it has one
#[cfg(test)]
fn constant_value(field: &Field, constants: &ConstantPool) -> Option<i32> {
    use crate::jvm::class_file::{Attribute, Constant};
    let ConstantValue(index) = Attribute::find::<ConstantValue>(&field.attributes, constants)
        .ok()
        .flatten()?;
    match constants.get(index).ok()? {
        Constant::Integer(value) => Some(*value),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::RenderDescriptor;

    #[test]
    fn custom_bridge_names() {
        let names = BridgeNames::from_java_name("com.acme.agent.Probe").unwrap();
        assert_eq!(names.spy.as_str(), "com/acme/agent/Probe");
        assert_eq!(names.ret.as_str(), "com/acme/agent/Probe$Ret");
        assert_eq!(names.java_package(), "com.acme.agent.");
        assert_eq!(
            BridgeNames::from_java_name(BridgeNames::DEFAULT_SPY_CLASS).unwrap(),
            BridgeNames::default()
        );
    }

    #[test]
    fn probe_descriptors_parse() {
        let names = BridgeNames::default();
        for probe in Probe::ALL {
            let descriptor = names.descriptor(probe);
            let parsed: MethodDescriptor<BinaryName> = MethodDescriptor::parse(&descriptor).unwrap();
            assert_eq!(parsed.render(), descriptor);
            assert_eq!(parsed.return_type.is_some(), probe.returns_ret());
        }
        let before = MethodDescriptor::<BinaryName>::parse(&names.descriptor(Probe::Before)).unwrap();
        assert_eq!(before.parameters.len(), 8);
    }

    #[test]
    fn generated_classes_parse_back() {
        let names = BridgeNames::default();
        let classes = names.generate().unwrap();
        assert_eq!(classes.len(), 2);

        let spy = ClassFile::from_bytes(&classes[0].1).unwrap();
        assert_eq!(spy.this_class_name().unwrap(), "java/sandbox/spy/Spy");
        assert_eq!(spy.methods.len(), 7);
        for method in &spy.methods {
            assert!(method.access_flags.contains(MethodAccessFlags::NATIVE));
            assert!(method.code(&spy.constants).unwrap().is_none());
        }

        let ret = ClassFile::from_bytes(&classes[1].1).unwrap();
        assert_eq!(ret.this_class_name().unwrap(), "java/sandbox/spy/Spy$Ret");
        let states: Vec<Option<i32>> = ret
            .fields
            .iter()
            .map(|field| constant_value(field, &ret.constants))
            .collect();
        assert_eq!(states, vec![Some(0), Some(1), Some(2), None, None]);
        let init = ret.methods[0].code(&ret.constants).unwrap().unwrap();
        assert_eq!(init.max_locals, 3);
        assert_eq!(init.max_stack, 2);
    }
}
