use crate::event::{EventType, EventTypes};
use crate::jvm::class_file::ConstantPool;
use crate::jvm::code::opcodes::*;
use crate::jvm::code::{BranchInstruction, CodeElement, Handler, Instruction, Label, MethodBody};
use crate::jvm::{
    BaseType, BinaryName, Error, FieldType, MethodDescriptor, Name, RenderDescriptor, UnqualifiedName,
};
use crate::spy::{BridgeNames, Probe};
use crate::util::Width;

/// Everything the injected code needs to know about the method and the watch
pub(super) struct ProbeSite<'a> {
    pub bridge: &'a BridgeNames,
    pub namespace: &'a str,
    pub listener_id: i32,
    pub loader_id: i32,
    pub event_types: EventTypes,

    /// Java name of the class (eg. `com.example.Calc`)
    pub class_name: &'a str,
    pub method_name: &'a str,
    pub descriptor_str: &'a str,
    pub descriptor: &'a MethodDescriptor<BinaryName>,
    pub is_static: bool,
    pub is_constructor: bool,
}

/// Builds injected code into a growing list of elements
struct Emitter<'a, 'b> {
    site: &'b ProbeSite<'a>,
    constants: &'b mut ConstantPool,
    elements: Vec<CodeElement>,
}

impl<'a, 'b> Emitter<'a, 'b> {
    fn insn(&mut self, insn: Instruction) {
        self.elements.push(CodeElement::Insn(insn));
    }

    fn simple(&mut self, op: u8) {
        self.insn(Instruction::Simple(op));
    }

    fn label(&mut self, label: Label) {
        self.elements.push(CodeElement::Label(label));
    }

    /// Start of injected code (`iconst_2; pop`)
    fn lock(&mut self) {
        self.simple(ICONST_2);
        self.simple(POP);
    }

    /// End of injected code (`iconst_3; pop`)
    fn unlock(&mut self) {
        self.simple(ICONST_3);
        self.simple(POP);
    }

    fn push_int(&mut self, value: i32) -> Result<(), Error> {
        let insn = match value {
            -1..=5 => Instruction::Simple((ICONST_0 as i32 + value) as u8),
            -128..=127 => Instruction::BiPush(value as i8),
            -32768..=32767 => Instruction::SiPush(value as i16),
            _ => Instruction::Ldc(self.constants.get_integer(value)?),
        };
        self.insn(insn);
        Ok(())
    }

    fn push_string(&mut self, value: &str) -> Result<(), Error> {
        let index = self.constants.get_string(value)?;
        self.insn(Instruction::Ldc(index.0));
        Ok(())
    }

    /// Namespace then listener id, the trailing arguments of every probe
    fn push_watch(&mut self) -> Result<(), Error> {
        let namespace = self.site.namespace;
        self.push_string(namespace)?;
        self.push_int(self.site.listener_id)
    }

    fn invoke_probe(&mut self, probe: Probe) -> Result<(), Error> {
        let bridge = self.site.bridge;
        let index = self.constants.get_method_ref(
            bridge.spy.as_str(),
            probe.method_name().as_str(),
            &bridge.descriptor(probe),
            false,
        )?;
        self.insn(Instruction::Invoke(INVOKESTATIC, index.0));
        Ok(())
    }

    fn invoke(
        &mut self,
        op: u8,
        owner: &BinaryName,
        name: &UnqualifiedName,
        descriptor: &str,
    ) -> Result<(), Error> {
        let index = self
            .constants
            .get_method_ref(owner.as_str(), name.as_str(), descriptor, false)?;
        self.insn(Instruction::Invoke(op, index.0));
        Ok(())
    }

    fn checkcast(&mut self, class: &str) -> Result<(), Error> {
        let index = self.constants.get_class(class)?;
        self.insn(Instruction::Type(CHECKCAST, index));
        Ok(())
    }

    fn ret_field(&mut self, name: &UnqualifiedName, descriptor: &str) -> Result<(), Error> {
        let index =
            self.constants
                .get_field_ref(self.site.bridge.ret.as_str(), name.as_str(), descriptor)?;
        self.insn(Instruction::Field(GETFIELD, index.0));
        Ok(())
    }

    /// Box the primitive on top of the stack (references are left alone)
    fn box_value(&mut self, typ: &FieldType<BinaryName>) -> Result<(), Error> {
        if let FieldType::Base(base) = typ {
            let boxed = base.boxed();
            let descriptor = format!("({})L{};", base.render(), boxed.as_str());
            self.invoke(INVOKESTATIC, &boxed, &UnqualifiedName::VALUEOF, &descriptor)?;
        }
        Ok(())
    }

    /// Turn the object on top of the stack into a value of the given type
    fn unbox_value(&mut self, typ: &FieldType<BinaryName>) -> Result<(), Error> {
        match typ {
            FieldType::Ref(ref_type) => self.checkcast(&ref_type.class_constant_name()),
            FieldType::Base(BaseType::Boolean) => {
                self.checkcast(BinaryName::BOOLEAN.as_str())?;
                let name = UnqualifiedName::BOOLEANVALUE;
                self.invoke(INVOKEVIRTUAL, &BinaryName::BOOLEAN, &name, "()Z")
            }
            FieldType::Base(BaseType::Char) => {
                self.checkcast(BinaryName::CHARACTER.as_str())?;
                let name = UnqualifiedName::CHARVALUE;
                self.invoke(INVOKEVIRTUAL, &BinaryName::CHARACTER, &name, "()C")
            }
            FieldType::Base(base) => {
                let name = match base {
                    BaseType::Byte => UnqualifiedName::BYTEVALUE,
                    BaseType::Short => UnqualifiedName::SHORTVALUE,
                    BaseType::Long => UnqualifiedName::LONGVALUE,
                    BaseType::Float => UnqualifiedName::FLOATVALUE,
                    BaseType::Double => UnqualifiedName::DOUBLEVALUE,
                    _ => UnqualifiedName::INTVALUE,
                };
                self.checkcast(BinaryName::NUMBER.as_str())?;
                let descriptor = format!("(){}", base.render());
                self.invoke(INVOKEVIRTUAL, &BinaryName::NUMBER, &name, &descriptor)
            }
        }
    }

    /// Local slots of the parameters, along with their types
    fn parameter_slots(&self) -> Vec<(u16, &'b FieldType<BinaryName>)> {
        let site: &'b ProbeSite<'a> = self.site;
        let mut slot: u16 = if site.is_static { 0 } else { 1 };
        let mut slots = vec![];
        for parameter in &site.descriptor.parameters {
            slots.push((slot, parameter));
            slot += parameter.width() as u16;
        }
        slots
    }

    /// `Object[]` holding the (boxed) arguments
    fn load_argument_array(&mut self) -> Result<(), Error> {
        let slots = self.parameter_slots();
        self.push_int(slots.len() as i32)?;
        let object = self.constants.get_class(BinaryName::OBJECT.as_str())?;
        self.insn(Instruction::Type(ANEWARRAY, object));
        for (idx, (slot, typ)) in slots.into_iter().enumerate() {
            self.simple(DUP);
            self.push_int(idx as i32)?;
            self.insn(Instruction::Local(load_opcode(typ), slot));
            self.box_value(typ)?;
            self.simple(AASTORE);
        }
        Ok(())
    }

    /// Copy every element of the `Object[]` on top of the stack back into the parameters
    fn store_argument_array(&mut self) -> Result<(), Error> {
        for (idx, (slot, typ)) in self.parameter_slots().into_iter().enumerate() {
            self.simple(DUP);
            self.push_int(idx as i32)?;
            self.simple(AALOAD);
            self.unbox_value(typ)?;
            self.insn(Instruction::Local(store_opcode(typ), slot));
        }
        Ok(())
    }

    /// Branch on the result object on top of the stack
    ///
    /// `RETURN` returns the result's value from the method, `THROWS` throws it, and anything else
    /// pops the result and falls through.
    fn process_control(&mut self, labels: &mut impl FnMut() -> Label) -> Result<(), Error> {
        let returns = labels();
        let throws = labels();
        let finish = labels();

        self.simple(DUP);
        self.ret_field(&UnqualifiedName::STATE, "I")?;
        self.simple(DUP);
        self.simple(ICONST_1);
        self.insn(Instruction::Branch(BranchInstruction::If(IF_ICMPEQ, returns)));
        self.simple(ICONST_2);
        self.insn(Instruction::Branch(BranchInstruction::If(IF_ICMPEQ, throws)));
        self.insn(Instruction::Branch(BranchInstruction::Goto(finish)));

        let site = self.site;
        self.label(returns);
        self.simple(POP);
        match &site.descriptor.return_type {
            None => {
                self.simple(POP);
                self.simple(RETURN);
            }
            Some(typ) => {
                self.ret_field(&UnqualifiedName::RESPOND, "Ljava/lang/Object;")?;
                self.unbox_value(typ)?;
                self.simple(return_opcode(typ));
            }
        }

        self.label(throws);
        self.ret_field(&UnqualifiedName::RESPOND, "Ljava/lang/Object;")?;
        self.checkcast(BinaryName::THROWABLE.as_str())?;
        self.simple(ATHROW);

        self.label(finish);
        self.simple(POP);
        Ok(())
    }

    /// Entry probe: report the arguments, write back what the listener changed, then branch
    fn entry(&mut self, labels: &mut impl FnMut() -> Label) -> Result<(), Error> {
        self.lock();
        self.load_argument_array()?;
        self.simple(DUP);
        self.push_watch()?;
        self.push_int(self.site.loader_id)?;
        let site = self.site;
        self.push_string(site.class_name)?;
        self.push_string(site.method_name)?;
        self.push_string(site.descriptor_str)?;
        if site.is_static || site.is_constructor {
            self.simple(ACONST_NULL);
        } else {
            self.insn(Instruction::Local(ALOAD, 0));
        }
        self.invoke_probe(Probe::Before)?;
        self.simple(SWAP);
        self.store_argument_array()?;
        self.simple(POP);
        self.process_control(labels)?;
        self.unlock();
        Ok(())
    }

    /// Normal exit probe, to be followed by the original return instruction
    fn exit(&mut self, labels: &mut impl FnMut() -> Label) -> Result<(), Error> {
        let site = self.site;
        self.lock();
        match &site.descriptor.return_type {
            None => self.simple(ACONST_NULL),
            Some(typ) => {
                self.simple(if typ.width() == 2 { DUP2 } else { DUP });
                self.box_value(typ)?;
            }
        }
        self.push_watch()?;
        self.invoke_probe(Probe::Return)?;
        self.process_control(labels)?;
        self.unlock();
        Ok(())
    }

    /// Exceptional exit probe, the body of the whole-method handler
    fn throws(&mut self, labels: &mut impl FnMut() -> Label) -> Result<(), Error> {
        self.lock();
        self.simple(DUP);
        self.push_watch()?;
        self.invoke_probe(Probe::Throws)?;
        self.process_control(labels)?;
        self.unlock();
        self.simple(ATHROW);
        Ok(())
    }

    fn line(&mut self, line: u16) -> Result<(), Error> {
        self.lock();
        self.push_int(line as i32)?;
        self.push_watch()?;
        self.invoke_probe(Probe::Line)?;
        self.unlock();
        Ok(())
    }

    fn call_before(&mut self, line: i32, owner: &str, name: &str, desc: &str) -> Result<(), Error> {
        self.lock();
        self.push_int(line)?;
        self.push_string(owner)?;
        self.push_string(name)?;
        self.push_string(desc)?;
        self.push_watch()?;
        self.invoke_probe(Probe::CallBefore)?;
        self.unlock();
        Ok(())
    }

    fn call_return(&mut self) -> Result<(), Error> {
        self.lock();
        self.push_watch()?;
        self.invoke_probe(Probe::CallReturn)?;
        self.unlock();
        Ok(())
    }

    /// Report the class of the exception on top of the stack, then rethrow it
    fn call_throws(&mut self) -> Result<(), Error> {
        self.lock();
        self.simple(DUP);
        let get_class = "()Ljava/lang/Class;";
        self.invoke(INVOKEVIRTUAL, &BinaryName::OBJECT, &UnqualifiedName::GETCLASS, get_class)?;
        let get_name = "()Ljava/lang/String;";
        self.invoke(INVOKEVIRTUAL, &BinaryName::CLASS, &UnqualifiedName::GETNAME, get_name)?;
        self.push_watch()?;
        self.invoke_probe(Probe::CallThrows)?;
        self.unlock();
        self.simple(ATHROW);
        Ok(())
    }
}

fn load_opcode(typ: &FieldType<BinaryName>) -> u8 {
    match typ {
        FieldType::Ref(_) => ALOAD,
        FieldType::Base(BaseType::Long) => LLOAD,
        FieldType::Base(BaseType::Float) => FLOAD,
        FieldType::Base(BaseType::Double) => DLOAD,
        FieldType::Base(_) => ILOAD,
    }
}

fn store_opcode(typ: &FieldType<BinaryName>) -> u8 {
    match typ {
        FieldType::Ref(_) => ASTORE,
        FieldType::Base(BaseType::Long) => LSTORE,
        FieldType::Base(BaseType::Float) => FSTORE,
        FieldType::Base(BaseType::Double) => DSTORE,
        FieldType::Base(_) => ISTORE,
    }
}

fn return_opcode(typ: &FieldType<BinaryName>) -> u8 {
    match typ {
        FieldType::Ref(_) => ARETURN,
        FieldType::Base(BaseType::Long) => LRETURN,
        FieldType::Base(BaseType::Float) => FRETURN,
        FieldType::Base(BaseType::Double) => DRETURN,
        FieldType::Base(_) => IRETURN,
    }
}

/// Is the element the start (`Some(true)`) or end (`Some(false)`) marker of injected code?
fn lock_marker(elements: &[CodeElement], idx: usize) -> Option<bool> {
    let opcode = match elements.get(idx) {
        Some(CodeElement::Insn(Instruction::Simple(op @ (ICONST_2 | ICONST_3)))) => *op,
        _ => return None,
    };
    match elements.get(idx + 1) {
        Some(CodeElement::Insn(Instruction::Simple(POP))) => Some(opcode == ICONST_2),
        _ => None,
    }
}

/// Position right after the `super(...)` or `this(...)` call of a constructor
///
/// Objects created with `new` are initialized by `<init>` calls too, so those are paired off
/// first. The first unpaired `<init>` call is the one on `this`.
fn constructor_body_start(body: &MethodBody, constants: &ConstantPool) -> Option<usize> {
    let mut pending_news = 0usize;
    for (idx, insn) in body.instructions() {
        match insn {
            Instruction::Type(NEW, _) => pending_news += 1,
            Instruction::Invoke(INVOKESPECIAL, index) => {
                let is_init = constants
                    .member_ref(*index)
                    .map(|member| member.name == UnqualifiedName::INIT.as_str())
                    .unwrap_or(false);
                if !is_init {
                    continue;
                }
                if pending_news == 0 {
                    return Some(idx + 1);
                }
                pending_news -= 1;
            }
            _ => (),
        }
    }
    None
}

/// Inject probes into a method body
///
/// Returns `None` for a constructor whose call to `super(...)` or `this(...)` can't be found.
pub(super) fn weave_body(
    site: &ProbeSite<'_>,
    mut body: MethodBody,
    constants: &mut ConstantPool,
) -> Result<Option<MethodBody>, Error> {
    let body_start = if site.is_constructor {
        match constructor_body_start(&body, constants) {
            Some(start) => start,
            None => return Ok(None),
        }
    } else {
        0
    };
    let with_calls = site.event_types.wants_calls();
    let with_lines = site.event_types.has(EventType::Line);

    let original = std::mem::take(&mut body.elements);
    let mut handlers = std::mem::take(&mut body.handlers);
    let mut fresh = || body.fresh_label();

    let range_start = fresh();
    let range_end = fresh();
    let throws_handler = fresh();
    let throwable = constants.get_class(BinaryName::THROWABLE.as_str())?;

    let mut emitter = Emitter {
        site,
        constants,
        elements: Vec::with_capacity(original.len() * 2),
    };
    let mut call_handlers = vec![];
    let mut lock_depth = 0usize;
    let mut last_line: i32 = -1;

    let mut idx = 0;
    while idx < original.len() {
        if idx == body_start {
            emitter.label(range_start);
            emitter.entry(&mut fresh)?;
        }

        // Markers of earlier weaving pass through untouched
        if let Some(opens) = lock_marker(&original, idx) {
            if opens {
                lock_depth += 1;
            } else {
                lock_depth = lock_depth.saturating_sub(1);
            }
            emitter.elements.push(original[idx].clone());
            emitter.elements.push(original[idx + 1].clone());
            idx += 2;
            continue;
        }

        let element = &original[idx];
        let instrumentable = lock_depth == 0 && idx >= body_start;
        match element {
            CodeElement::Line(line) => {
                last_line = *line as i32;
                emitter.elements.push(element.clone());
                if instrumentable && with_lines {
                    emitter.line(*line)?;
                }
            }
            CodeElement::Insn(insn) if instrumentable && insn.is_return() => {
                emitter.exit(&mut fresh)?;
                emitter.elements.push(element.clone());
            }
            CodeElement::Insn(
                insn @ (Instruction::Invoke(_, index) | Instruction::InvokeInterface(index, _)),
            ) if instrumentable && with_calls => {
                let member = emitter.constants.member_ref(*index)?;
                let owner = member.owner.replace('/', ".");
                let name = String::from(member.name);
                let descriptor = String::from(member.descriptor);
                let guarded = !(site.is_constructor
                    && matches!(insn, Instruction::Invoke(INVOKESPECIAL, _))
                    && name == UnqualifiedName::INIT.as_str());

                emitter.call_before(last_line, &owner, &name, &descriptor)?;
                if guarded {
                    let (start, end, handler, after) = (fresh(), fresh(), fresh(), fresh());
                    emitter.label(start);
                    emitter.elements.push(element.clone());
                    emitter.label(end);
                    emitter.call_return()?;
                    emitter.insn(Instruction::Branch(BranchInstruction::Goto(after)));
                    emitter.label(handler);
                    emitter.call_throws()?;
                    emitter.label(after);
                    call_handlers.push(Handler {
                        start,
                        end,
                        handler,
                        catch_type: None,
                    });
                } else {
                    emitter.elements.push(element.clone());
                    emitter.call_return()?;
                }
            }
            _ => emitter.elements.push(element.clone()),
        }
        idx += 1;
    }

    if body_start >= original.len() {
        emitter.label(range_start);
        emitter.entry(&mut fresh)?;
    }
    emitter.label(range_end);
    emitter.label(throws_handler);
    emitter.throws(&mut fresh)?;

    body.elements = emitter.elements;

    // Call site handlers are innermost, so they go first
    let mut all_handlers = call_handlers;
    all_handlers.append(&mut handlers);
    all_handlers.push(Handler {
        start: range_start,
        end: range_end,
        handler: throws_handler,
        catch_type: Some(throwable),
    });
    body.handlers = all_handlers;

    log::debug!(
        "Wove {}#{}{} for listener {}",
        site.class_name,
        site.method_name,
        site.descriptor_str,
        site.listener_id
    );
    Ok(Some(body))
}
