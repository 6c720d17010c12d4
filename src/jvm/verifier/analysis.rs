use super::{AnalysisType, TypeHierarchy, VerificationType};
use crate::jvm::class_file::{ClassConstantIndex, Constant, ConstantIndex, ConstantPool};
use crate::jvm::code::opcodes::*;
use crate::jvm::code::{BranchInstruction, CodeElement, Instruction, Label, MethodBody};
use crate::jvm::{
    ArrayType, BaseType, BinaryName, Error, FieldType, MethodDescriptor, Name, ParseDescriptor,
    RefType, UnqualifiedName, VerifierErrorKind,
};
use crate::util::{OffsetVec, Width};

/// Method whose body is being analyzed
#[derive(Debug, Clone)]
pub struct MethodContext {
    pub class_name: BinaryName,
    pub method_name: UnqualifiedName,
    pub descriptor: MethodDescriptor<BinaryName>,
    pub is_static: bool,
}

/// Types of the locals and stack entering an element of the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowState {
    /// Locals by slot (the slot after a `long` or `double` holds `Top`)
    pub locals: Vec<AnalysisType>,
    pub stack: OffsetVec<AnalysisType>,
}

/// Result of running the type inference over a method body
#[derive(Debug)]
pub struct Analysis {
    /// State before each element (`None` for elements that are never reached)
    pub states: Vec<Option<FlowState>>,
    pub max_stack: usize,
    pub max_locals: usize,
}

impl FlowState {
    /// State on entry to a method
    pub fn entry(method: &MethodContext) -> FlowState {
        let mut locals = vec![];
        if !method.is_static {
            let is_constructor = method.method_name == UnqualifiedName::INIT
                && method.class_name != BinaryName::OBJECT;
            locals.push(if is_constructor {
                VerificationType::UninitializedThis
            } else {
                AnalysisType::object(method.class_name.clone())
            });
        }
        for parameter in &method.descriptor.parameters {
            let local = AnalysisType::from(parameter.clone());
            let width = local.width();
            locals.push(local);
            if width == 2 {
                locals.push(VerificationType::Top);
            }
        }
        FlowState {
            locals,
            stack: OffsetVec::new(),
        }
    }

    /// State at the start of an exception handler
    fn handler(locals: &[AnalysisType], catch_type: &AnalysisType) -> FlowState {
        let mut stack = OffsetVec::new();
        stack.push(catch_type.clone());
        FlowState {
            locals: locals.to_vec(),
            stack,
        }
    }

    /// State for code that is never reached, once it has been replaced with `athrow`
    pub fn dead_code() -> FlowState {
        FlowState::handler(&[], &AnalysisType::object(BinaryName::THROWABLE))
    }

    /// Merge another state into this one, returning whether this one changed
    fn merge(
        &mut self,
        other: &FlowState,
        hierarchy: &dyn TypeHierarchy,
    ) -> Result<bool, VerifierErrorKind> {
        if self.stack.len() != other.stack.len() {
            return Err(VerifierErrorKind::IncompatibleStackHeights(
                self.stack.len(),
                other.stack.len(),
            ));
        }

        let mut stack = OffsetVec::new();
        for ((_, _, t1), (_, _, t2)) in self.stack.iter().zip(other.stack.iter()) {
            let merged = t1.merge(t2, hierarchy);
            if merged == VerificationType::Top {
                return Err(VerifierErrorKind::InvalidType);
            }
            stack.push(merged);
        }

        let len = self.locals.len().max(other.locals.len());
        let mut locals = Vec::with_capacity(len);
        for idx in 0..len {
            let t1 = self.locals.get(idx).unwrap_or(&VerificationType::Top);
            let t2 = other.locals.get(idx).unwrap_or(&VerificationType::Top);
            locals.push(t1.merge(t2, hierarchy));
        }

        // A `long` or `double` whose second half got lost is unusable
        for idx in 0..len {
            let second_half_lost =
                matches!(locals.get(idx + 1), Some(t) if *t != VerificationType::Top);
            if locals[idx].width() == 2 && second_half_lost {
                locals[idx] = VerificationType::Top;
            }
        }

        let merged = FlowState { locals, stack };
        let changed = merged != *self;
        *self = merged;
        Ok(changed)
    }

    fn pop(&mut self) -> Result<AnalysisType, VerifierErrorKind> {
        match self.stack.pop() {
            Some((_, _, popped)) => Ok(popped),
            None => Err(VerifierErrorKind::EmptyStack),
        }
    }

    fn pop_n(&mut self, n: usize) -> Result<(), VerifierErrorKind> {
        for _ in 0..n {
            self.pop()?;
        }
        Ok(())
    }

    fn pop_width(&mut self, width: usize) -> Result<AnalysisType, VerifierErrorKind> {
        let popped = self.pop()?;
        if popped.width() == width {
            Ok(popped)
        } else {
            Err(VerifierErrorKind::InvalidWidth(popped.width()))
        }
    }

    fn push(&mut self, typ: AnalysisType) {
        self.stack.push(typ);
    }

    fn load(&self, index: u16) -> Result<AnalysisType, VerifierErrorKind> {
        match self.locals.get(index as usize) {
            Some(VerificationType::Top) | None => Err(VerifierErrorKind::InvalidIndex),
            Some(local) => Ok(local.clone()),
        }
    }

    fn store(&mut self, index: u16, typ: AnalysisType) {
        let index = index as usize;
        let width = typ.width();
        if self.locals.len() < index + width {
            self.locals.resize(index + width, VerificationType::Top);
        }

        // Overwriting the second half of a wide value invalidates the first half
        if index > 0 && self.locals[index - 1].width() == 2 {
            self.locals[index - 1] = VerificationType::Top;
        }
        if self.locals[index].width() == 2 && width == 1 {
            if let Some(second_half) = self.locals.get_mut(index + 1) {
                *second_half = VerificationType::Top;
            }
        }
        self.locals[index] = typ;
        if width == 2 {
            self.locals[index + 1] = VerificationType::Top;
        }
    }

    /// Replace every occurrence of an uninitialized value once its constructor has run
    fn initialize(&mut self, uninitialized: &AnalysisType, initialized: AnalysisType) {
        for local in self.locals.iter_mut() {
            if local == uninitialized {
                *local = initialized.clone();
            }
        }
        self.stack = self
            .stack
            .iter()
            .map(|(_, _, t)| {
                if t == uninitialized {
                    initialized.clone()
                } else {
                    t.clone()
                }
            })
            .collect();
    }
}

/// Infer the types of locals and stack at every point of a method body
///
/// This is a standard fix-point data flow: states are propagated along the control flow graph
/// (including edges into exception handlers) and merged where paths meet until nothing changes.
/// Elements in `dead_code` are extra roots which start with [`FlowState::dead_code`].
pub fn analyze(
    body: &MethodBody,
    method: &MethodContext,
    constants: &ConstantPool,
    hierarchy: &dyn TypeHierarchy,
    dead_code: &[usize],
) -> Result<Analysis, Error> {
    let elements = &body.elements;
    let positions = body.label_positions();
    let position = |label: &Label| -> Result<usize, Error> {
        positions.get(label).copied().ok_or(Error::UnplacedLabel(*label))
    };

    let mut handlers = vec![];
    for handler in &body.handlers {
        let catch_type = match handler.catch_type {
            None => AnalysisType::object(BinaryName::THROWABLE),
            Some(class) => class_type(constants, class.0)
                .map_err(|kind| verifier_error("exception table", kind))?,
        };
        handlers.push((
            position(&handler.start)?,
            position(&handler.end)?,
            position(&handler.handler)?,
            catch_type,
        ));
    }

    let mut analysis = Analysis {
        states: vec![None; elements.len()],
        max_stack: 0,
        max_locals: 0,
    };
    let mut worklist: Vec<usize> = vec![];
    let mut queued = vec![false; elements.len()];

    let flow = |analysis: &mut Analysis,
                    worklist: &mut Vec<usize>,
                    queued: &mut Vec<bool>,
                    target: usize,
                    state: &FlowState|
     -> Result<(), Error> {
        if target >= elements.len() {
            return Err(verifier_error("end of code", VerifierErrorKind::FallsOffEnd));
        }
        analysis.max_stack = analysis.max_stack.max(state.stack.offset_len().0);
        analysis.max_locals = analysis.max_locals.max(state.locals.len());
        let changed = match analysis.states[target].as_mut() {
            Some(existing) => existing
                .merge(state, hierarchy)
                .map_err(|kind| verifier_error(&describe(&elements[target]), kind))?,
            None => {
                analysis.states[target] = Some(state.clone());
                true
            }
        };
        if changed && !queued[target] {
            queued[target] = true;
            worklist.push(target);
        }
        Ok(())
    };

    if !elements.is_empty() {
        flow(&mut analysis, &mut worklist, &mut queued, 0, &FlowState::entry(method))?;
    }
    for root in dead_code {
        flow(&mut analysis, &mut worklist, &mut queued, *root, &FlowState::dead_code())?;
    }

    while let Some(idx) = worklist.pop() {
        queued[idx] = false;
        let state = match &analysis.states[idx] {
            Some(state) => state.clone(),
            None => continue,
        };

        let insn = match &elements[idx] {
            CodeElement::Label(_) | CodeElement::Line(_) => {
                flow(&mut analysis, &mut worklist, &mut queued, idx + 1, &state)?;
                continue;
            }
            CodeElement::Insn(insn) => insn,
        };

        let mut out = state.clone();
        step(&mut out, insn, idx, method, elements, constants)
            .map_err(|kind| verifier_error(&format!("{:?}", insn), kind))?;

        // Handlers must accept the locals from both before and after the instruction
        for (start, end, handler, catch_type) in &handlers {
            if *start <= idx && idx < *end {
                let before = FlowState::handler(&state.locals, catch_type);
                let after = FlowState::handler(&out.locals, catch_type);
                flow(&mut analysis, &mut worklist, &mut queued, *handler, &before)?;
                flow(&mut analysis, &mut worklist, &mut queued, *handler, &after)?;
            }
        }

        match insn {
            Instruction::Branch(BranchInstruction::Jsr(_)) | Instruction::Local(RET, _) => {
                return Err(Error::UnsupportedSubroutine);
            }
            Instruction::Branch(branch) => {
                for target in branch.targets() {
                    flow(&mut analysis, &mut worklist, &mut queued, position(&target)?, &out)?;
                }
                if !insn.is_terminal() {
                    flow(&mut analysis, &mut worklist, &mut queued, idx + 1, &out)?;
                }
            }
            _ if insn.is_terminal() => (),
            _ => flow(&mut analysis, &mut worklist, &mut queued, idx + 1, &out)?,
        }
    }

    Ok(analysis)
}

fn verifier_error(instruction: &str, kind: VerifierErrorKind) -> Error {
    Error::VerifierError {
        instruction: instruction.to_owned(),
        kind,
    }
}

fn describe(element: &CodeElement) -> String {
    format!("{:?}", element)
}

/// Type of a value of a class constant (which may name an array type)
fn class_type(
    constants: &ConstantPool,
    index: ConstantIndex,
) -> Result<AnalysisType, VerifierErrorKind> {
    let name = constants
        .class_name(ClassConstantIndex(index))
        .map_err(|_| VerifierErrorKind::MissingConstant(index))?;
    let ref_type =
        RefType::from_class_constant(name).map_err(|_| VerifierErrorKind::InvalidType)?;
    Ok(VerificationType::Object(ref_type))
}

fn field_type(descriptor: &str) -> Result<AnalysisType, VerifierErrorKind> {
    FieldType::<BinaryName>::parse(descriptor)
        .map(AnalysisType::from)
        .map_err(|_| VerifierErrorKind::InvalidType)
}

fn method_type(descriptor: &str) -> Result<MethodDescriptor<BinaryName>, VerifierErrorKind> {
    MethodDescriptor::parse(descriptor).map_err(|_| VerifierErrorKind::InvalidType)
}

/// Type of a value after indexing into an array
fn element_type(array: AnalysisType) -> Result<AnalysisType, VerifierErrorKind> {
    use VerificationType::*;
    Ok(match array {
        Null => Null,
        Object(RefType::ObjectArray(arr)) if arr.additional_dimensions == 0 => {
            AnalysisType::object(arr.element_type)
        }
        Object(RefType::ObjectArray(arr)) => Object(RefType::ObjectArray(ArrayType {
            additional_dimensions: arr.additional_dimensions - 1,
            element_type: arr.element_type,
        })),
        Object(RefType::PrimitiveArray(arr)) if arr.additional_dimensions > 0 => {
            Object(RefType::PrimitiveArray(ArrayType {
                additional_dimensions: arr.additional_dimensions - 1,
                element_type: arr.element_type,
            }))
        }
        _ => return Err(VerifierErrorKind::InvalidType),
    })
}

/// Update the state to reflect the effects of one instruction
fn step(
    state: &mut FlowState,
    insn: &Instruction,
    idx: usize,
    method: &MethodContext,
    elements: &[CodeElement],
    constants: &ConstantPool,
) -> Result<(), VerifierErrorKind> {
    use VerificationType::*;

    match insn {
        Instruction::Simple(op) => simple_step(state, *op)?,
        Instruction::BiPush(_) | Instruction::SiPush(_) => state.push(Integer),
        Instruction::Ldc(index) | Instruction::Ldc2(index) => {
            let is_wide = matches!(insn, Instruction::Ldc2(_));
            let typ = match constants
                .get(*index)
                .map_err(|_| VerifierErrorKind::MissingConstant(*index))?
            {
                Constant::Integer(_) => Integer,
                Constant::Float(_) => Float,
                Constant::Long(_) => Long,
                Constant::Double(_) => Double,
                Constant::String(_) => AnalysisType::object(BinaryName::STRING),
                Constant::Class(_) => AnalysisType::object(BinaryName::CLASS),
                Constant::MethodType { .. } => AnalysisType::object(BinaryName::METHODTYPE),
                Constant::MethodHandle { .. } => AnalysisType::object(BinaryName::METHODHANDLE),
                Constant::Dynamic { descriptor, .. } => {
                    let (_, descriptor) = constants
                        .name_and_type(*descriptor)
                        .map_err(|_| VerifierErrorKind::MissingConstant(*index))?;
                    field_type(descriptor)?
                }
                _ => return Err(VerifierErrorKind::MissingConstant(*index)),
            };
            if (typ.width() == 2) != is_wide {
                return Err(VerifierErrorKind::InvalidWidth(typ.width()));
            }
            state.push(typ);
        }

        Instruction::Local(op, index) => match *op {
            ILOAD => expect_local(state, *index, Integer)?,
            LLOAD => expect_local(state, *index, Long)?,
            FLOAD => expect_local(state, *index, Float)?,
            DLOAD => expect_local(state, *index, Double)?,
            ALOAD => {
                let local = state.load(*index)?;
                if !local.is_reference() {
                    return Err(VerifierErrorKind::InvalidType);
                }
                state.push(local);
            }
            ISTORE | LSTORE | FSTORE | DSTORE => {
                let value = state.pop()?;
                state.store(*index, value);
            }
            ASTORE => {
                let value = state.pop()?;
                if !value.is_reference() {
                    return Err(VerifierErrorKind::InvalidType);
                }
                state.store(*index, value);
            }
            _ => return Err(VerifierErrorKind::InvalidType),
        },
        Instruction::IInc(index, _) => {
            if state.load(*index)? != Integer {
                return Err(VerifierErrorKind::InvalidType);
            }
        }

        Instruction::Field(op, index) => {
            let field = constants
                .member_ref(*index)
                .map_err(|_| VerifierErrorKind::MissingConstant(*index))?;
            let typ = field_type(field.descriptor)?;
            match *op {
                GETSTATIC => state.push(typ),
                PUTSTATIC => state.pop_n(1)?,
                GETFIELD => {
                    state.pop()?;
                    state.push(typ);
                }
                _ => state.pop_n(2)?,
            }
        }

        Instruction::Invoke(_, index) | Instruction::InvokeInterface(index, _) => {
            let op = match insn {
                Instruction::Invoke(op, _) => *op,
                _ => INVOKEINTERFACE,
            };
            let member = constants
                .member_ref(*index)
                .map_err(|_| VerifierErrorKind::MissingConstant(*index))?;
            let descriptor = method_type(member.descriptor)?;
            state.pop_n(descriptor.parameters.len())?;
            if op != INVOKESTATIC {
                let receiver = state.pop()?;
                if op == INVOKESPECIAL && member.name == UnqualifiedName::INIT.as_str() {
                    let initialized = match &receiver {
                        UninitializedThis => AnalysisType::object(method.class_name.clone()),
                        Uninitialized(new_idx) => match elements.get(*new_idx) {
                            Some(CodeElement::Insn(Instruction::Type(NEW, class))) => {
                                class_type(constants, class.0)?
                            }
                            _ => return Err(VerifierErrorKind::InvalidType),
                        },
                        _ => return Err(VerifierErrorKind::InvalidType),
                    };
                    state.initialize(&receiver, initialized);
                }
            }
            if let Some(return_type) = descriptor.return_type {
                state.push(AnalysisType::from(return_type));
            }
        }
        Instruction::InvokeDynamic(index) => {
            let (_, descriptor) = constants
                .invoke_dynamic(*index)
                .map_err(|_| VerifierErrorKind::MissingConstant(*index))?;
            let descriptor = method_type(descriptor)?;
            state.pop_n(descriptor.parameters.len())?;
            if let Some(return_type) = descriptor.return_type {
                state.push(AnalysisType::from(return_type));
            }
        }

        Instruction::Type(op, class) => match *op {
            NEW => state.push(Uninitialized(idx)),
            ANEWARRAY => {
                state.pop()?;
                let element = match class_type(constants, class.0)? {
                    Object(ref_type) => FieldType::Ref(ref_type),
                    _ => return Err(VerifierErrorKind::InvalidType),
                };
                state.push(AnalysisType::from(element.array_of()));
            }
            CHECKCAST => {
                state.pop()?;
                state.push(class_type(constants, class.0)?);
            }
            _ => {
                state.pop()?;
                state.push(Integer);
            }
        },
        Instruction::NewArray(atype) => {
            state.pop()?;
            let element_type = match atype {
                4 => BaseType::Boolean,
                5 => BaseType::Char,
                6 => BaseType::Float,
                7 => BaseType::Double,
                8 => BaseType::Byte,
                9 => BaseType::Short,
                10 => BaseType::Int,
                11 => BaseType::Long,
                _ => return Err(VerifierErrorKind::InvalidType),
            };
            state.push(Object(RefType::PrimitiveArray(ArrayType {
                additional_dimensions: 0,
                element_type,
            })));
        }
        Instruction::MultiANewArray(class, dimensions) => {
            state.pop_n(*dimensions as usize)?;
            state.push(class_type(constants, class.0)?);
        }

        Instruction::Branch(branch) => match branch {
            BranchInstruction::If(op, _) => match *op {
                IFEQ..=IFLE | IFNULL | IFNONNULL => state.pop_n(1)?,
                _ => state.pop_n(2)?,
            },
            BranchInstruction::TableSwitch { .. } | BranchInstruction::LookupSwitch { .. } => {
                state.pop_n(1)?
            }
            BranchInstruction::Goto(_) | BranchInstruction::Jsr(_) => (),
        },
    }
    Ok(())
}

fn expect_local(
    state: &mut FlowState,
    index: u16,
    expected: AnalysisType,
) -> Result<(), VerifierErrorKind> {
    if state.load(index)? != expected {
        return Err(VerifierErrorKind::InvalidType);
    }
    state.push(expected);
    Ok(())
}

/// Types for the `i`, `l`, `f`, `d` variants of arithmetic instructions
const ARITHMETIC_TYPES: [AnalysisType; 4] = [
    VerificationType::Integer,
    VerificationType::Long,
    VerificationType::Float,
    VerificationType::Double,
];

fn simple_step(state: &mut FlowState, op: u8) -> Result<(), VerifierErrorKind> {
    use VerificationType::*;

    match op {
        NOP => (),
        ACONST_NULL => state.push(Null),
        ICONST_M1..=ICONST_5 => state.push(Integer),
        LCONST_0 | LCONST_1 => state.push(Long),
        FCONST_0..=FCONST_2 => state.push(Float),
        DCONST_0 | DCONST_1 => state.push(Double),

        IALOAD | BALOAD | CALOAD | SALOAD => {
            state.pop_n(2)?;
            state.push(Integer);
        }
        LALOAD | FALOAD | DALOAD => {
            state.pop_n(2)?;
            state.push(ARITHMETIC_TYPES[(op - IALOAD) as usize].clone());
        }
        AALOAD => {
            state.pop()?;
            let array = state.pop()?;
            state.push(element_type(array)?);
        }
        IASTORE..=SASTORE => state.pop_n(3)?,

        POP => {
            state.pop_width(1)?;
        }
        POP2 => {
            if state.pop()?.width() == 1 {
                state.pop_width(1)?;
            }
        }
        DUP => {
            let arg1 = state.pop_width(1)?;
            state.push(arg1.clone());
            state.push(arg1);
        }
        DUP_X1 => {
            let arg1 = state.pop_width(1)?;
            let arg2 = state.pop_width(1)?;
            state.push(arg1.clone());
            state.push(arg2);
            state.push(arg1);
        }
        DUP_X2 => {
            let arg1 = state.pop_width(1)?;
            let arg2 = state.pop()?;
            if arg2.width() == 1 {
                let arg3 = state.pop_width(1)?;
                state.push(arg1.clone());
                state.push(arg3);
            } else {
                state.push(arg1.clone());
            }
            state.push(arg2);
            state.push(arg1);
        }
        DUP2 => {
            let arg1 = state.pop()?;
            if arg1.width() == 1 {
                let arg2 = state.pop_width(1)?;
                state.push(arg2.clone());
                state.push(arg1.clone());
                state.push(arg2);
            } else {
                state.push(arg1.clone());
            }
            state.push(arg1);
        }
        DUP2_X1 => {
            let arg1 = state.pop()?;
            if arg1.width() == 1 {
                let arg2 = state.pop_width(1)?;
                let arg3 = state.pop_width(1)?;
                state.push(arg2.clone());
                state.push(arg1.clone());
                state.push(arg3);
                state.push(arg2);
            } else {
                let arg2 = state.pop_width(1)?;
                state.push(arg1.clone());
                state.push(arg2);
            }
            state.push(arg1);
        }
        DUP2_X2 => {
            let arg1 = state.pop()?;
            if arg1.width() == 1 {
                let arg2 = state.pop_width(1)?;
                let arg3 = state.pop()?;
                let arg4 = if arg3.width() == 1 {
                    Some(state.pop_width(1)?)
                } else {
                    None
                };
                state.push(arg2.clone());
                state.push(arg1.clone());
                if let Some(arg4) = arg4 {
                    state.push(arg4);
                }
                state.push(arg3);
                state.push(arg2);
            } else {
                let arg2 = state.pop()?;
                let arg3 = if arg2.width() == 1 {
                    Some(state.pop_width(1)?)
                } else {
                    None
                };
                state.push(arg1.clone());
                if let Some(arg3) = arg3 {
                    state.push(arg3);
                }
                state.push(arg2);
            }
            state.push(arg1);
        }
        SWAP => {
            let arg1 = state.pop_width(1)?;
            let arg2 = state.pop_width(1)?;
            state.push(arg1);
            state.push(arg2);
        }

        IADD..=DREM => {
            state.pop_n(2)?;
            state.push(ARITHMETIC_TYPES[((op - IADD) % 4) as usize].clone());
        }
        INEG..=DNEG => {
            state.pop()?;
            state.push(ARITHMETIC_TYPES[(op - INEG) as usize].clone());
        }
        ISHL..=LXOR => {
            state.pop_n(2)?;
            state.push(if (op - ISHL) % 2 == 0 { Integer } else { Long });
        }

        I2L | F2L | D2L => {
            state.pop()?;
            state.push(Long);
        }
        I2F | L2F | D2F => {
            state.pop()?;
            state.push(Float);
        }
        I2D | L2D | F2D => {
            state.pop()?;
            state.push(Double);
        }
        L2I | F2I | D2I | I2B | I2C | I2S => {
            state.pop()?;
            state.push(Integer);
        }
        LCMP..=DCMPG => {
            state.pop_n(2)?;
            state.push(Integer);
        }

        IRETURN..=ARETURN => state.pop_n(1)?,
        RETURN => (),
        ARRAYLENGTH => {
            state.pop()?;
            state.push(Integer);
        }
        ATHROW | MONITORENTER | MONITOREXIT => state.pop_n(1)?,

        _ => return Err(VerifierErrorKind::InvalidType),
    }
    Ok(())
}
