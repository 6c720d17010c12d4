use super::decode::switch_padding;
use super::opcodes::*;
use super::{
    invert_condition, BranchInstruction, CodeElement, Handler, Instruction, Label, MethodBody,
};
use crate::jvm::class_file::{
    BytecodeArray, BytecodeIndex, ClassConstantIndex, Code, ConstantIndex, ConstantPool,
    ExceptionHandler, LineNumber, LineNumberTable, LocalVariable, LocalVariableTable,
    LocalVariableTypeTable, StackMapTable,
};
use crate::jvm::verifier::{analyze, Analysis, FlowState, Frame, MethodContext, TypeHierarchy};
use crate::jvm::Error;
use byteorder::{BigEndian, WriteBytesExt};
use std::collections::{BTreeMap, HashSet};

/// Largest size of the bytecode array of a method
const MAX_CODE_LENGTH: usize = u16::MAX as usize;

impl MethodBody {
    /// Encode the body into a `Code` attribute
    ///
    /// Maximum stack and locals are recomputed, jumps which don't fit in 16 bits are widened, and
    /// the stack map table is inferred again when `compute_frames` is set. Code which is never
    /// reached gets replaced with `athrow` so that it can be given a trivial frame.
    pub fn encode(
        mut self,
        method: &MethodContext,
        constants: &mut ConstantPool,
        hierarchy: &dyn TypeHierarchy,
        compute_frames: bool,
    ) -> Result<Code, Error> {
        let mut analysis = analyze(&self, method, constants, hierarchy, &[])?;
        let dead_code = self.replace_dead_code(&analysis);
        if !dead_code.is_empty() {
            analysis = analyze(&self, method, constants, hierarchy, &dead_code)?;
        }

        let positions = self.label_positions();
        let position = |label: &Label| -> Result<usize, Error> {
            positions.get(label).copied().ok_or(Error::UnplacedLabel(*label))
        };

        let (offsets, widened) = self.layout(&position)?;
        let code_array = self.emit(&offsets, &widened, &position)?;
        let code_len = code_array.len();
        if code_len > MAX_CODE_LENGTH {
            return Err(Error::MethodCodeOverflow(code_len));
        }
        let offset_of =
            |label: &Label| -> Result<u16, Error> { Ok(offsets[position(label)?] as u16) };

        let mut exception_table = vec![];
        let mut live_handlers = vec![];
        for handler in &self.handlers {
            let start_pc = offset_of(&handler.start)?;
            let end_pc = offset_of(&handler.end)?;
            if start_pc >= end_pc {
                continue;
            }
            exception_table.push(ExceptionHandler {
                start_pc: BytecodeIndex(start_pc),
                end_pc: BytecodeIndex(end_pc),
                handler_pc: BytecodeIndex(offset_of(&handler.handler)?),
                catch_type: handler
                    .catch_type
                    .unwrap_or(ClassConstantIndex(ConstantIndex(0))),
            });
            live_handlers.push(position(&handler.handler)?);
        }

        let mut attributes = vec![];

        if compute_frames {
            let mut frame_points: Vec<usize> = dead_code.clone();
            frame_points.extend(live_handlers);
            for (idx, element) in self.elements.iter().enumerate() {
                if let CodeElement::Insn(Instruction::Branch(branch)) = element {
                    for target in branch.targets() {
                        frame_points.push(position(&target)?);
                    }
                    if widened.contains(&idx) && matches!(branch, BranchInstruction::If(_, _)) {
                        frame_points.push(idx + 1);
                    }
                }
            }
            let frames =
                self.stack_map_frames(method, constants, &analysis, &offsets, frame_points)?;
            if !frames.0.is_empty() {
                attributes.push(constants.get_attribute(frames)?);
            }
        }

        let mut line_numbers = vec![];
        for (idx, element) in self.elements.iter().enumerate() {
            if let CodeElement::Line(line_number) = element {
                if offsets[idx] < code_len {
                    line_numbers.push(LineNumber {
                        start_pc: BytecodeIndex(offsets[idx] as u16),
                        line_number: *line_number,
                    });
                }
            }
        }
        if !line_numbers.is_empty() {
            attributes.push(constants.get_attribute(LineNumberTable(line_numbers))?);
        }

        let mut local_variables = vec![];
        let mut local_variable_types = vec![];
        for range in &self.local_variables {
            let start = offset_of(&range.start)?;
            let end = offset_of(&range.end)?;
            if end < start {
                continue;
            }
            let entry = LocalVariable {
                start_pc: BytecodeIndex(start),
                length: end - start,
                name_index: range.name_index,
                descriptor_index: range.descriptor_index,
                index: range.index,
            };
            if range.is_generic_signature {
                local_variable_types.push(entry);
            } else {
                local_variables.push(entry);
            }
        }
        if !local_variables.is_empty() {
            attributes.push(constants.get_attribute(LocalVariableTable(local_variables))?);
        }
        if !local_variable_types.is_empty() {
            let table = LocalVariableTypeTable(local_variable_types);
            attributes.push(constants.get_attribute(table)?);
        }
        attributes.extend(self.attributes);

        let max_stack = analysis.max_stack;
        if max_stack > u16::MAX as usize {
            return Err(Error::MethodCodeMaxStackOverflow(max_stack));
        }
        let max_locals = analysis
            .max_locals
            .max(self.max_locals as usize)
            .max(FlowState::entry(method).locals.len());
        if max_locals > u16::MAX as usize {
            return Err(Error::MethodCodeMaxLocalsOverflow(max_locals));
        }

        Ok(Code {
            max_stack: max_stack as u16,
            max_locals: max_locals as u16,
            code_array: BytecodeArray(code_array),
            exception_table,
            attributes,
        })
    }

    /// Replace every run of unreachable code with a single `athrow`
    ///
    /// Exception handler ranges are split around the replaced code. Returns the positions of the
    /// inserted `athrow` instructions.
    fn replace_dead_code(&mut self, analysis: &Analysis) -> Vec<usize> {
        let is_dead = |idx: usize| analysis.states[idx].is_none();
        let has_dead_insn = self.instructions().any(|(idx, _)| is_dead(idx));
        if !has_dead_insn {
            return vec![];
        }

        let old_elements = std::mem::take(&mut self.elements);
        let mut dead_runs: Vec<(Label, Label)> = vec![];
        let mut idx = 0;
        while idx < old_elements.len() {
            if !is_dead(idx) {
                self.elements.push(old_elements[idx].clone());
                idx += 1;
                continue;
            }

            let run_end = (idx..old_elements.len())
                .find(|i| !is_dead(*i))
                .unwrap_or(old_elements.len());
            let run = &old_elements[idx..run_end];
            let kept_labels = run.iter().filter_map(|elem| match elem {
                CodeElement::Label(label) => Some(CodeElement::Label(*label)),
                _ => None,
            });

            if run.iter().any(|elem| matches!(elem, CodeElement::Insn(_))) {
                let start = self.fresh_label();
                let end = self.fresh_label();
                self.elements.push(CodeElement::Label(start));
                self.elements.push(CodeElement::Insn(Instruction::Simple(ATHROW)));
                self.elements.push(CodeElement::Label(end));
                dead_runs.push((start, end));
            }
            self.elements.extend(kept_labels);
            idx = run_end;
        }

        let positions = self.label_positions();
        let pos = |label: &Label| positions.get(label).copied().unwrap_or(0);
        for (dead_start, dead_end) in &dead_runs {
            let (a, b) = (pos(dead_start), pos(dead_end));
            let mut split_handlers = vec![];
            for handler in self.handlers.drain(..) {
                let (start, end) = (pos(&handler.start), pos(&handler.end));
                if start >= b || end <= a {
                    split_handlers.push(handler);
                    continue;
                }
                if start < a {
                    split_handlers.push(Handler {
                        end: *dead_start,
                        ..handler.clone()
                    });
                }
                if end > b {
                    split_handlers.push(Handler {
                        start: *dead_end,
                        ..handler
                    });
                }
            }
            self.handlers = split_handlers;
        }

        dead_runs
            .iter()
            .map(|(start, _)| pos(start) + 1)
            .collect()
    }

    /// Compute the offset of every element, widening jumps until all of them fit
    ///
    /// Widening a jump only ever makes code longer, so the set of jumps that need widening only
    /// grows and the loop terminates.
    fn layout(
        &self,
        position: &impl Fn(&Label) -> Result<usize, Error>,
    ) -> Result<(Vec<usize>, HashSet<usize>), Error> {
        let mut widened: HashSet<usize> = HashSet::new();
        loop {
            let mut offsets = Vec::with_capacity(self.elements.len() + 1);
            let mut offset = 0;
            for (idx, element) in self.elements.iter().enumerate() {
                offsets.push(offset);
                if let CodeElement::Insn(insn) = element {
                    offset += instruction_width(insn, offset, widened.contains(&idx));
                }
            }
            offsets.push(offset);

            let mut changed = false;
            for (idx, element) in self.elements.iter().enumerate() {
                let target = match element {
                    CodeElement::Insn(Instruction::Branch(
                        BranchInstruction::If(_, target)
                        | BranchInstruction::Goto(target)
                        | BranchInstruction::Jsr(target),
                    )) if !widened.contains(&idx) => target,
                    _ => continue,
                };
                let relative = offsets[position(target)?] as isize - offsets[idx] as isize;
                if relative < i16::MIN as isize || relative > i16::MAX as isize {
                    widened.insert(idx);
                    changed = true;
                }
            }

            if !changed {
                return Ok((offsets, widened));
            }
        }
    }

    fn emit(
        &self,
        offsets: &[usize],
        widened: &HashSet<usize>,
        position: &impl Fn(&Label) -> Result<usize, Error>,
    ) -> Result<Vec<u8>, Error> {
        let mut code: Vec<u8> = vec![];
        for (idx, element) in self.elements.iter().enumerate() {
            let insn = match element {
                CodeElement::Insn(insn) => insn,
                _ => continue,
            };
            let offset = offsets[idx];
            let relative = |label: &Label| -> Result<i32, Error> {
                Ok(offsets[position(label)?] as i32 - offset as i32)
            };

            match insn {
                Instruction::Simple(op) => code.write_u8(*op)?,
                Instruction::BiPush(value) => {
                    code.write_u8(BIPUSH)?;
                    code.write_i8(*value)?;
                }
                Instruction::SiPush(value) => {
                    code.write_u8(SIPUSH)?;
                    code.write_i16::<BigEndian>(*value)?;
                }
                Instruction::Ldc(index) if index.0 <= u8::MAX as u16 => {
                    code.write_u8(LDC)?;
                    code.write_u8(index.0 as u8)?;
                }
                Instruction::Ldc(index) => {
                    code.write_u8(LDC_W)?;
                    code.write_u16::<BigEndian>(index.0)?;
                }
                Instruction::Ldc2(index) => {
                    code.write_u8(LDC2_W)?;
                    code.write_u16::<BigEndian>(index.0)?;
                }
                Instruction::Local(op, index) => {
                    if *op != RET && *index <= 3 {
                        code.write_u8(short_local_opcode(*op) + *index as u8)?;
                    } else if *index <= u8::MAX as u16 {
                        code.write_u8(*op)?;
                        code.write_u8(*index as u8)?;
                    } else {
                        code.write_u8(WIDE)?;
                        code.write_u8(*op)?;
                        code.write_u16::<BigEndian>(*index)?;
                    }
                }
                Instruction::IInc(index, delta) => {
                    if is_short_iinc(*index, *delta) {
                        code.write_u8(IINC)?;
                        code.write_u8(*index as u8)?;
                        code.write_i8(*delta as i8)?;
                    } else {
                        code.write_u8(WIDE)?;
                        code.write_u8(IINC)?;
                        code.write_u16::<BigEndian>(*index)?;
                        code.write_i16::<BigEndian>(*delta)?;
                    }
                }
                Instruction::Field(op, index) | Instruction::Invoke(op, index) => {
                    code.write_u8(*op)?;
                    code.write_u16::<BigEndian>(index.0)?;
                }
                Instruction::InvokeInterface(index, count) => {
                    code.write_u8(INVOKEINTERFACE)?;
                    code.write_u16::<BigEndian>(index.0)?;
                    code.write_u8(*count)?;
                    code.write_u8(0)?;
                }
                Instruction::InvokeDynamic(index) => {
                    code.write_u8(INVOKEDYNAMIC)?;
                    code.write_u16::<BigEndian>(index.0)?;
                    code.write_u16::<BigEndian>(0)?;
                }
                Instruction::Type(op, class) => {
                    code.write_u8(*op)?;
                    code.write_u16::<BigEndian>((class.0).0)?;
                }
                Instruction::NewArray(atype) => {
                    code.write_u8(NEWARRAY)?;
                    code.write_u8(*atype)?;
                }
                Instruction::MultiANewArray(class, dimensions) => {
                    code.write_u8(MULTIANEWARRAY)?;
                    code.write_u16::<BigEndian>((class.0).0)?;
                    code.write_u8(*dimensions)?;
                }

                Instruction::Branch(BranchInstruction::If(op, target)) => {
                    if widened.contains(&idx) {
                        // Skip over the `goto_w` when the original condition does not hold
                        code.write_u8(invert_condition(*op))?;
                        code.write_i16::<BigEndian>(8)?;
                        code.write_u8(GOTO_W)?;
                        code.write_i32::<BigEndian>(relative(target)? - 3)?;
                    } else {
                        code.write_u8(*op)?;
                        code.write_i16::<BigEndian>(relative(target)? as i16)?;
                    }
                }
                Instruction::Branch(
                    BranchInstruction::Goto(target) | BranchInstruction::Jsr(target),
                ) => {
                    let is_goto = matches!(insn, Instruction::Branch(BranchInstruction::Goto(_)));
                    if widened.contains(&idx) {
                        code.write_u8(if is_goto { GOTO_W } else { JSR_W })?;
                        code.write_i32::<BigEndian>(relative(target)?)?;
                    } else {
                        code.write_u8(if is_goto { GOTO } else { JSR })?;
                        code.write_i16::<BigEndian>(relative(target)? as i16)?;
                    }
                }
                Instruction::Branch(BranchInstruction::TableSwitch {
                    default,
                    low,
                    targets,
                }) => {
                    code.write_u8(TABLESWITCH)?;
                    for _ in 0..switch_padding(offset) {
                        code.write_u8(0)?;
                    }
                    code.write_i32::<BigEndian>(relative(default)?)?;
                    code.write_i32::<BigEndian>(*low)?;
                    code.write_i32::<BigEndian>(*low + targets.len() as i32 - 1)?;
                    for target in targets {
                        code.write_i32::<BigEndian>(relative(target)?)?;
                    }
                }
                Instruction::Branch(BranchInstruction::LookupSwitch { default, pairs }) => {
                    code.write_u8(LOOKUPSWITCH)?;
                    for _ in 0..switch_padding(offset) {
                        code.write_u8(0)?;
                    }
                    code.write_i32::<BigEndian>(relative(default)?)?;
                    code.write_i32::<BigEndian>(pairs.len() as i32)?;
                    let mut sorted = pairs.clone();
                    sorted.sort_by_key(|(key, _)| *key);
                    for (key, target) in &sorted {
                        code.write_i32::<BigEndian>(*key)?;
                        code.write_i32::<BigEndian>(relative(target)?)?;
                    }
                }
            }
        }
        Ok(code)
    }

    /// Build the stack map table for the given frame points (positions of elements)
    fn stack_map_frames(
        &self,
        method: &MethodContext,
        constants: &mut ConstantPool,
        analysis: &Analysis,
        offsets: &[usize],
        frame_points: Vec<usize>,
    ) -> Result<StackMapTable, Error> {
        // Frames describe instructions, so move labels forward onto what they label
        let mut by_offset: BTreeMap<usize, usize> = BTreeMap::new();
        for point in frame_points {
            let insn_idx = (point..self.elements.len())
                .find(|idx| matches!(self.elements[*idx], CodeElement::Insn(_)));
            if let Some(insn_idx) = insn_idx {
                by_offset.insert(offsets[insn_idx], insn_idx);
            }
        }

        let new_offset = |position: usize| offsets[position] as u16;
        let entry = FlowState::entry(method);
        let mut previous = Frame::from_slots(&entry.locals, entry.stack.iter().map(|(_, _, t)| t))
            .into_serializable(constants, &new_offset)?;
        let mut previous_offset: Option<usize> = None;
        let mut frames = vec![];

        for (offset, insn_idx) in by_offset {
            let state = match &analysis.states[insn_idx] {
                Some(state) => state,
                None => continue,
            };
            let frame = Frame::from_slots(&state.locals, state.stack.iter().map(|(_, _, t)| t))
                .into_serializable(constants, &new_offset)?;
            let offset_delta = match previous_offset {
                None => offset,
                Some(previous_offset) => offset - previous_offset - 1,
            };
            frames.push(frame.stack_map_frame(offset_delta as u16, &previous));
            previous = frame;
            previous_offset = Some(offset);
        }

        Ok(StackMapTable(frames))
    }
}

/// Opcode for `xload_0`/`xstore_0` given `xload`/`xstore`
fn short_local_opcode(op: u8) -> u8 {
    match op {
        ILOAD..=ALOAD => ILOAD_0 + (op - ILOAD) * 4,
        _ => ISTORE_0 + (op - ISTORE) * 4,
    }
}

fn is_short_iinc(index: u16, delta: i16) -> bool {
    index <= u8::MAX as u16 && delta >= i8::MIN as i16 && delta <= i8::MAX as i16
}

/// Number of bytes an instruction is encoded into, when placed at `offset`
fn instruction_width(insn: &Instruction, offset: usize, widened: bool) -> usize {
    match insn {
        Instruction::Simple(_) => 1,
        Instruction::BiPush(_) | Instruction::NewArray(_) => 2,
        Instruction::SiPush(_)
        | Instruction::Ldc2(_)
        | Instruction::Field(_, _)
        | Instruction::Invoke(_, _)
        | Instruction::Type(_, _) => 3,
        Instruction::Ldc(index) => {
            if index.0 <= u8::MAX as u16 {
                2
            } else {
                3
            }
        }
        Instruction::Local(op, index) => {
            if *op != RET && *index <= 3 {
                1
            } else if *index <= u8::MAX as u16 {
                2
            } else {
                4
            }
        }
        Instruction::IInc(index, delta) => {
            if is_short_iinc(*index, *delta) {
                3
            } else {
                6
            }
        }
        Instruction::InvokeInterface(_, _) | Instruction::InvokeDynamic(_) => 5,
        Instruction::MultiANewArray(_, _) => 4,
        Instruction::Branch(BranchInstruction::If(_, _)) => {
            if widened {
                8
            } else {
                3
            }
        }
        Instruction::Branch(BranchInstruction::Goto(_) | BranchInstruction::Jsr(_)) => {
            if widened {
                5
            } else {
                3
            }
        }
        Instruction::Branch(BranchInstruction::TableSwitch { targets, .. }) => {
            1 + switch_padding(offset) + 12 + 4 * targets.len()
        }
        Instruction::Branch(BranchInstruction::LookupSwitch { pairs, .. }) => {
            1 + switch_padding(offset) + 8 + 8 * pairs.len()
        }
    }
}
