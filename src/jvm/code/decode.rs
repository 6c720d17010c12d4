use super::opcodes::*;
use super::{
    BranchInstruction, CodeElement, Handler, Instruction, Label, LocalVariableRange, MethodBody,
};
use crate::jvm::class_file::{
    AttributeLike, ClassConstantIndex, Code, ConstantIndex, ConstantPool, LineNumberTable,
    LocalVariable, LocalVariableTable, LocalVariableTypeTable, StackMapTable,
};
use crate::jvm::Error;
use byteorder::{BigEndian, ByteOrder};
use std::collections::{BTreeMap, HashSet};

/// Code attributes that get rebuilt (or dropped since their offsets would go stale) on encoding
const REBUILT_ATTRIBUTES: [&str; 6] = [
    StackMapTable::NAME,
    LineNumberTable::NAME,
    LocalVariableTable::NAME,
    LocalVariableTypeTable::NAME,
    "RuntimeVisibleTypeAnnotations",
    "RuntimeInvisibleTypeAnnotations",
];

impl MethodBody {
    /// Decode the bytecode of a `Code` attribute
    pub fn decode(code: &Code, constants: &ConstantPool) -> Result<MethodBody, Error> {
        let mut decoder = Decoder {
            bytes: &code.code_array.0,
            labels: BTreeMap::new(),
        };

        let mut decoded: Vec<(usize, Instruction)> = vec![];
        let mut offset = 0;
        while offset < decoder.bytes.len() {
            let (insn, next_offset) = decoder.instruction(offset)?;
            decoded.push((offset, insn));
            offset = next_offset;
        }

        let instruction_starts: HashSet<usize> = decoded.iter().map(|(off, _)| *off).collect();
        let code_len = decoder.bytes.len();
        let is_boundary = |off: usize| off == code_len || instruction_starts.contains(&off);

        let mut handlers = vec![];
        for entry in &code.exception_table {
            let start = decoder.label_at(entry.start_pc.0 as usize);
            let end = decoder.label_at(entry.end_pc.0 as usize);
            let handler = decoder.label_at(entry.handler_pc.0 as usize);
            let catch_type = if entry.catch_type.0 == ConstantIndex(0) {
                None
            } else {
                Some(entry.catch_type)
            };
            handlers.push(Handler {
                start,
                end,
                handler,
                catch_type,
            });
        }

        let mut lines: BTreeMap<usize, Vec<u16>> = BTreeMap::new();
        let mut local_variables = vec![];
        let mut attributes = vec![];
        for attribute in &code.attributes {
            if attribute.is_named(constants, LineNumberTable::NAME) {
                let table: LineNumberTable = attribute.decode()?;
                for entry in table.0 {
                    let start = entry.start_pc.0 as usize;
                    if instruction_starts.contains(&start) {
                        lines.entry(start).or_default().push(entry.line_number);
                    }
                }
            } else if attribute.is_named(constants, LocalVariableTable::NAME) {
                let table: LocalVariableTable = attribute.decode()?;
                decoder.local_variables(table.0, false, &is_boundary, &mut local_variables);
            } else if attribute.is_named(constants, LocalVariableTypeTable::NAME) {
                let table: LocalVariableTypeTable = attribute.decode()?;
                decoder.local_variables(table.0, true, &is_boundary, &mut local_variables);
            } else if !REBUILT_ATTRIBUTES
                .iter()
                .any(|name| attribute.is_named(constants, name))
            {
                attributes.push(attribute.clone());
            }
        }

        // Every label must land on an instruction (or the very end of the code)
        for (label_offset, _) in &decoder.labels {
            if !is_boundary(*label_offset) {
                return Err(Error::BadBranchTarget {
                    offset: *label_offset,
                    target: *label_offset as isize,
                });
            }
        }

        let mut body = MethodBody::new(code.max_locals);
        for (insn_offset, insn) in decoded {
            if let Some(label) = decoder.labels.get(&insn_offset) {
                body.elements.push(CodeElement::Label(*label));
            }
            for line in lines.remove(&insn_offset).unwrap_or_default() {
                body.elements.push(CodeElement::Line(line));
            }
            body.elements.push(CodeElement::Insn(insn));
        }
        if let Some(label) = decoder.labels.get(&code_len) {
            body.elements.push(CodeElement::Label(*label));
        }

        for label in decoder.labels.values() {
            body.reserve_label(*label);
        }
        body.handlers = handlers;
        body.local_variables = local_variables;
        body.attributes = attributes;
        Ok(body)
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],

    /// Label for every offset that gets referenced
    labels: BTreeMap<usize, Label>,
}

impl<'a> Decoder<'a> {
    fn label_at(&mut self, offset: usize) -> Label {
        let next = Label(self.labels.len());
        *self.labels.entry(offset).or_insert(next)
    }

    fn jump(&mut self, from: usize, relative: i32) -> Result<Label, Error> {
        let target = from as isize + relative as isize;
        if target < 0 || target as usize >= self.bytes.len() {
            return Err(Error::BadBranchTarget {
                offset: from,
                target,
            });
        }
        Ok(self.label_at(target as usize))
    }

    fn slice(&self, at: usize, len: usize) -> Result<&'a [u8], Error> {
        self.bytes.get(at..at + len).ok_or_else(|| {
            Error::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated instruction",
            ))
        })
    }

    fn u8(&self, at: usize) -> Result<u8, Error> {
        Ok(self.slice(at, 1)?[0])
    }

    fn u16(&self, at: usize) -> Result<u16, Error> {
        Ok(BigEndian::read_u16(self.slice(at, 2)?))
    }

    fn i16(&self, at: usize) -> Result<i16, Error> {
        Ok(BigEndian::read_i16(self.slice(at, 2)?))
    }

    fn i32(&self, at: usize) -> Result<i32, Error> {
        Ok(BigEndian::read_i32(self.slice(at, 4)?))
    }

    /// Decode the instruction at `offset`, returning it and the offset of the next one
    fn instruction(&mut self, offset: usize) -> Result<(Instruction, usize), Error> {
        let opcode = self.u8(offset)?;
        let cp = |idx: u16| ConstantIndex(idx);
        let decoded = match opcode {
            BIPUSH => (Instruction::BiPush(self.u8(offset + 1)? as i8), 2),
            SIPUSH => (Instruction::SiPush(self.i16(offset + 1)?), 3),
            LDC => (Instruction::Ldc(cp(self.u8(offset + 1)? as u16)), 2),
            LDC_W => (Instruction::Ldc(cp(self.u16(offset + 1)?)), 3),
            LDC2_W => (Instruction::Ldc2(cp(self.u16(offset + 1)?)), 3),

            ILOAD..=ALOAD | ISTORE..=ASTORE | RET => {
                (Instruction::Local(opcode, self.u8(offset + 1)? as u16), 2)
            }
            ILOAD_0..=ALOAD_3 => {
                let n = opcode - ILOAD_0;
                (Instruction::Local(ILOAD + n / 4, (n % 4) as u16), 1)
            }
            ISTORE_0..=ASTORE_3 => {
                let n = opcode - ISTORE_0;
                (Instruction::Local(ISTORE + n / 4, (n % 4) as u16), 1)
            }
            IINC => {
                let index = self.u8(offset + 1)? as u16;
                let delta = self.u8(offset + 2)? as i8 as i16;
                (Instruction::IInc(index, delta), 3)
            }

            IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL => {
                let target = self.jump(offset, self.i16(offset + 1)? as i32)?;
                (Instruction::Branch(BranchInstruction::If(opcode, target)), 3)
            }
            GOTO => {
                let target = self.jump(offset, self.i16(offset + 1)? as i32)?;
                (Instruction::Branch(BranchInstruction::Goto(target)), 3)
            }
            JSR => {
                let target = self.jump(offset, self.i16(offset + 1)? as i32)?;
                (Instruction::Branch(BranchInstruction::Jsr(target)), 3)
            }
            GOTO_W => {
                let target = self.jump(offset, self.i32(offset + 1)?)?;
                (Instruction::Branch(BranchInstruction::Goto(target)), 5)
            }
            JSR_W => {
                let target = self.jump(offset, self.i32(offset + 1)?)?;
                (Instruction::Branch(BranchInstruction::Jsr(target)), 5)
            }

            TABLESWITCH => {
                let mut at = offset + 1 + switch_padding(offset);
                let default = self.jump(offset, self.i32(at)?)?;
                let low = self.i32(at + 4)?;
                let high = self.i32(at + 8)?;
                at += 12;
                if high < low {
                    return Err(Error::BadBranchTarget {
                        offset,
                        target: high as isize,
                    });
                }
                let mut targets = vec![];
                for _ in low..=high {
                    targets.push(self.jump(offset, self.i32(at)?)?);
                    at += 4;
                }
                let insn = BranchInstruction::TableSwitch {
                    default,
                    low,
                    targets,
                };
                (Instruction::Branch(insn), at - offset)
            }
            LOOKUPSWITCH => {
                let mut at = offset + 1 + switch_padding(offset);
                let default = self.jump(offset, self.i32(at)?)?;
                let npairs = self.i32(at + 4)?.max(0) as usize;
                at += 8;
                let mut pairs = Vec::with_capacity(npairs);
                for _ in 0..npairs {
                    let key = self.i32(at)?;
                    let target = self.jump(offset, self.i32(at + 4)?)?;
                    pairs.push((key, target));
                    at += 8;
                }
                let insn = BranchInstruction::LookupSwitch { default, pairs };
                (Instruction::Branch(insn), at - offset)
            }

            GETSTATIC..=PUTFIELD => (Instruction::Field(opcode, cp(self.u16(offset + 1)?)), 3),
            INVOKEVIRTUAL..=INVOKESTATIC => {
                (Instruction::Invoke(opcode, cp(self.u16(offset + 1)?)), 3)
            }
            INVOKEINTERFACE => {
                let index = cp(self.u16(offset + 1)?);
                (Instruction::InvokeInterface(index, self.u8(offset + 3)?), 5)
            }
            INVOKEDYNAMIC => (Instruction::InvokeDynamic(cp(self.u16(offset + 1)?)), 5),
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
                let class = ClassConstantIndex(cp(self.u16(offset + 1)?));
                (Instruction::Type(opcode, class), 3)
            }
            NEWARRAY => (Instruction::NewArray(self.u8(offset + 1)?), 2),
            MULTIANEWARRAY => {
                let class = ClassConstantIndex(cp(self.u16(offset + 1)?));
                (Instruction::MultiANewArray(class, self.u8(offset + 3)?), 4)
            }

            WIDE => match self.u8(offset + 1)? {
                IINC => {
                    let index = self.u16(offset + 2)?;
                    let delta = self.i16(offset + 4)?;
                    (Instruction::IInc(index, delta), 6)
                }
                wide_opcode @ (ILOAD..=ALOAD | ISTORE..=ASTORE | RET) => {
                    (Instruction::Local(wide_opcode, self.u16(offset + 2)?), 4)
                }
                other => {
                    return Err(Error::UnknownOpcode {
                        opcode: other,
                        offset: offset + 1,
                    })
                }
            },

            NOP..=DCONST_1
            | IALOAD..=SALOAD
            | IASTORE..=LXOR
            | I2L..=DCMPG
            | IRETURN..=RETURN
            | ARRAYLENGTH
            | ATHROW
            | MONITORENTER
            | MONITOREXIT => (Instruction::Simple(opcode), 1),

            _ => return Err(Error::UnknownOpcode { opcode, offset }),
        };
        let (insn, width) = decoded;
        Ok((insn, offset + width))
    }

    fn local_variables(
        &mut self,
        entries: Vec<LocalVariable>,
        is_generic_signature: bool,
        is_boundary: &impl Fn(usize) -> bool,
        into: &mut Vec<LocalVariableRange>,
    ) {
        for entry in entries {
            let start = entry.start_pc.0 as usize;
            let end = start + entry.length as usize;

            // Skip malformed ranges instead of failing the whole method
            if !is_boundary(start) || !is_boundary(end) {
                continue;
            }
            into.push(LocalVariableRange {
                start: self.label_at(start),
                end: self.label_at(end),
                name_index: entry.name_index,
                descriptor_index: entry.descriptor_index,
                index: entry.index,
                is_generic_signature,
            });
        }
    }
}

/// Padding after a switch opcode, so that the operands are 4-byte aligned
pub(super) fn switch_padding(opcode_offset: usize) -> usize {
    (4 - (opcode_offset + 1) % 4) % 4
}
