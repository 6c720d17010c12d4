use super::opcodes::*;
use super::Label;
use crate::jvm::class_file::{ClassConstantIndex, ConstantIndex};

/// Single bytecode instruction, with jump targets as labels
///
/// Instructions are grouped by the shape of their operands rather than enumerated one by one:
/// the opcode is kept as-is for everything that shares a shape. Short forms (`iload_0`, `ldc`
/// vs. `ldc_w`, `wide` prefixes) are normalized away when decoding and picked again when
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Instruction without operands (`iadd`, `areturn`, `athrow`, ...)
    Simple(u8),
    BiPush(i8),
    SiPush(i16),

    /// Single-width constant (`ldc` or `ldc_w`)
    Ldc(ConstantIndex),

    /// Double-width constant (`ldc2_w`)
    Ldc2(ConstantIndex),

    /// Local variable access, using the long form opcode (`iload`, `astore`, `ret`, ...)
    Local(u8, u16),
    IInc(u16, i16),

    /// `getstatic`, `putstatic`, `getfield`, `putfield`
    Field(u8, ConstantIndex),

    /// `invokevirtual`, `invokespecial`, `invokestatic` (interface methods too)
    Invoke(u8, ConstantIndex),
    InvokeInterface(ConstantIndex, u8),
    InvokeDynamic(ConstantIndex),

    /// `new`, `anewarray`, `checkcast`, `instanceof`
    Type(u8, ClassConstantIndex),

    /// Primitive array allocation (operand is the `atype`)
    NewArray(u8),
    MultiANewArray(ClassConstantIndex, u8),

    Branch(BranchInstruction),
}

/// Instructions which can jump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchInstruction {
    /// Conditional jump (`ifeq` through `if_acmpne`, `ifnull`, `ifnonnull`)
    If(u8, Label),
    Goto(Label),
    Jsr(Label),
    TableSwitch {
        default: Label,
        low: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

impl BranchInstruction {
    /// Every label this instruction might jump to
    pub fn targets(&self) -> Vec<Label> {
        match self {
            BranchInstruction::If(_, target)
            | BranchInstruction::Goto(target)
            | BranchInstruction::Jsr(target) => vec![*target],
            BranchInstruction::TableSwitch {
                default, targets, ..
            } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            BranchInstruction::LookupSwitch { default, pairs } => {
                let mut all: Vec<Label> = pairs.iter().map(|(_, lbl)| *lbl).collect();
                all.push(*default);
                all
            }
        }
    }
}

/// Pick the condition which jumps exactly when `opcode` does not
///
/// Used when a conditional jump is too far and must be rewritten around a `goto_w`.
pub fn invert_condition(opcode: u8) -> u8 {
    match opcode {
        IFNULL => IFNONNULL,
        IFNONNULL => IFNULL,

        // Conditions come in pairs: `ifeq`/`ifne`, `iflt`/`ifge`, ...
        _ => ((opcode + 1) ^ 1) - 1,
    }
}

impl Instruction {
    /// Does control never continue to the next instruction?
    pub fn is_terminal(&self) -> bool {
        match self {
            Instruction::Simple(op) => matches!(*op, IRETURN..=RETURN | ATHROW),
            Instruction::Local(RET, _) => true,
            Instruction::Branch(BranchInstruction::If(_, _)) => false,
            Instruction::Branch(_) => true,
            _ => false,
        }
    }

    /// Is this a `xreturn` instruction?
    pub fn is_return(&self) -> bool {
        matches!(self, Instruction::Simple(IRETURN..=RETURN))
    }
}

/// Element of a method body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeElement {
    /// Position that can be referenced (does not correspond to any bytecode)
    Label(Label),

    /// Source line for the instructions that follow
    Line(u16),
    Insn(Instruction),
}

impl From<Instruction> for CodeElement {
    fn from(insn: Instruction) -> CodeElement {
        CodeElement::Insn(insn)
    }
}

impl From<BranchInstruction> for CodeElement {
    fn from(insn: BranchInstruction) -> CodeElement {
        CodeElement::Insn(Instruction::Branch(insn))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inverted_conditions() {
        assert_eq!(invert_condition(IFEQ), IFNE);
        assert_eq!(invert_condition(IFNE), IFEQ);
        assert_eq!(invert_condition(IFLT), IFGE);
        assert_eq!(invert_condition(IFGT), IFLE);
        assert_eq!(invert_condition(IF_ICMPLE), IF_ICMPGT);
        assert_eq!(invert_condition(IF_ACMPEQ), IF_ACMPNE);
        assert_eq!(invert_condition(IFNULL), IFNONNULL);
        assert_eq!(invert_condition(IFNONNULL), IFNULL);
    }

    #[test]
    fn terminal_instructions() {
        assert!(Instruction::Simple(ARETURN).is_terminal());
        assert!(Instruction::Simple(ATHROW).is_terminal());
        assert!(Instruction::Branch(BranchInstruction::Goto(Label(0))).is_terminal());
        assert!(!Instruction::Branch(BranchInstruction::If(IFEQ, Label(0))).is_terminal());
        assert!(!Instruction::Simple(IADD).is_terminal());
    }
}
