//! Editable representation of method bytecode
//!
//! A `Code` attribute gets decoded into a [`MethodBody`], which is a flat list of
//! [`CodeElement`]s where jump targets are [`Label`]s instead of offsets. After instructions have
//! been spliced in, the body is encoded back, which takes care of:
//!
//!   - picking compact forms of instructions (`iload_0`, `ldc`, ...) where possible
//!   - widening jumps which don't fit in a signed 16-bit offset
//!   - recomputing the maximum stack, maximum locals, and stack map table
//!   - moving the offsets in exception, line number, and local variable tables
//!

mod body;
mod decode;
mod encode;
mod instruction;
mod label;
pub mod opcodes;

pub use body::*;
pub use instruction::*;
pub use label::*;

#[cfg(test)]
mod test {
    use super::opcodes::*;
    use super::*;
    use crate::jvm::class_file::{Code, ConstantPool};
    use crate::jvm::verifier::{MethodContext, ObjectHierarchy};
    use crate::jvm::{BinaryName, MethodDescriptor, Name, ParseDescriptor, UnqualifiedName};

    fn context(descriptor: &str) -> MethodContext {
        MethodContext {
            class_name: BinaryName::from_string(String::from("demo/Calc")).unwrap(),
            method_name: UnqualifiedName::from_string(String::from("run")).unwrap(),
            descriptor: MethodDescriptor::parse(descriptor).unwrap(),
            is_static: true,
        }
    }

    fn encode(body: MethodBody, descriptor: &str, constants: &mut ConstantPool) -> Code {
        body.encode(&context(descriptor), constants, &ObjectHierarchy, true)
            .unwrap()
    }

    #[test]
    fn short_forms_are_picked() {
        let mut constants = ConstantPool::new();
        let mut body = MethodBody::new(0);
        body.push(Instruction::Local(ILOAD, 0));
        body.push(Instruction::Local(ISTORE, 5));
        body.push(Instruction::Local(ILOAD, 5));
        body.push(Instruction::Simple(IRETURN));

        let code = encode(body, "(I)I", &mut constants);
        assert_eq!(code.code_array.0, vec![ILOAD_0, ISTORE, 5, ILOAD, 5, IRETURN]);
        assert_eq!(code.max_locals, 6);
        assert_eq!(code.max_stack, 1);
    }

    #[test]
    fn decoding_then_encoding_preserves_bytecode() {
        // static int abs(int x) { if (x < 0) return -x; return x; }
        let mut constants = ConstantPool::new();
        let original = Code {
            max_stack: 1,
            max_locals: 1,
            code_array: crate::jvm::class_file::BytecodeArray(vec![
                ILOAD_0, IFGE, 0, 6, ILOAD_0, INEG, IRETURN, ILOAD_0, IRETURN,
            ]),
            exception_table: vec![],
            attributes: vec![],
        };
        let body = MethodBody::decode(&original, &constants).unwrap();
        let labels = body
            .elements
            .iter()
            .filter(|elem| matches!(elem, CodeElement::Label(_)))
            .count();
        assert_eq!(labels, 1);

        let code = encode(body, "(I)I", &mut constants);
        assert_eq!(code.code_array, original.code_array);
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.max_locals, 1);

        // The join point after the `if` needs a frame
        assert_eq!(code.attributes.len(), 1);
    }

    #[test]
    fn far_conditional_jumps_get_widened() {
        let mut constants = ConstantPool::new();
        let mut body = MethodBody::new(1);
        let far = body.fresh_label();
        body.push(Instruction::Local(ILOAD, 0));
        body.push(BranchInstruction::If(IFEQ, far));
        for _ in 0..40_000 {
            body.push(Instruction::Simple(NOP));
        }
        body.push(CodeElement::Label(far));
        body.push(Instruction::Simple(RETURN));

        let code = encode(body, "(I)V", &mut constants);
        let bytes = &code.code_array.0;

        // `ifne +8; goto_w far`
        assert_eq!(&bytes[1..4], &[IFNE, 0, 8]);
        assert_eq!(bytes[4], GOTO_W);
        let jump = i32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        assert_eq!(jump as usize, 9 + 40_000 - 4);
        assert_eq!(bytes.len(), 9 + 40_000 + 1);
    }

    #[test]
    fn switch_operands_are_aligned() {
        let mut constants = ConstantPool::new();
        let mut body = MethodBody::new(1);
        let one = body.fresh_label();
        let other = body.fresh_label();
        body.push(Instruction::Local(ILOAD, 0));
        body.push(BranchInstruction::TableSwitch {
            default: other,
            low: 1,
            targets: vec![one],
        });
        body.push(CodeElement::Label(one));
        body.push(Instruction::Simple(ICONST_1));
        body.push(Instruction::Simple(IRETURN));
        body.push(CodeElement::Label(other));
        body.push(Instruction::Simple(ICONST_0));
        body.push(Instruction::Simple(IRETURN));

        let code = encode(body, "(I)I", &mut constants);
        let bytes = &code.code_array.0;
        assert_eq!(bytes[1], TABLESWITCH);
        // Opcode at 1, so two bytes of padding bring the operands to offset 4
        assert_eq!(&bytes[2..4], &[0, 0]);
        assert_eq!(bytes.len(), 4 + 16 + 4);

        let decoded = MethodBody::decode(&code, &constants).unwrap();
        assert!(decoded.instructions().any(|(_, insn)| matches!(
            insn,
            Instruction::Branch(BranchInstruction::TableSwitch { low: 1, .. })
        )));
    }

    #[test]
    fn unreachable_code_becomes_athrow() {
        let mut constants = ConstantPool::new();
        let mut body = MethodBody::new(0);
        body.push(Instruction::Simple(RETURN));
        body.push(Instruction::Simple(ICONST_1));
        body.push(Instruction::Simple(POP));
        body.push(Instruction::Simple(RETURN));

        let code = encode(body, "()V", &mut constants);
        assert_eq!(code.code_array.0, vec![RETURN, ATHROW]);
        assert_eq!(code.attributes.len(), 1);
    }
}
