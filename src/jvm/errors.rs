use super::class_file::{Constant, ConstantIndex};
use super::code::Label;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum Error {
    ConstantPoolOverflow {
        constant: Constant,
        offset: u16,
    },
    IoError(std::io::Error),

    /// Class file does not start with `0xCAFEBABE`
    BadMagic([u8; 4]),

    /// Constant pool index does not point to a constant of the expected sort
    BadConstant {
        index: ConstantIndex,
        expected: &'static str,
    },

    /// A descriptor in the class file could not be parsed
    BadDescriptor(String),

    /// Unknown opcode in a method body
    UnknownOpcode { opcode: u8, offset: usize },

    /// Branch or table offset that lands outside of the method body
    BadBranchTarget { offset: usize, target: isize },

    /// Label which is referenced but never placed
    UnplacedLabel(Label),

    MethodCodeOverflow(usize),
    MethodCodeMaxStackOverflow(usize),
    MethodCodeMaxLocalsOverflow(usize),

    /// Code uses subroutines (`jsr`/`ret`), which stack map frames can't describe
    UnsupportedSubroutine,

    /// Error trying to compute stack map frames
    VerifierError {
        instruction: String,
        kind: VerifierErrorKind,
    },
}

#[derive(Debug)]
pub enum VerifierErrorKind {
    EmptyStack,
    InvalidIndex,
    InvalidType,
    InvalidWidth(usize),
    MissingConstant(ConstantIndex),
    IncompatibleStackHeights(usize, usize),
    FallsOffEnd,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::BadMagic(magic) => write!(f, "bad class file magic {:02x?}", magic),
            Error::ConstantPoolOverflow { offset, .. } => {
                write!(f, "constant pool overflow at #{}", offset)
            }
            Error::BadConstant { index, expected } => {
                write!(f, "constant #{} is not a {}", index.0, expected)
            }
            Error::BadDescriptor(desc) => write!(f, "malformed descriptor '{}'", desc),
            Error::UnknownOpcode { opcode, offset } => {
                write!(f, "unknown opcode 0x{:02x} at {}", opcode, offset)
            }
            Error::BadBranchTarget { offset, target } => {
                write!(f, "branch at {} targets {} outside the code", offset, target)
            }
            Error::UnplacedLabel(label) => write!(f, "label {:?} is never placed", label),
            Error::MethodCodeOverflow(len) => write!(f, "method code is too long ({})", len),
            Error::MethodCodeMaxStackOverflow(len) => write!(f, "max stack too large ({})", len),
            Error::MethodCodeMaxLocalsOverflow(len) => {
                write!(f, "max locals too large ({})", len)
            }
            Error::UnsupportedSubroutine => f.write_str("jsr/ret subroutines are not supported"),
            Error::VerifierError { instruction, kind } => {
                write!(f, "cannot compute frames at {}: {:?}", instruction, kind)
            }
        }
    }
}

impl std::error::Error for Error {}
