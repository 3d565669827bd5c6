//!
//! In-memory representation of JVM classes, methods and instructions,
//! plus the class-file parser that produces it.
//!
//! [The .class specs](https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html)

use thiserror::Error;

mod access;
mod class;
mod descriptor;
mod insn;
mod modifier;
pub mod opcodes;
mod parse;
mod universe;

pub use access::{ClassAccess, FieldAccess, MethodAccess};
pub use class::{ClassNode, ClassVersion, FieldNode, LocalVar, MethodNode, TryCatch};
pub use descriptor::{FieldType, MethodDescriptor};
pub use insn::{ConstOperand, Handle, HandleKind, Insn, LabelId, LabelMap};
pub use modifier::InstructionModifier;
pub use parse::parse_class;
pub use universe::{ClassRecord, Universe};

/// Errors produced while parsing or manipulating class files.
#[derive(Error, Debug)]
pub enum IrError {
    #[error("unexpected end of class file at byte {offset}")]
    UnexpectedEof { offset: usize },
    #[error("bad magic {magic:#010x}")]
    BadMagic { magic: u32 },
    #[error("invalid constant pool tag {tag}")]
    BadCpTag { tag: u8 },
    #[error("constant pool index {index} out of range")]
    BadCpIndex { index: u16 },
    #[error("constant pool entry {index} is not a {expected}")]
    BadCpType { index: u16, expected: &'static str },
    #[error("modified utf8 could not be decoded at pool entry {index}")]
    BadUtf8 { index: u16 },
    #[error("invalid opcode {opcode:#04x} at code offset {offset}")]
    BadOpcode { opcode: u8, offset: usize },
    #[error("branch to {target} is not an instruction boundary")]
    BadBranchTarget { target: usize },
    #[error("invalid descriptor {0:?}")]
    BadDescriptor(String),
    #[error("invalid method handle kind {kind}")]
    BadHandleKind { kind: u8 },
    #[error("bootstrap method index {index} out of range")]
    BadBootstrapIndex { index: u16 },
}

pub type Result<T> = std::result::Result<T, IrError>;
