//! The instruction list model.
//!
//! Instructions live in a `Vec<Insn>` per method. Labels are pseudo-nodes
//! with a per-method integer identity; jumps, switches, try/catch ranges and
//! local-variable ranges refer to a `LabelId`, never to a position, so edits
//! do not invalidate them.

use crate::opcodes::*;
use crate::{IrError, Result};
use indexmap::IndexMap;

/// Identity of a label inside one method. Ids are allocated by the owning
/// [`MethodNode`](crate::MethodNode) and are meaningless across methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

/// Remap table used when cloning instructions into another method.
pub type LabelMap = IndexMap<LabelId, LabelId>;

/// A reference to a field or method, as carried by a method handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub kind: HandleKind,
    pub owner: String,
    pub name: String,
    pub desc: String,
}

/// The nine method handle kinds of the class file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => Self::GetField,
            2 => Self::GetStatic,
            3 => Self::PutField,
            4 => Self::PutStatic,
            5 => Self::InvokeVirtual,
            6 => Self::InvokeStatic,
            7 => Self::InvokeSpecial,
            8 => Self::NewInvokeSpecial,
            9 => Self::InvokeInterface,
            kind => return Err(IrError::BadHandleKind { kind }),
        })
    }

    /// Whether the handle refers to a field rather than a method.
    pub fn is_field(self) -> bool {
        matches!(
            self,
            Self::GetField | Self::GetStatic | Self::PutField | Self::PutStatic
        )
    }
}

/// A loadable constant: the operand of `ldc`-family instructions and of
/// bootstrap method argument lists. `Null` never appears in class files but
/// is a legal tracked constant (`aconst_null`).
#[derive(Debug, Clone)]
pub enum ConstOperand {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    /// A class constant; internal name or array descriptor.
    Class(String),
    MethodHandle(Handle),
    MethodType(String),
    Null,
}

impl ConstOperand {
    /// Stack slots the constant occupies.
    pub fn size(&self) -> u8 {
        match self {
            Self::Long(_) | Self::Double(_) => 2,
            _ => 1,
        }
    }
}

// Floats compare by bits so constants behave as map keys and in tests; NaN
// payloads produced by obfuscators must survive comparison untouched.
impl PartialEq for ConstOperand {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Class(a), Self::Class(b)) => a == b,
            (Self::MethodHandle(a), Self::MethodHandle(b)) => a == b,
            (Self::MethodType(a), Self::MethodType(b)) => a == b,
            (Self::Null, Self::Null) => true,
            _ => false,
        }
    }
}

impl Eq for ConstOperand {}

/// One instruction or pseudo-node of a method body.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    /// Any instruction identified by its opcode alone.
    Simple(u8),
    /// `bipush`/`sipush`.
    IntPush { op: u8, value: i32 },
    /// Local variable access: `iload`..`astore` (normalized from the
    /// `_0`..`_3` short forms) and `ret`.
    Var { op: u8, var: u16 },
    /// `new`/`anewarray`/`checkcast`/`instanceof`.
    Type { op: u8, ty: String },
    /// `newarray` with a primitive element type code.
    NewArray { elem: u8 },
    /// Field access.
    Field { op: u8, owner: String, name: String, desc: String },
    /// Direct method invocation.
    Method { op: u8, owner: String, name: String, desc: String },
    /// `invokedynamic`: name and descriptor of the call site, the bootstrap
    /// method handle, and its static arguments.
    InvokeDynamic {
        name: String,
        desc: String,
        bootstrap: Handle,
        args: Vec<ConstOperand>,
    },
    /// `ldc`/`ldc_w`/`ldc2_w`, operand width erased.
    Ldc(ConstOperand),
    /// Conditional and unconditional branches, including `jsr`.
    Jump { op: u8, target: LabelId },
    TableSwitch {
        lo: i32,
        hi: i32,
        default: LabelId,
        targets: Vec<LabelId>,
    },
    LookupSwitch {
        default: LabelId,
        pairs: Vec<(i32, LabelId)>,
    },
    Iinc { var: u16, delta: i16 },
    MultiANewArray { desc: String, dims: u8 },
    /// Line number pseudo-node, anchored at `start`.
    Line { line: u16, start: LabelId },
    /// Stack map frame pseudo-node. The parser drops frames; the variant
    /// exists so rewritten methods can mark where recomputation is due.
    Frame,
    /// Positional anchor.
    Label(LabelId),
}

impl Insn {
    /// The opcode, or `None` for pseudo-nodes (labels, lines, frames).
    pub fn opcode(&self) -> Option<u8> {
        Some(match self {
            Self::Simple(op)
            | Self::IntPush { op, .. }
            | Self::Var { op, .. }
            | Self::Type { op, .. }
            | Self::Field { op, .. }
            | Self::Method { op, .. }
            | Self::Jump { op, .. } => *op,
            Self::NewArray { .. } => NEWARRAY,
            Self::InvokeDynamic { .. } => INVOKEDYNAMIC,
            Self::Ldc(c) if c.size() == 2 => LDC2_W,
            Self::Ldc(_) => LDC,
            Self::TableSwitch { .. } => TABLESWITCH,
            Self::LookupSwitch { .. } => LOOKUPSWITCH,
            Self::Iinc { .. } => IINC,
            Self::MultiANewArray { .. } => MULTIANEWARRAY,
            Self::Line { .. } | Self::Frame | Self::Label(_) => return None,
        })
    }

    /// Whether this is a real instruction, not a positional pseudo-node.
    pub fn is_real(&self) -> bool {
        self.opcode().is_some()
    }

    pub fn is_return(&self) -> bool {
        matches!(self.opcode(), Some(IRETURN..=RETURN))
    }

    /// Deep clone with labels translated through `map`. Labels missing from
    /// the map are kept, which is only sound when cloning within one method.
    pub fn clone_remapped(&self, map: &LabelMap) -> Insn {
        let remap = |l: &LabelId| map.get(l).copied().unwrap_or(*l);
        match self {
            Self::Jump { op, target } => Self::Jump {
                op: *op,
                target: remap(target),
            },
            Self::TableSwitch {
                lo,
                hi,
                default,
                targets,
            } => Self::TableSwitch {
                lo: *lo,
                hi: *hi,
                default: remap(default),
                targets: targets.iter().map(|t| remap(t)).collect(),
            },
            Self::LookupSwitch { default, pairs } => Self::LookupSwitch {
                default: remap(default),
                pairs: pairs.iter().map(|(k, t)| (*k, remap(t))).collect(),
            },
            Self::Line { line, start } => Self::Line {
                line: *line,
                start: remap(start),
            },
            Self::Label(l) => Self::Label(remap(l)),
            other => other.clone(),
        }
    }

    /// Convenience constructor for the optimally-encoded push of an `int`.
    pub fn push_int(value: i32) -> Insn {
        match value {
            -1..=5 => Insn::Simple((ICONST_0 as i32 + value) as u8),
            -128..=127 => Insn::IntPush { op: BIPUSH, value },
            -32768..=32767 => Insn::IntPush { op: SIPUSH, value },
            _ => Insn::Ldc(ConstOperand::Int(value)),
        }
    }

    /// Convenience constructor for the optimally-encoded push of a `long`.
    pub fn push_long(value: i64) -> Insn {
        match value {
            0 => Insn::Simple(LCONST_0),
            1 => Insn::Simple(LCONST_1),
            _ => Insn::Ldc(ConstOperand::Long(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_of_pseudo_nodes() {
        assert_eq!(Insn::Label(LabelId(0)).opcode(), None);
        assert_eq!(Insn::Frame.opcode(), None);
        assert_eq!(Insn::Simple(NOP).opcode(), Some(NOP));
        assert_eq!(
            Insn::Ldc(ConstOperand::Long(3)).opcode(),
            Some(LDC2_W)
        );
    }

    #[test]
    fn push_int_encodings() {
        assert_eq!(Insn::push_int(2), Insn::Simple(ICONST_2));
        assert_eq!(Insn::push_int(-1), Insn::Simple(ICONST_M1));
        assert_eq!(Insn::push_int(42), Insn::IntPush { op: BIPUSH, value: 42 });
        assert_eq!(
            Insn::push_int(300),
            Insn::IntPush { op: SIPUSH, value: 300 }
        );
        assert_eq!(Insn::push_int(70000), Insn::Ldc(ConstOperand::Int(70000)));
    }

    #[test]
    fn remap_touches_every_label() {
        let mut map = LabelMap::default();
        map.insert(LabelId(0), LabelId(7));
        map.insert(LabelId(1), LabelId(8));

        let sw = Insn::LookupSwitch {
            default: LabelId(0),
            pairs: vec![(3, LabelId(1))],
        };
        assert_eq!(
            sw.clone_remapped(&map),
            Insn::LookupSwitch {
                default: LabelId(7),
                pairs: vec![(3, LabelId(8))],
            }
        );
    }
}
