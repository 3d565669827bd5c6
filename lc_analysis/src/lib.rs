//!
//! Constant-tracking dataflow over method bytecode.
//!
//! A forward fixed-point over the control-flow graph (branches,
//! fall-through, exception edges) with a flat lattice: `Unknown` absorbs
//! any two distinct `Known` values. The result is one [`Frame`] per
//! instruction position, `None` where the position is unreachable.

use lc_ir::{ConstOperand, MethodNode};
use thiserror::Error;

mod analyzer;
#[cfg(test)]
mod test;

/// Errors from the analyzer. A method that trips one of these is treated by
/// passes as having no frames at all.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("stack underflow at instruction {pos}")]
    StackUnderflow { pos: usize },
    #[error("stack shape mismatch when merging into instruction {pos}")]
    StackMismatch { pos: usize },
    #[error("local variable {var} out of range at instruction {pos}")]
    BadLocal { pos: usize, var: u16 },
    #[error("malformed instruction at {pos}: {reason}")]
    Malformed { pos: usize, reason: &'static str },
    #[error(transparent)]
    Ir(#[from] lc_ir::IrError),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// An abstract value: either a specific loadable constant or nothing known.
#[derive(Debug, Clone)]
pub enum ConstantValue {
    Unknown { size: u8 },
    Known(ConstOperand),
}

impl ConstantValue {
    pub fn unknown(size: u8) -> Self {
        Self::Unknown { size }
    }

    pub fn size(&self) -> u8 {
        match self {
            Self::Unknown { size } => *size,
            Self::Known(op) => op.size(),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn as_known(&self) -> Option<&ConstOperand> {
        match self {
            Self::Known(op) => Some(op),
            Self::Unknown { .. } => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self.as_known()? {
            ConstOperand::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self.as_known()? {
            ConstOperand::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Flat-lattice join. Two distinct known values widen to `Unknown`.
    pub fn join(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Known(a), Self::Known(b)) if a == b => self.clone(),
            _ => Self::unknown(self.size().max(other.size())),
        }
    }
}

// Size is bookkeeping, not identity: an int widened through a merge still
// equals the original constant.
impl PartialEq for ConstantValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Known(a), Self::Known(b)) => a == b,
            (Self::Unknown { .. }, Self::Unknown { .. }) => true,
            _ => false,
        }
    }
}

impl Eq for ConstantValue {}

/// Abstract state before one instruction: operand stack entries (each entry
/// is one value, wide or narrow) and the dense local-variable slots.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stack: Vec<ConstantValue>,
    pub locals: Vec<ConstantValue>,
}

impl Frame {
    /// The value `depth` entries below the top of the stack.
    pub fn peek(&self, depth: usize) -> Option<&ConstantValue> {
        self.stack.iter().rev().nth(depth)
    }
}

/// Collaborator resolving references the analyzer cannot see through on its
/// own: constant fields and pure, deterministic methods.
pub trait ConstantRefHandler {
    fn field_value(&self, _owner: &str, _name: &str, _desc: &str) -> Option<ConstOperand> {
        None
    }

    fn method_return(
        &self,
        _owner: &str,
        _name: &str,
        _desc: &str,
        _args: &[ConstantValue],
    ) -> Option<ConstOperand> {
        None
    }
}

/// The default handler: nothing is constant.
pub struct NoRefs;

impl ConstantRefHandler for NoRefs {}

/// Runs the analyzer over `method`. The returned vector is parallel to
/// `method.insns`; each entry is the frame *before* that position executes.
pub fn analyze(
    method: &MethodNode,
    handler: &dyn ConstantRefHandler,
) -> Result<Vec<Option<Frame>>> {
    analyzer::run(method, handler)
}
