//! The fixed-point engine and transfer functions.

use crate::{AnalysisError, ConstantRefHandler, ConstantValue, Frame, Result};
use lc_ir::opcodes::*;
use lc_ir::{ConstOperand, FieldType, Insn, LabelId, MethodDescriptor, MethodNode};
use std::collections::{HashMap, VecDeque};

pub(crate) fn run(
    method: &MethodNode,
    handler: &dyn ConstantRefHandler,
) -> Result<Vec<Option<Frame>>> {
    let insns = &method.insns;
    if insns.is_empty() {
        return Ok(Vec::new());
    }

    let mut label_pos = HashMap::new();
    for (pos, insn) in insns.iter().enumerate() {
        if let Insn::Label(label) = insn {
            label_pos.insert(*label, pos);
        }
    }
    let pos_of = |label: LabelId| -> Result<usize> {
        label_pos.get(&label).copied().ok_or(AnalysisError::Malformed {
            pos: 0,
            reason: "dangling label reference",
        })
    };

    // protected ranges as positions: (start, end, handler)
    let mut handlers = Vec::with_capacity(method.try_catches.len());
    for tc in &method.try_catches {
        handlers.push((pos_of(tc.start)?, pos_of(tc.end)?, pos_of(tc.handler)?));
    }

    let mut frames: Vec<Option<Frame>> = vec![None; insns.len()];
    let entry = Frame {
        stack: Vec::new(),
        locals: vec![ConstantValue::unknown(1); method.max_locals as usize],
    };

    let mut worklist = VecDeque::new();
    frames[0] = Some(entry);
    worklist.push_back(0usize);

    while let Some(pos) = worklist.pop_front() {
        let Some(in_frame) = frames[pos].clone() else {
            continue;
        };

        // exceptional edge: anything in a protected range may transfer to
        // its handler with the locals as they stand and a one-item stack
        for &(start, end, target) in &handlers {
            if pos >= start && pos < end {
                let frame = Frame {
                    stack: vec![ConstantValue::unknown(1)],
                    locals: in_frame.locals.clone(),
                };
                merge(&mut frames, target, frame, &mut worklist)?;
            }
        }

        let insn = &insns[pos];
        let mut machine = Machine {
            frame: in_frame,
            pos,
        };
        machine.transfer(insn, handler)?;
        let out = machine.frame;

        for succ in successors(insn, pos, &pos_of)? {
            if succ < insns.len() {
                merge(&mut frames, succ, out.clone(), &mut worklist)?;
            }
        }
    }

    Ok(frames)
}

fn merge(
    frames: &mut [Option<Frame>],
    pos: usize,
    incoming: Frame,
    worklist: &mut VecDeque<usize>,
) -> Result<()> {
    match &mut frames[pos] {
        slot @ None => {
            *slot = Some(incoming);
            worklist.push_back(pos);
        }
        Some(existing) => {
            if existing.stack.len() != incoming.stack.len() {
                return Err(AnalysisError::StackMismatch { pos });
            }
            let mut changed = false;
            for (old, new) in existing.stack.iter_mut().zip(&incoming.stack) {
                let joined = old.join(new);
                if joined != *old {
                    *old = joined;
                    changed = true;
                }
            }
            let len = existing.locals.len().max(incoming.locals.len());
            existing.locals.resize(len, ConstantValue::unknown(1));
            for (index, old) in existing.locals.iter_mut().enumerate() {
                let new = incoming
                    .locals
                    .get(index)
                    .cloned()
                    .unwrap_or(ConstantValue::unknown(1));
                let joined = old.join(&new);
                if joined != *old {
                    *old = joined;
                    changed = true;
                }
            }
            if changed {
                worklist.push_back(pos);
            }
        }
    }
    Ok(())
}

fn successors(
    insn: &Insn,
    pos: usize,
    pos_of: &impl Fn(LabelId) -> Result<usize>,
) -> Result<Vec<usize>> {
    Ok(match insn {
        Insn::Jump { op: GOTO, target } | Insn::Jump { op: JSR, target } => vec![pos_of(*target)?],
        Insn::Jump { target, .. } => vec![pos_of(*target)?, pos + 1],
        Insn::TableSwitch {
            default, targets, ..
        } => {
            let mut out = vec![pos_of(*default)?];
            for t in targets {
                out.push(pos_of(*t)?);
            }
            out
        }
        Insn::LookupSwitch { default, pairs } => {
            let mut out = vec![pos_of(*default)?];
            for (_, t) in pairs {
                out.push(pos_of(*t)?);
            }
            out
        }
        Insn::Simple(ATHROW) => vec![],
        Insn::Simple(op) if (IRETURN..=RETURN).contains(op) => vec![],
        Insn::Var { op: RET, .. } => vec![],
        _ => vec![pos + 1],
    })
}

struct Machine {
    frame: Frame,
    pos: usize,
}

impl Machine {
    fn push(&mut self, value: ConstantValue) {
        self.frame.stack.push(value);
    }

    fn push_known(&mut self, op: ConstOperand) {
        self.push(ConstantValue::Known(op));
    }

    fn pop(&mut self) -> Result<ConstantValue> {
        self.frame
            .stack
            .pop()
            .ok_or(AnalysisError::StackUnderflow { pos: self.pos })
    }

    /// Pops values totaling exactly `slots` stack slots.
    fn pop_slots(&mut self, slots: u16) -> Result<Vec<ConstantValue>> {
        let mut taken = 0u16;
        let mut values = Vec::new();
        while taken < slots {
            let value = self.pop()?;
            taken += value.size() as u16;
            values.push(value);
        }
        if taken != slots {
            return Err(AnalysisError::Malformed {
                pos: self.pos,
                reason: "wide value split across a slot boundary",
            });
        }
        Ok(values)
    }

    fn local(&self, var: u16) -> ConstantValue {
        self.frame
            .locals
            .get(var as usize)
            .cloned()
            .unwrap_or(ConstantValue::unknown(1))
    }

    fn set_local(&mut self, var: u16, value: ConstantValue) {
        let wide = value.size() == 2;
        let index = var as usize;
        let needed = index + 1 + wide as usize;
        if self.frame.locals.len() < needed {
            self.frame
                .locals
                .resize(needed, ConstantValue::unknown(1));
        }
        // overwriting the second slot of a wide value kills the pair
        if index > 0 && self.frame.locals[index - 1].size() == 2 {
            self.frame.locals[index - 1] = ConstantValue::unknown(1);
        }
        self.frame.locals[index] = value;
        if wide {
            self.frame.locals[index + 1] = ConstantValue::unknown(1);
        }
    }

    fn transfer(&mut self, insn: &Insn, handler: &dyn ConstantRefHandler) -> Result<()> {
        match insn {
            Insn::Label(_) | Insn::Line { .. } | Insn::Frame => {}
            Insn::Simple(op) => self.transfer_simple(*op)?,
            Insn::IntPush { value, .. } => self.push_known(ConstOperand::Int(*value)),
            Insn::Ldc(op) => self.push_known(op.clone()),
            Insn::Var { op, var } => match *op {
                ILOAD | LLOAD | FLOAD | DLOAD | ALOAD => {
                    let value = self.local(*var);
                    self.push(value);
                }
                ISTORE | LSTORE | FSTORE | DSTORE | ASTORE => {
                    let value = self.pop()?;
                    self.set_local(*var, value);
                }
                RET => {}
                _ => {
                    return Err(AnalysisError::Malformed {
                        pos: self.pos,
                        reason: "unexpected variable opcode",
                    })
                }
            },
            Insn::Iinc { var, delta } => {
                let value = match self.local(*var).as_int() {
                    Some(v) => ConstantValue::Known(ConstOperand::Int(v.wrapping_add(*delta as i32))),
                    None => ConstantValue::unknown(1),
                };
                self.set_local(*var, value);
            }
            Insn::Type { op, .. } => match *op {
                NEW => self.push(ConstantValue::unknown(1)),
                ANEWARRAY => {
                    self.pop()?;
                    self.push(ConstantValue::unknown(1));
                }
                CHECKCAST => {
                    let value = self.pop()?;
                    self.push(value);
                }
                INSTANCEOF => {
                    self.pop()?;
                    self.push(ConstantValue::unknown(1));
                }
                _ => {
                    return Err(AnalysisError::Malformed {
                        pos: self.pos,
                        reason: "unexpected type opcode",
                    })
                }
            },
            Insn::NewArray { .. } => {
                self.pop()?;
                self.push(ConstantValue::unknown(1));
            }
            Insn::MultiANewArray { dims, .. } => {
                for _ in 0..*dims {
                    self.pop()?;
                }
                self.push(ConstantValue::unknown(1));
            }
            Insn::Field {
                op,
                owner,
                name,
                desc,
            } => {
                let size = desc.parse::<FieldType>()?.size();
                match *op {
                    GETSTATIC | GETFIELD => {
                        if *op == GETFIELD {
                            self.pop()?;
                        }
                        match handler.field_value(owner, name, desc) {
                            Some(value) => self.push_known(value),
                            None => self.push(ConstantValue::unknown(size)),
                        }
                    }
                    PUTSTATIC | PUTFIELD => {
                        self.pop_slots(size as u16)?;
                        if *op == PUTFIELD {
                            self.pop()?;
                        }
                    }
                    _ => {
                        return Err(AnalysisError::Malformed {
                            pos: self.pos,
                            reason: "unexpected field opcode",
                        })
                    }
                }
            }
            Insn::Method {
                op,
                owner,
                name,
                desc,
            } => {
                let parsed: MethodDescriptor = desc.parse()?;
                let mut args = self.pop_slots(parsed.param_slots())?;
                args.reverse();
                if *op != INVOKESTATIC {
                    self.pop()?; // receiver
                }
                if let Some(ret) = &parsed.ret {
                    match handler.method_return(owner, name, desc, &args) {
                        Some(value) => self.push_known(value),
                        None => self.push(ConstantValue::unknown(ret.size())),
                    }
                }
            }
            Insn::InvokeDynamic { desc, .. } => {
                let parsed: MethodDescriptor = desc.parse()?;
                self.pop_slots(parsed.param_slots())?;
                if let Some(ret) = &parsed.ret {
                    self.push(ConstantValue::unknown(ret.size()));
                }
            }
            Insn::Jump { op, .. } => match *op {
                GOTO => {}
                JSR => self.push(ConstantValue::unknown(1)),
                IFEQ..=IFLE | IFNULL | IFNONNULL => {
                    self.pop()?;
                }
                IF_ICMPEQ..=IF_ACMPNE => {
                    self.pop()?;
                    self.pop()?;
                }
                _ => {
                    return Err(AnalysisError::Malformed {
                        pos: self.pos,
                        reason: "unexpected jump opcode",
                    })
                }
            },
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
                self.pop()?;
            }
        }
        Ok(())
    }

    fn transfer_simple(&mut self, op: u8) -> Result<()> {
        match op {
            NOP => {}
            ACONST_NULL => self.push_known(ConstOperand::Null),
            ICONST_M1..=ICONST_5 => {
                self.push_known(ConstOperand::Int(op as i32 - ICONST_0 as i32))
            }
            LCONST_0 | LCONST_1 => {
                self.push_known(ConstOperand::Long((op - LCONST_0) as i64))
            }
            FCONST_0 | FCONST_1 | FCONST_2 => {
                self.push_known(ConstOperand::Float((op - FCONST_0) as f32))
            }
            DCONST_0 | DCONST_1 => {
                self.push_known(ConstOperand::Double((op - DCONST_0) as f64))
            }
            IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD => {
                self.pop()?;
                self.pop()?;
                self.push(ConstantValue::unknown(1));
            }
            LALOAD | DALOAD => {
                self.pop()?;
                self.pop()?;
                self.push(ConstantValue::unknown(2));
            }
            IASTORE | LASTORE | FASTORE | DASTORE | AASTORE | BASTORE | CASTORE | SASTORE => {
                self.pop()?;
                self.pop()?;
                self.pop()?;
            }
            POP => {
                self.pop()?;
            }
            POP2 => {
                self.pop_slots(2)?;
            }
            DUP => {
                let top = self.pop()?;
                self.push(top.clone());
                self.push(top);
            }
            DUP_X1 => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a.clone());
                self.push(b);
                self.push(a);
            }
            DUP_X2 => {
                let a = self.pop()?;
                let under = self.pop_slots(2)?;
                self.push(a.clone());
                for value in under.into_iter().rev() {
                    self.push(value);
                }
                self.push(a);
            }
            DUP2 => {
                let top = self.pop_slots(2)?;
                for value in top.iter().rev() {
                    self.push(value.clone());
                }
                for value in top.into_iter().rev() {
                    self.push(value);
                }
            }
            DUP2_X1 => {
                let top = self.pop_slots(2)?;
                let under = self.pop()?;
                for value in top.iter().rev() {
                    self.push(value.clone());
                }
                self.push(under);
                for value in top.into_iter().rev() {
                    self.push(value);
                }
            }
            DUP2_X2 => {
                let top = self.pop_slots(2)?;
                let under = self.pop_slots(2)?;
                for value in top.iter().rev() {
                    self.push(value.clone());
                }
                for value in under.into_iter().rev() {
                    self.push(value);
                }
                for value in top.into_iter().rev() {
                    self.push(value);
                }
            }
            SWAP => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => {
                let b = self.pop()?;
                let a = self.pop()?;
                let folded = match (a.as_int(), b.as_int()) {
                    (Some(a), Some(b)) => fold_int(op, a, b),
                    _ => None,
                };
                match folded {
                    Some(v) => self.push_known(ConstOperand::Int(v)),
                    None => self.push(ConstantValue::unknown(1)),
                }
            }
            LADD | LSUB | LMUL | LDIV | LREM | LAND | LOR | LXOR => {
                let b = self.pop()?;
                let a = self.pop()?;
                let folded = match (a.as_long(), b.as_long()) {
                    (Some(a), Some(b)) => fold_long(op, a, b),
                    _ => None,
                };
                match folded {
                    Some(v) => self.push_known(ConstOperand::Long(v)),
                    None => self.push(ConstantValue::unknown(2)),
                }
            }
            LSHL | LSHR | LUSHR => {
                let shift = self.pop()?;
                let value = self.pop()?;
                let folded = match (value.as_long(), shift.as_int()) {
                    (Some(v), Some(s)) => Some(match op {
                        LSHL => v.wrapping_shl((s & 63) as u32),
                        LSHR => v.wrapping_shr((s & 63) as u32),
                        _ => ((v as u64) >> (s & 63)) as i64,
                    }),
                    _ => None,
                };
                match folded {
                    Some(v) => self.push_known(ConstOperand::Long(v)),
                    None => self.push(ConstantValue::unknown(2)),
                }
            }
            FADD | FSUB | FMUL | FDIV | FREM => {
                let b = self.pop()?;
                let a = self.pop()?;
                let folded = match (a.as_known(), b.as_known()) {
                    (Some(ConstOperand::Float(a)), Some(ConstOperand::Float(b))) => {
                        Some(match op {
                            FADD => a + b,
                            FSUB => a - b,
                            FMUL => a * b,
                            FDIV => a / b,
                            _ => a % b,
                        })
                    }
                    _ => None,
                };
                match folded {
                    Some(v) => self.push_known(ConstOperand::Float(v)),
                    None => self.push(ConstantValue::unknown(1)),
                }
            }
            DADD | DSUB | DMUL | DDIV | DREM => {
                let b = self.pop()?;
                let a = self.pop()?;
                let folded = match (a.as_known(), b.as_known()) {
                    (Some(ConstOperand::Double(a)), Some(ConstOperand::Double(b))) => {
                        Some(match op {
                            DADD => a + b,
                            DSUB => a - b,
                            DMUL => a * b,
                            DDIV => a / b,
                            _ => a % b,
                        })
                    }
                    _ => None,
                };
                match folded {
                    Some(v) => self.push_known(ConstOperand::Double(v)),
                    None => self.push(ConstantValue::unknown(2)),
                }
            }
            INEG => self.unary(|v| match v {
                ConstOperand::Int(a) => Some(ConstOperand::Int(a.wrapping_neg())),
                _ => None,
            }, 1)?,
            LNEG => self.unary(|v| match v {
                ConstOperand::Long(a) => Some(ConstOperand::Long(a.wrapping_neg())),
                _ => None,
            }, 2)?,
            FNEG => self.unary(|v| match v {
                ConstOperand::Float(a) => Some(ConstOperand::Float(-a)),
                _ => None,
            }, 1)?,
            DNEG => self.unary(|v| match v {
                ConstOperand::Double(a) => Some(ConstOperand::Double(-a)),
                _ => None,
            }, 2)?,
            I2L => self.unary(|v| v.as_i32().map(|a| ConstOperand::Long(a as i64)), 2)?,
            I2F => self.unary(|v| v.as_i32().map(|a| ConstOperand::Float(a as f32)), 1)?,
            I2D => self.unary(|v| v.as_i32().map(|a| ConstOperand::Double(a as f64)), 2)?,
            L2I => self.unary(|v| v.as_i64().map(|a| ConstOperand::Int(a as i32)), 1)?,
            L2F => self.unary(|v| v.as_i64().map(|a| ConstOperand::Float(a as f32)), 1)?,
            L2D => self.unary(|v| v.as_i64().map(|a| ConstOperand::Double(a as f64)), 2)?,
            F2I => self.unary(|v| v.as_f32().map(|a| ConstOperand::Int(a as i32)), 1)?,
            F2L => self.unary(|v| v.as_f32().map(|a| ConstOperand::Long(a as i64)), 2)?,
            F2D => self.unary(|v| v.as_f32().map(|a| ConstOperand::Double(a as f64)), 2)?,
            D2I => self.unary(|v| v.as_f64().map(|a| ConstOperand::Int(a as i32)), 1)?,
            D2L => self.unary(|v| v.as_f64().map(|a| ConstOperand::Long(a as i64)), 2)?,
            D2F => self.unary(|v| v.as_f64().map(|a| ConstOperand::Float(a as f32)), 1)?,
            I2B => self.unary(|v| v.as_i32().map(|a| ConstOperand::Int(a as i8 as i32)), 1)?,
            I2C => self.unary(|v| v.as_i32().map(|a| ConstOperand::Int(a as u16 as i32)), 1)?,
            I2S => self.unary(|v| v.as_i32().map(|a| ConstOperand::Int(a as i16 as i32)), 1)?,
            LCMP => {
                let b = self.pop()?;
                let a = self.pop()?;
                match (a.as_long(), b.as_long()) {
                    (Some(a), Some(b)) => {
                        self.push_known(ConstOperand::Int(match a.cmp(&b) {
                            std::cmp::Ordering::Less => -1,
                            std::cmp::Ordering::Equal => 0,
                            std::cmp::Ordering::Greater => 1,
                        }))
                    }
                    _ => self.push(ConstantValue::unknown(1)),
                }
            }
            FCMPL | FCMPG | DCMPL | DCMPG => {
                let b = self.pop()?;
                let a = self.pop()?;
                let cmp = match (a.as_known(), b.as_known()) {
                    (Some(ConstOperand::Float(a)), Some(ConstOperand::Float(b))) => {
                        Some(compare_floats(*a as f64, *b as f64, op == FCMPG || op == DCMPG))
                    }
                    (Some(ConstOperand::Double(a)), Some(ConstOperand::Double(b))) => {
                        Some(compare_floats(*a, *b, op == FCMPG || op == DCMPG))
                    }
                    _ => None,
                };
                match cmp {
                    Some(v) => self.push_known(ConstOperand::Int(v)),
                    None => self.push(ConstantValue::unknown(1)),
                }
            }
            IRETURN | FRETURN | ARETURN => {
                self.pop()?;
            }
            LRETURN | DRETURN => {
                self.pop_slots(2)?;
            }
            RETURN => {}
            ARRAYLENGTH => {
                self.pop()?;
                self.push(ConstantValue::unknown(1));
            }
            ATHROW | MONITORENTER | MONITOREXIT => {
                self.pop()?;
            }
            _ => {
                return Err(AnalysisError::Malformed {
                    pos: self.pos,
                    reason: "unexpected bare opcode",
                })
            }
        }
        Ok(())
    }

    fn unary(
        &mut self,
        fold: impl Fn(&ConstOperand) -> Option<ConstOperand>,
        result_size: u8,
    ) -> Result<()> {
        let value = self.pop()?;
        match value.as_known().and_then(&fold) {
            Some(folded) => self.push_known(folded),
            None => self.push(ConstantValue::unknown(result_size)),
        }
        Ok(())
    }
}

fn compare_floats(a: f64, b: f64, nan_is_one: bool) -> i32 {
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => {
            if nan_is_one {
                1
            } else {
                -1
            }
        }
    }
}

fn fold_int(op: u8, a: i32, b: i32) -> Option<i32> {
    Some(match op {
        IADD => a.wrapping_add(b),
        ISUB => a.wrapping_sub(b),
        IMUL => a.wrapping_mul(b),
        IDIV if b != 0 => a.wrapping_div(b),
        IREM if b != 0 => a.wrapping_rem(b),
        ISHL => a.wrapping_shl((b & 31) as u32),
        ISHR => a.wrapping_shr((b & 31) as u32),
        IUSHR => ((a as u32) >> (b & 31) as u32) as i32,
        IAND => a & b,
        IOR => a | b,
        IXOR => a ^ b,
        _ => return None,
    })
}

fn fold_long(op: u8, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        LADD => a.wrapping_add(b),
        LSUB => a.wrapping_sub(b),
        LMUL => a.wrapping_mul(b),
        LDIV if b != 0 => a.wrapping_div(b),
        LREM if b != 0 => a.wrapping_rem(b),
        LAND => a & b,
        LOR => a | b,
        LXOR => a ^ b,
        _ => return None,
    })
}

trait AsPrimitive {
    fn as_i32(&self) -> Option<i32>;
    fn as_i64(&self) -> Option<i64>;
    fn as_f32(&self) -> Option<f32>;
    fn as_f64(&self) -> Option<f64>;
}

impl AsPrimitive for ConstOperand {
    fn as_i32(&self) -> Option<i32> {
        match self {
            ConstOperand::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            ConstOperand::Long(v) => Some(*v),
            _ => None,
        }
    }

    fn as_f32(&self) -> Option<f32> {
        match self {
            ConstOperand::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ConstOperand::Double(v) => Some(*v),
            _ => None,
        }
    }
}
