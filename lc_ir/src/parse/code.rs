//! Bytecode decoding: the `Code` attribute byte array becomes the
//! label-anchored instruction list.

use super::{BootstrapMethod, Pool, RawCode};
use crate::class::{LocalVar, MethodNode, TryCatch};
use crate::insn::{Insn, LabelId, LabelMap};
use crate::opcodes::*;
use crate::{IrError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Decodes `raw` into `method`. Jump and handler offsets must land on
/// instruction boundaries; debug entries with stray offsets are dropped.
pub(super) fn decode(
    method: &mut MethodNode,
    raw: &RawCode,
    pool: &Pool,
    bsms: &[BootstrapMethod],
) -> Result<()> {
    let code = &raw.code;
    let mut reader = Reader { code, pos: 0 };

    // First walk: decode every instruction, with branch targets smuggled
    // through as offset-valued labels, and remember the boundaries.
    let mut decoded = Vec::new();
    let mut boundaries = BTreeSet::new();
    let mut targets = BTreeSet::new();
    while reader.pos < code.len() {
        let start = reader.pos;
        boundaries.insert(start);
        let insn = reader.decode_one(start, pool, bsms)?;
        collect_targets(&insn, &mut targets);
        decoded.push((start, insn));
    }
    boundaries.insert(code.len());

    for exc in &raw.exceptions {
        targets.insert(exc.start as usize);
        targets.insert(exc.end as usize);
        targets.insert(exc.handler as usize);
    }
    for &target in &targets {
        if !boundaries.contains(&target) {
            return Err(IrError::BadBranchTarget { target });
        }
    }

    // Debug offsets only become labels when they hit a boundary.
    let mut lines: BTreeMap<usize, Vec<u16>> = BTreeMap::new();
    for &(start, line) in &raw.lines {
        if boundaries.contains(&(start as usize)) {
            lines.entry(start as usize).or_default().push(line);
        }
    }
    let vars: Vec<_> = raw
        .vars
        .iter()
        .filter(|v| {
            boundaries.contains(&(v.start as usize))
                && boundaries.contains(&(v.start as usize + v.len as usize))
        })
        .collect();

    let mut label_offsets = targets;
    label_offsets.extend(lines.keys().copied());
    for v in &vars {
        label_offsets.insert(v.start as usize);
        label_offsets.insert(v.start as usize + v.len as usize);
    }

    let mut labels = BTreeMap::new();
    let mut remap = LabelMap::default();
    for &offset in &label_offsets {
        let label = method.new_label();
        labels.insert(offset, label);
        remap.insert(LabelId(offset as u32), label);
    }

    let mut insns = Vec::with_capacity(decoded.len() + labels.len());
    for (offset, insn) in decoded {
        if let Some(&label) = labels.get(&offset) {
            insns.push(Insn::Label(label));
            for &line in lines.get(&offset).into_iter().flatten() {
                insns.push(Insn::Line { line, start: label });
            }
        }
        insns.push(insn.clone_remapped(&remap));
    }
    if let Some(&label) = labels.get(&code.len()) {
        insns.push(Insn::Label(label));
    }

    method.insns = insns;
    method.max_stack = raw.max_stack;
    method.max_locals = raw.max_locals;
    method.try_catches = raw
        .exceptions
        .iter()
        .map(|exc| TryCatch {
            start: labels[&(exc.start as usize)],
            end: labels[&(exc.end as usize)],
            handler: labels[&(exc.handler as usize)],
            catch_type: exc.catch_type.clone(),
        })
        .collect();
    method.local_vars = vars
        .into_iter()
        .map(|v| LocalVar {
            name: v.name.clone(),
            desc: v.desc.clone(),
            signature: None,
            start: labels[&(v.start as usize)],
            end: labels[&(v.start as usize + v.len as usize)],
            index: v.index,
        })
        .collect();
    Ok(())
}

fn collect_targets(insn: &Insn, targets: &mut BTreeSet<usize>) {
    match insn {
        Insn::Jump { target, .. } => {
            targets.insert(target.0 as usize);
        }
        Insn::TableSwitch {
            default, targets: t, ..
        } => {
            targets.insert(default.0 as usize);
            targets.extend(t.iter().map(|l| l.0 as usize));
        }
        Insn::LookupSwitch { default, pairs } => {
            targets.insert(default.0 as usize);
            targets.extend(pairs.iter().map(|(_, l)| l.0 as usize));
        }
        _ => {}
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn eof(&self) -> IrError {
        IrError::UnexpectedEof { offset: self.pos }
    }

    fn u1(&mut self) -> Result<u8> {
        let b = self.code.get(self.pos).copied().ok_or_else(|| self.eof())?;
        self.pos += 1;
        Ok(b)
    }

    fn u2(&mut self) -> Result<u16> {
        Ok(((self.u1()? as u16) << 8) | self.u1()? as u16)
    }

    fn i1(&mut self) -> Result<i8> {
        Ok(self.u1()? as i8)
    }

    fn i2(&mut self) -> Result<i16> {
        Ok(self.u2()? as i16)
    }

    fn i4(&mut self) -> Result<i32> {
        Ok((((self.u2()? as u32) << 16) | self.u2()? as u32) as i32)
    }

    /// A branch target as an offset-valued label; resolved to a real label
    /// after the first walk.
    fn target(&self, start: usize, delta: i64) -> Result<LabelId> {
        let target = start as i64 + delta;
        if !(0..=self.code.len() as i64).contains(&target) {
            return Err(IrError::BadBranchTarget {
                target: target.unsigned_abs() as usize,
            });
        }
        Ok(LabelId(target as u32))
    }

    fn decode_one(&mut self, start: usize, pool: &Pool, bsms: &[BootstrapMethod]) -> Result<Insn> {
        let op = self.u1()?;
        Ok(match op {
            NOP..=DCONST_1 => Insn::Simple(op),
            BIPUSH => Insn::IntPush {
                op,
                value: self.i1()? as i32,
            },
            SIPUSH => Insn::IntPush {
                op,
                value: self.i2()? as i32,
            },
            LDC => Insn::Ldc(pool.loadable(self.u1()? as u16)?),
            LDC_W | LDC2_W => Insn::Ldc(pool.loadable(self.u2()?)?),
            ILOAD..=ALOAD => Insn::Var {
                op,
                var: self.u1()? as u16,
            },
            ILOAD_0..=ALOAD_3 => Insn::Var {
                op: ILOAD + (op - ILOAD_0) / 4,
                var: ((op - ILOAD_0) % 4) as u16,
            },
            IALOAD..=SALOAD => Insn::Simple(op),
            ISTORE..=ASTORE => Insn::Var {
                op,
                var: self.u1()? as u16,
            },
            ISTORE_0..=ASTORE_3 => Insn::Var {
                op: ISTORE + (op - ISTORE_0) / 4,
                var: ((op - ISTORE_0) % 4) as u16,
            },
            IASTORE..=SASTORE => Insn::Simple(op),
            POP..=LXOR => Insn::Simple(op),
            IINC => Insn::Iinc {
                var: self.u1()? as u16,
                delta: self.i1()? as i16,
            },
            I2L..=DCMPG => Insn::Simple(op),
            IFEQ..=JSR => {
                let delta = self.i2()? as i64;
                Insn::Jump {
                    op,
                    target: self.target(start, delta)?,
                }
            }
            RET => Insn::Var {
                op,
                var: self.u1()? as u16,
            },
            TABLESWITCH => {
                self.align()?;
                let default_delta = self.i4()? as i64;
                let default = self.target(start, default_delta)?;
                let lo = self.i4()?;
                let hi = self.i4()?;
                if hi < lo {
                    return Err(IrError::BadOpcode { opcode: op, offset: start });
                }
                let mut jump_targets = Vec::with_capacity((hi - lo + 1) as usize);
                for _ in lo..=hi {
                    let delta = self.i4()? as i64;
                    jump_targets.push(self.target(start, delta)?);
                }
                Insn::TableSwitch {
                    lo,
                    hi,
                    default,
                    targets: jump_targets,
                }
            }
            LOOKUPSWITCH => {
                self.align()?;
                let default_delta = self.i4()? as i64;
                let default = self.target(start, default_delta)?;
                let npairs = self.i4()?;
                if npairs < 0 {
                    return Err(IrError::BadOpcode { opcode: op, offset: start });
                }
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = self.i4()?;
                    let delta = self.i4()? as i64;
                    pairs.push((key, self.target(start, delta)?));
                }
                Insn::LookupSwitch { default, pairs }
            }
            IRETURN..=RETURN => Insn::Simple(op),
            GETSTATIC..=PUTFIELD => {
                let (owner, name, desc) = pool.member_ref(self.u2()?)?;
                Insn::Field {
                    op,
                    owner,
                    name,
                    desc,
                }
            }
            INVOKEVIRTUAL..=INVOKEINTERFACE => {
                let (owner, name, desc) = pool.member_ref(self.u2()?)?;
                if op == INVOKEINTERFACE {
                    self.u1()?; // count
                    self.u1()?; // zero
                }
                Insn::Method {
                    op,
                    owner,
                    name,
                    desc,
                }
            }
            INVOKEDYNAMIC => {
                let (bsm_index, name, desc) = pool.invoke_dynamic(self.u2()?)?;
                self.u2()?; // two zero bytes
                let bsm = bsms
                    .get(bsm_index as usize)
                    .ok_or(IrError::BadBootstrapIndex { index: bsm_index })?;
                Insn::InvokeDynamic {
                    name,
                    desc,
                    bootstrap: bsm.handle.clone(),
                    args: bsm.args.clone(),
                }
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Insn::Type {
                op,
                ty: pool.class_name(self.u2()?)?.to_string(),
            },
            NEWARRAY => Insn::NewArray { elem: self.u1()? },
            ARRAYLENGTH | ATHROW | MONITORENTER | MONITOREXIT => Insn::Simple(op),
            WIDE => {
                let wide_op = self.u1()?;
                match wide_op {
                    ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var {
                        op: wide_op,
                        var: self.u2()?,
                    },
                    IINC => Insn::Iinc {
                        var: self.u2()?,
                        delta: self.i2()?,
                    },
                    opcode => {
                        return Err(IrError::BadOpcode {
                            opcode,
                            offset: start,
                        })
                    }
                }
            }
            MULTIANEWARRAY => Insn::MultiANewArray {
                desc: pool.class_name(self.u2()?)?.to_string(),
                dims: self.u1()?,
            },
            IFNULL | IFNONNULL => {
                let delta = self.i2()? as i64;
                Insn::Jump {
                    op,
                    target: self.target(start, delta)?,
                }
            }
            GOTO_W | JSR_W => {
                let delta = self.i4()? as i64;
                Insn::Jump {
                    op: if op == GOTO_W { GOTO } else { JSR },
                    target: self.target(start, delta)?,
                }
            }
            opcode => {
                return Err(IrError::BadOpcode {
                    opcode,
                    offset: start,
                })
            }
        })
    }

    /// Skips switch padding up to the next 4-byte boundary of the code array.
    fn align(&mut self) -> Result<()> {
        while self.pos % 4 != 0 {
            self.u1()?;
        }
        Ok(())
    }
}
