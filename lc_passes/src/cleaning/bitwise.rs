//! Bitwise operation folding.
//!
//! Obfuscators hide small constants behind `AND`/`OR`/`XOR`/shift chains.
//! Where the constant analyzer proves both operands, the operation and its
//! operand pushes collapse into one optimally-encoded constant push.

use crate::helpers::const_push;
use crate::{Category, Pass, PassContext, PassInfo, PassTags, Result};
use lc_analysis::{analyze, ConstantValue, NoRefs};
use lc_ir::opcodes::*;
use lc_ir::{ConstOperand, Insn, InstructionModifier, Universe};

static INFO: PassInfo = PassInfo {
    id: "simplify-bitwise",
    name: "Bitwise simplification",
    category: Category::Cleaning,
    description: "Folds bitwise operations over known constants into \
                  constant pushes.",
    tags: PassTags::BETTER_DECOMPILE.union(PassTags::BETTER_DEOBFUSCATE),
};

pub struct BitwiseSimplification {
    folded: usize,
}

impl BitwiseSimplification {
    pub fn new() -> Self {
        Self { folded: 0 }
    }
}

impl Default for BitwiseSimplification {
    fn default() -> Self {
        Self::new()
    }
}

fn fold(op: u8, a: &ConstantValue, b: &ConstantValue) -> Option<ConstOperand> {
    match op {
        IAND | IOR | IXOR | ISHL | ISHR | IUSHR => {
            let (a, b) = (a.as_int()?, b.as_int()?);
            Some(ConstOperand::Int(match op {
                IAND => a & b,
                IOR => a | b,
                IXOR => a ^ b,
                ISHL => a.wrapping_shl((b & 31) as u32),
                ISHR => a.wrapping_shr((b & 31) as u32),
                _ => ((a as u32) >> (b & 31) as u32) as i32,
            }))
        }
        LAND | LOR | LXOR => {
            let (a, b) = (a.as_long()?, b.as_long()?);
            Some(ConstOperand::Long(match op {
                LAND => a & b,
                LOR => a | b,
                _ => a ^ b,
            }))
        }
        LSHL | LSHR | LUSHR => {
            let (a, b) = (a.as_long()?, b.as_int()?);
            Some(ConstOperand::Long(match op {
                LSHL => a.wrapping_shl((b & 63) as u32),
                LSHR => a.wrapping_shr((b & 63) as u32),
                _ => ((a as u64) >> (b & 63) as u64) as i64,
            }))
        }
        _ => None,
    }
}

/// Whether the instruction is a pure constant push the folder may delete.
fn is_const_push(insn: &Insn) -> bool {
    match insn {
        Insn::IntPush { .. } | Insn::Ldc(_) => true,
        Insn::Simple(op) => matches!(*op, ACONST_NULL..=DCONST_1),
        _ => false,
    }
}

impl Pass for BitwiseSimplification {
    fn info(&self) -> &'static PassInfo {
        &INFO
    }

    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool> {
        self.folded = 0;

        for class_name in universe.names() {
            if ctx.cancelled() {
                break;
            }
            let Some(record) = universe.get_mut(&class_name) else {
                continue;
            };
            for method in &mut record.node.methods {
                let Ok(frames) = analyze(method, &NoRefs) else {
                    continue;
                };
                let mut mods = InstructionModifier::new();
                for (pos, insn) in method.insns.iter().enumerate() {
                    let Insn::Simple(op) = insn else { continue };
                    let Some(frame) = frames.get(pos).and_then(|f| f.as_ref()) else {
                        continue;
                    };
                    let (Some(b), Some(a)) = (frame.peek(0), frame.peek(1)) else {
                        continue;
                    };
                    let Some(folded) = fold(*op, a, b) else { continue };

                    // the common shape: the two pushes sit right before the
                    // operation and can be deleted outright
                    let prev: Vec<usize> = method.insns[..pos]
                        .iter()
                        .enumerate()
                        .rev()
                        .filter(|(_, i)| i.is_real())
                        .take(2)
                        .map(|(i, _)| i)
                        .collect();
                    let adjacent = prev.len() == 2
                        && prev.iter().all(|&i| is_const_push(&method.insns[i]));
                    if adjacent {
                        mods.remove(prev[0]);
                        mods.remove(prev[1]);
                        mods.replace(pos, vec![const_push(&folded)]);
                    } else {
                        let mut replacement = Vec::new();
                        replacement.push(Insn::Simple(if b.size() == 2 { POP2 } else { POP }));
                        replacement.push(Insn::Simple(if a.size() == 2 { POP2 } else { POP }));
                        replacement.push(const_push(&folded));
                        mods.replace(pos, replacement);
                    }
                    self.folded += 1;
                }
                mods.apply(method);
            }
        }

        if ctx.verbose {
            log::debug!("folded {} bitwise operations", self.folded);
        }
        log::info!("bitwise simplifier: {} operations folded", self.folded);
        Ok(self.folded > 0)
    }
}
