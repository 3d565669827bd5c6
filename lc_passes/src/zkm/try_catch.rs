//! Fake try/catch removal.
//!
//! ZKM wraps regions in handlers whose body immediately rethrows (plain
//! `ATHROW`, or an `INVOKESTATIC` feeding an `ATHROW`). The region never
//! throws the handler's type in practice; the handler only exists to wreck
//! decompiler output, so dropping the table entry preserves behavior.

use crate::{Category, Pass, PassContext, PassInfo, PassTags, Result};
use lc_ir::opcodes::{ATHROW, INVOKESTATIC};
use lc_ir::{Insn, MethodNode, Universe};

static INFO: PassInfo = PassInfo {
    id: "zkm-remove-fake-try-catch",
    name: "ZKM fake try/catch removal",
    category: Category::Zkm,
    description: "Removes exception handlers that only rethrow, planted to \
                  confuse decompilers.",
    tags: PassTags::BETTER_DECOMPILE.union(PassTags::BETTER_DEOBFUSCATE),
};

pub struct FakeTryCatchRemoval {
    removed: usize,
}

impl FakeTryCatchRemoval {
    pub fn new() -> Self {
        Self { removed: 0 }
    }
}

impl Default for FakeTryCatchRemoval {
    fn default() -> Self {
        Self::new()
    }
}

fn is_fake_handler(method: &MethodNode, handler: lc_ir::LabelId) -> bool {
    let Some(first) = method.first_insn_at(handler) else {
        return false;
    };
    match method.insns[first].opcode() {
        Some(ATHROW) => true,
        Some(INVOKESTATIC) => {
            let next = (first + 1..method.insns.len())
                .find(|&i| method.insns[i].is_real());
            matches!(
                next.map(|i| &method.insns[i]),
                Some(Insn::Simple(ATHROW))
            )
        }
        _ => false,
    }
}

impl Pass for FakeTryCatchRemoval {
    fn info(&self) -> &'static PassInfo {
        &INFO
    }

    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool> {
        self.removed = 0;

        for class_name in universe.names() {
            if ctx.cancelled() {
                break;
            }
            let Some(record) = universe.get_mut(&class_name) else {
                continue;
            };
            for method in &mut record.node.methods {
                let fake: Vec<bool> = method
                    .try_catches
                    .iter()
                    .map(|tc| is_fake_handler(method, tc.handler))
                    .collect();
                let mut keep = fake.iter().map(|f| !f);
                method.try_catches.retain(|_| keep.next().unwrap_or(true));
                self.removed += fake.iter().filter(|f| **f).count();
            }
        }

        if ctx.verbose {
            log::debug!("removed {} fake handlers", self.removed);
        }
        log::info!("fake try/catch: {} handlers removed", self.removed);
        Ok(self.removed > 0)
    }
}
