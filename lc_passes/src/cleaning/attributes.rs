//! Debug attribute stripping.

use crate::{Category, Pass, PassContext, PassInfo, PassTags, Result};
use lc_ir::{Insn, Universe};

static INFO: PassInfo = PassInfo {
    id: "strip-debug-attributes",
    name: "Debug attribute stripping",
    category: Category::Cleaning,
    description: "Drops source file names, line tables, local variable \
                  tables, generic signatures and frame markers.",
    tags: PassTags::SHRINK.union(PassTags::POSSIBLE_DAMAGE),
};

pub struct DebugAttributeStripping {
    stripped: usize,
}

impl DebugAttributeStripping {
    pub fn new() -> Self {
        Self { stripped: 0 }
    }
}

impl Default for DebugAttributeStripping {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for DebugAttributeStripping {
    fn info(&self) -> &'static PassInfo {
        &INFO
    }

    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool> {
        self.stripped = 0;

        for class_name in universe.names() {
            if ctx.cancelled() {
                break;
            }
            let Some(record) = universe.get_mut(&class_name) else {
                continue;
            };
            let node = &mut record.node;
            if node.source_file.take().is_some() {
                self.stripped += 1;
            }
            for field in &mut node.fields {
                if field.signature.take().is_some() {
                    self.stripped += 1;
                }
            }
            for method in &mut node.methods {
                if method.signature.take().is_some() {
                    self.stripped += 1;
                }
                if !method.local_vars.is_empty() {
                    self.stripped += method.local_vars.len();
                    method.local_vars.clear();
                }
                let before = method.insns.len();
                method
                    .insns
                    .retain(|insn| !matches!(insn, Insn::Line { .. } | Insn::Frame));
                self.stripped += before - method.insns.len();
            }
        }

        if ctx.verbose {
            log::debug!("stripped {} debug entries", self.stripped);
        }
        log::info!("attribute stripper: {} entries removed", self.stripped);
        Ok(self.stripped > 0)
    }
}
