//! Constant static field inlining.
//!
//! Runs each class's (merged) static initializer in the sandbox, reads the
//! resulting static field values back, and folds loads of fields nothing
//! else ever writes into plain constant pushes. The fields themselves stay;
//! enum classes are left alone entirely.

use crate::helpers::{const_push, merge_static_initializers, value_to_const};
use crate::{Category, Pass, PassContext, PassInfo, PassTags, Result, UniverseHandler};
use lc_ir::opcodes::*;
use lc_ir::{ConstOperand, Insn, InstructionModifier, Universe};
use lc_vm::Vm;
use std::collections::{HashMap, HashSet};

static INFO: PassInfo = PassInfo {
    id: "inline-constant-fields",
    name: "Constant field inlining",
    category: Category::Cleaning,
    description: "Runs static initializers in the sandbox and replaces loads \
                  of effectively-constant static fields with the constants.",
    tags: PassTags::RUNNABLE
        .union(PassTags::BETTER_DECOMPILE)
        .union(PassTags::BETTER_DEOBFUSCATE),
};

pub struct ConstantFieldInlining {
    merged: usize,
    folded: usize,
    replaced: usize,
}

impl ConstantFieldInlining {
    pub fn new() -> Self {
        Self {
            merged: 0,
            folded: 0,
            replaced: 0,
        }
    }
}

impl Default for ConstantFieldInlining {
    fn default() -> Self {
        Self::new()
    }
}

/// Static fields written anywhere outside their own class's initializer.
fn written_outside_initializer(universe: &Universe) -> HashSet<(String, String)> {
    let mut written = HashSet::new();
    for (class_name, record) in universe.iter() {
        for method in &record.node.methods {
            let in_own_clinit = method.is_static_initializer();
            for insn in &method.insns {
                if let Insn::Field {
                    op: PUTSTATIC | PUTFIELD,
                    owner,
                    name,
                    ..
                } = insn
                {
                    if !(in_own_clinit && owner == class_name) {
                        written.insert((owner.clone(), name.clone()));
                    }
                }
            }
        }
    }
    written
}

impl Pass for ConstantFieldInlining {
    fn info(&self) -> &'static PassInfo {
        &INFO
    }

    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool> {
        self.merged = 0;
        self.folded = 0;
        self.replaced = 0;

        for name in universe.names() {
            if let Some(record) = universe.get_mut(&name) {
                if merge_static_initializers(&mut record.node) {
                    self.merged += 1;
                }
            }
        }

        let written = written_outside_initializer(universe);
        let mut constants: HashMap<(String, String, String), ConstOperand> = HashMap::new();
        let mut failures: Vec<(String, String)> = Vec::new();

        for name in universe.names() {
            if ctx.cancelled() {
                break;
            }
            let Some(record) = universe.get(&name) else {
                continue;
            };
            if record.node.is_enum() {
                continue;
            }
            let eligible: Vec<_> = record
                .node
                .fields
                .iter()
                .filter(|f| f.is_static() && !written.contains(&(name.clone(), f.name.clone())))
                .map(|f| (f.name.clone(), f.desc.clone()))
                .collect();
            if eligible.is_empty() {
                continue;
            }

            let handler = UniverseHandler::new(universe);
            let vm = Vm::new(&handler);
            if let Err(error) = vm.initialize_class(&name) {
                failures.push((name.clone(), format!("static initializer failed: {}", error)));
                continue;
            }
            for (field_name, field_desc) in eligible {
                let Some(value) = vm.static_field(&name, &field_name, &field_desc) else {
                    continue;
                };
                if let Some(constant) = value_to_const(&value) {
                    constants.insert((name.clone(), field_name, field_desc), constant);
                    self.folded += 1;
                }
            }
        }

        for (class, message) in failures {
            if let Some(record) = universe.get_mut(&class) {
                record.fail(message);
            }
        }
        if constants.is_empty() {
            return Ok(self.merged > 0);
        }

        for class_name in universe.names() {
            let Some(record) = universe.get_mut(&class_name) else {
                continue;
            };
            for method in &mut record.node.methods {
                let mut mods = InstructionModifier::new();
                for (pos, insn) in method.insns.iter().enumerate() {
                    let Insn::Field {
                        op: GETSTATIC,
                        owner,
                        name,
                        desc,
                    } = insn
                    else {
                        continue;
                    };
                    let key = (owner.clone(), name.clone(), desc.clone());
                    if let Some(constant) = constants.get(&key) {
                        mods.replace(pos, vec![const_push(constant)]);
                        self.replaced += 1;
                    }
                }
                mods.apply(method);
            }
        }

        if ctx.verbose {
            log::debug!(
                "merged {} initializers, {} constant fields, {} loads replaced",
                self.merged,
                self.folded,
                self.replaced
            );
        }
        log::info!(
            "constant fields: {} folded, {} loads rewritten",
            self.folded,
            self.replaced
        );
        Ok(self.merged > 0 || self.replaced > 0)
    }
}
