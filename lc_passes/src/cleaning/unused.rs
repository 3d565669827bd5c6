//! Unused class removal.
//!
//! Reachability starts at every class declaring a `public static
//! main([Ljava/lang/String;)V` and follows method references, field
//! references, type references, constant class and method-handle operands,
//! bootstrap methods, hierarchy edges, and catch types. Whatever no root
//! reaches is dropped from the universe.

use crate::{Category, Pass, PassContext, PassInfo, PassTags, Result};
use lc_ir::{ClassNode, ConstOperand, Handle, Insn, MethodAccess, Universe};
use std::collections::{HashSet, VecDeque};

static INFO: PassInfo = PassInfo {
    id: "remove-unused-classes",
    name: "Unused class removal",
    category: Category::Cleaning,
    description: "Drops classes not reachable from any main entry point.",
    tags: PassTags::SHRINK.union(PassTags::POSSIBLE_DAMAGE),
};

pub struct UnusedClassRemoval {
    removed: usize,
}

impl UnusedClassRemoval {
    pub fn new() -> Self {
        Self { removed: 0 }
    }
}

impl Default for UnusedClassRemoval {
    fn default() -> Self {
        Self::new()
    }
}

fn is_root(class: &ClassNode) -> bool {
    class.methods.iter().any(|m| {
        m.name == "main"
            && m.desc == "([Ljava/lang/String;)V"
            && m.access
                .contains(MethodAccess::PUBLIC | MethodAccess::STATIC)
    })
}

/// The class named by a type operand: array layers and the `L...;` wrapper
/// are peeled off, primitives yield nothing.
fn named_class(ty: &str) -> Option<String> {
    let mut inner = ty;
    while let Some(stripped) = inner.strip_prefix('[') {
        inner = stripped;
    }
    if let Some(object) = inner.strip_prefix('L').and_then(|s| s.strip_suffix(';')) {
        return Some(object.to_string());
    }
    if inner.len() > 1 {
        return Some(inner.to_string());
    }
    None
}

fn handle_edges(handle: &Handle, out: &mut HashSet<String>) {
    out.insert(handle.owner.clone());
}

fn class_edges(class: &ClassNode) -> HashSet<String> {
    let mut out = HashSet::new();
    if let Some(super_name) = &class.super_name {
        out.insert(super_name.clone());
    }
    out.extend(class.interfaces.iter().cloned());
    for method in &class.methods {
        out.extend(method.exceptions.iter().cloned());
        for tc in &method.try_catches {
            if let Some(catch) = &tc.catch_type {
                out.insert(catch.clone());
            }
        }
        for insn in &method.insns {
            match insn {
                Insn::Method { owner, .. } | Insn::Field { owner, .. } => {
                    if let Some(name) = named_class(owner) {
                        out.insert(name);
                    }
                }
                Insn::Type { ty, .. } => {
                    if let Some(name) = named_class(ty) {
                        out.insert(name);
                    }
                }
                Insn::MultiANewArray { desc, .. } => {
                    if let Some(name) = named_class(desc) {
                        out.insert(name);
                    }
                }
                Insn::Ldc(ConstOperand::Class(ty)) => {
                    if let Some(name) = named_class(ty) {
                        out.insert(name);
                    }
                }
                Insn::Ldc(ConstOperand::MethodHandle(handle)) => handle_edges(handle, &mut out),
                Insn::InvokeDynamic {
                    bootstrap, args, ..
                } => {
                    handle_edges(bootstrap, &mut out);
                    for arg in args {
                        match arg {
                            ConstOperand::Class(ty) => {
                                if let Some(name) = named_class(ty) {
                                    out.insert(name);
                                }
                            }
                            ConstOperand::MethodHandle(handle) => handle_edges(handle, &mut out),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }
    out
}

impl Pass for UnusedClassRemoval {
    fn info(&self) -> &'static PassInfo {
        &INFO
    }

    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool> {
        self.removed = 0;

        let mut worklist: VecDeque<String> = universe
            .iter()
            .filter(|(_, record)| is_root(&record.node))
            .map(|(name, _)| name.clone())
            .collect();
        if worklist.is_empty() {
            log::warn!("no main entry points found; not removing anything");
            return Ok(false);
        }

        let mut reachable: HashSet<String> = worklist.iter().cloned().collect();
        while let Some(name) = worklist.pop_front() {
            if ctx.cancelled() {
                return Ok(false);
            }
            let Some(record) = universe.get(&name) else {
                continue;
            };
            for edge in class_edges(&record.node) {
                if universe.contains(&edge) && reachable.insert(edge.clone()) {
                    worklist.push_back(edge);
                }
            }
        }

        for name in universe.names() {
            if !reachable.contains(&name) {
                universe.remove(&name);
                self.removed += 1;
                if ctx.verbose {
                    log::debug!("removed unreachable class {}", name);
                }
            }
        }

        log::info!("unused classes: {} removed", self.removed);
        Ok(self.removed > 0)
    }
}
