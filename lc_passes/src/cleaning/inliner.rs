//! Trivial method inlining.
//!
//! Obfuscators shred methods into single-expression helpers; pulling those
//! back into their callers restores readable bodies. Only methods that are
//! straight-line, small, and free of any outward reference qualify.

use crate::{Category, Pass, PassContext, PassInfo, PassTags, Result};
use lc_ir::opcodes::*;
use lc_ir::{
    ConstOperand, FieldType, Insn, InstructionModifier, MethodDescriptor, MethodNode, Universe,
};
use std::collections::{HashMap, HashSet};

const MAX_CALLEE_INSNS: usize = 32;

static INFO: PassInfo = PassInfo {
    id: "inline-trivial-methods",
    name: "Trivial method inlining",
    category: Category::Cleaning,
    description: "Inlines tiny straight-line methods into their call sites \
                  and removes the emptied-out methods.",
    tags: PassTags::SHRINK
        .union(PassTags::BETTER_DECOMPILE)
        .union(PassTags::BETTER_DEOBFUSCATE),
};

pub struct TrivialMethodInlining {
    inlined: usize,
    removed: usize,
}

impl TrivialMethodInlining {
    pub fn new() -> Self {
        Self {
            inlined: 0,
            removed: 0,
        }
    }
}

impl Default for TrivialMethodInlining {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct Callee {
    owner: String,
    method: MethodNode,
}

impl Callee {
    fn key(&self) -> (String, String, String) {
        (
            self.owner.clone(),
            self.method.name.clone(),
            self.method.desc.clone(),
        )
    }
}

fn is_trivial(method: &MethodNode) -> bool {
    if method.is_constructor() || method.is_static_initializer() {
        return false;
    }
    if method.insns.is_empty() || !method.try_catches.is_empty() {
        return false;
    }
    if method.real_insn_count() > MAX_CALLEE_INSNS {
        return false;
    }
    let mut last_real = None;
    for insn in &method.insns {
        match insn {
            Insn::Method { .. }
            | Insn::Field { .. }
            | Insn::InvokeDynamic { .. }
            | Insn::Type { .. }
            | Insn::NewArray { .. }
            | Insn::MultiANewArray { .. }
            | Insn::Jump { .. }
            | Insn::TableSwitch { .. }
            | Insn::LookupSwitch { .. } => return false,
            real if real.is_real() => last_real = Some(real),
            _ => {}
        }
    }
    matches!(
        last_real.and_then(Insn::opcode),
        Some(IRETURN..=RETURN) | Some(ATHROW)
    )
}

fn store_op(ty: &FieldType) -> u8 {
    match ty {
        FieldType::Long => LSTORE,
        FieldType::Float => FSTORE,
        FieldType::Double => DSTORE,
        FieldType::Object(_) | FieldType::Array(_) => ASTORE,
        _ => ISTORE,
    }
}

/// The instruction sequence standing in for one call: argument pops into
/// fresh locals, then the callee body with locals shifted and returns
/// stripped. The net stack effect equals the original invocation's.
fn inline_sequence(callee: &Callee, base: u16) -> Option<Vec<Insn>> {
    let parsed: MethodDescriptor = callee.method.desc.parse().ok()?;
    let receiver = !callee.method.is_static();

    let mut offsets = Vec::with_capacity(parsed.params.len());
    let mut slot = base + receiver as u16;
    for param in &parsed.params {
        offsets.push(slot);
        slot += param.size() as u16;
    }

    let mut seq = Vec::new();
    for (param, &offset) in parsed.params.iter().zip(&offsets).rev() {
        seq.push(Insn::Var {
            op: store_op(param),
            var: offset,
        });
    }
    if receiver {
        seq.push(Insn::Var {
            op: ASTORE,
            var: base,
        });
    }
    for insn in &callee.method.insns {
        if !insn.is_real() {
            continue;
        }
        if matches!(insn.opcode(), Some(IRETURN..=RETURN)) {
            continue;
        }
        seq.push(match insn {
            Insn::Var { op, var } => Insn::Var {
                op: *op,
                var: var + base,
            },
            Insn::Iinc { var, delta } => Insn::Iinc {
                var: var + base,
                delta: *delta,
            },
            other => other.clone(),
        });
    }
    Some(seq)
}

/// True when any instruction anywhere still references the method.
fn still_referenced(universe: &Universe, key: &(String, String, String)) -> bool {
    let matches_handle = |handle: &lc_ir::Handle| {
        handle.owner == key.0 && handle.name == key.1 && handle.desc == key.2
    };
    for (_, record) in universe.iter() {
        for method in &record.node.methods {
            for insn in &method.insns {
                match insn {
                    Insn::Method {
                        owner, name, desc, ..
                    } if *owner == key.0 && *name == key.1 && *desc == key.2 => return true,
                    Insn::Ldc(ConstOperand::MethodHandle(handle)) if matches_handle(handle) => {
                        return true
                    }
                    Insn::InvokeDynamic {
                        bootstrap, args, ..
                    } => {
                        if matches_handle(bootstrap) {
                            return true;
                        }
                        if args.iter().any(|arg| {
                            matches!(arg, ConstOperand::MethodHandle(h) if matches_handle(h))
                        }) {
                            return true;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    false
}

impl Pass for TrivialMethodInlining {
    fn info(&self) -> &'static PassInfo {
        &INFO
    }

    fn execute(&mut self, universe: &mut Universe, ctx: &PassContext) -> Result<bool> {
        self.inlined = 0;
        self.removed = 0;

        let mut callees: HashMap<(String, String, String), Callee> = HashMap::new();
        for (name, record) in universe.iter() {
            for method in &record.node.methods {
                if is_trivial(method) {
                    let callee = Callee {
                        owner: name.clone(),
                        method: method.clone(),
                    };
                    callees.insert(callee.key(), callee);
                }
            }
        }
        if callees.is_empty() {
            return Ok(false);
        }

        let mut rewritten: HashSet<(String, String, String)> = HashSet::new();
        for class_name in universe.names() {
            if ctx.cancelled() {
                break;
            }
            let Some(record) = universe.get_mut(&class_name) else {
                continue;
            };
            for method in &mut record.node.methods {
                let mut mods = InstructionModifier::new();
                let mut base = method.max_locals;
                let mut widened_stack = method.max_stack;
                for (pos, insn) in method.insns.iter().enumerate() {
                    let Insn::Method {
                        op,
                        owner,
                        name,
                        desc,
                    } = insn
                    else {
                        continue;
                    };
                    let key = (owner.clone(), name.clone(), desc.clone());
                    let Some(callee) = callees.get(&key) else {
                        continue;
                    };
                    // this pass keys resolution on the exact owner
                    let compatible = match *op {
                        INVOKESTATIC => callee.method.is_static(),
                        INVOKEVIRTUAL | INVOKESPECIAL => !callee.method.is_static(),
                        _ => false,
                    };
                    if !compatible {
                        continue;
                    }
                    // every site gets its own local range past the caller's
                    let Some(seq) = inline_sequence(callee, base) else {
                        continue;
                    };
                    base += callee.method.max_locals.max(1);
                    widened_stack = widened_stack.saturating_add(callee.method.max_stack);
                    mods.replace(pos, seq);
                    rewritten.insert(key);
                    self.inlined += 1;
                }
                if !mods.is_empty() {
                    mods.apply(method);
                    method.max_locals = base;
                    method.max_stack = widened_stack;
                }
            }
        }

        // drop callees whose every use was rewritten
        for key in &rewritten {
            if still_referenced(universe, key) {
                continue;
            }
            if let Some(record) = universe.get_mut(&key.0) {
                let before = record.node.methods.len();
                record
                    .node
                    .methods
                    .retain(|m| !(m.name == key.1 && m.desc == key.2));
                if record.node.methods.len() < before {
                    self.removed += 1;
                }
            }
        }

        if ctx.verbose {
            log::debug!(
                "inlined {} call sites, removed {} methods",
                self.inlined,
                self.removed
            );
        }
        log::info!(
            "trivial inliner: {} sites inlined, {} methods removed",
            self.inlined,
            self.removed
        );
        Ok(self.inlined > 0)
    }
}
