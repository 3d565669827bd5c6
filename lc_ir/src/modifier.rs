//! Batched instruction edits.
//!
//! Passes scan a method's instruction list by position and queue edits here;
//! `apply` rebuilds the list once, after the scan, so queued positions stay
//! valid and a method is only ever observed before or after the whole batch.

use crate::class::MethodNode;
use crate::insn::Insn;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
struct PositionEdit {
    before: Vec<Insn>,
    /// `Some(vec![])` removes, `Some(other)` replaces, `None` keeps.
    replace: Option<Vec<Insn>>,
    after: Vec<Insn>,
}

/// Buffered edits against one method's instruction list.
#[derive(Debug, Default)]
pub struct InstructionModifier {
    edits: BTreeMap<usize, PositionEdit>,
}

impl InstructionModifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn at(&mut self, pos: usize) -> &mut PositionEdit {
        self.edits.entry(pos).or_default()
    }

    /// Removes the instruction at `pos`.
    pub fn remove(&mut self, pos: usize) {
        self.at(pos).replace = Some(Vec::new());
    }

    /// Replaces the instruction at `pos` with `insns`.
    pub fn replace(&mut self, pos: usize, insns: Vec<Insn>) {
        self.at(pos).replace = Some(insns);
    }

    /// Inserts `insns` before the instruction at `pos`.
    pub fn insert_before(&mut self, pos: usize, insns: Vec<Insn>) {
        self.at(pos).before.extend(insns);
    }

    /// Inserts `insns` after the instruction at `pos`.
    pub fn insert_after(&mut self, pos: usize, insns: Vec<Insn>) {
        self.at(pos).after.extend(insns);
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Applies all queued edits to `method` atomically.
    pub fn apply(self, method: &mut MethodNode) {
        if self.edits.is_empty() {
            return;
        }
        let old = std::mem::take(&mut method.insns);
        let mut new = Vec::with_capacity(old.len());
        let mut edits = self.edits;
        for (pos, insn) in old.into_iter().enumerate() {
            match edits.remove(&pos) {
                None => new.push(insn),
                Some(edit) => {
                    new.extend(edit.before);
                    match edit.replace {
                        None => new.push(insn),
                        Some(replacement) => new.extend(replacement),
                    }
                    new.extend(edit.after);
                }
            }
        }
        // edits addressed past the end are silently dropped; queuing them is
        // a pass bug, losing them is still better than corrupting the method
        method.insns = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MethodAccess;
    use crate::opcodes::*;

    fn method() -> MethodNode {
        let mut m = MethodNode::new(MethodAccess::STATIC, "m", "()V");
        m.insns = vec![
            Insn::Simple(ICONST_0),
            Insn::Simple(POP),
            Insn::Simple(RETURN),
        ];
        m
    }

    #[test]
    fn edits_apply_against_original_positions() {
        let mut m = method();
        let mut mods = InstructionModifier::new();
        mods.insert_before(2, vec![Insn::Simple(NOP)]);
        mods.remove(0);
        mods.remove(1);
        mods.apply(&mut m);
        assert_eq!(m.insns, vec![Insn::Simple(NOP), Insn::Simple(RETURN)]);
    }

    #[test]
    fn replace_and_surround() {
        let mut m = method();
        let mut mods = InstructionModifier::new();
        mods.replace(1, vec![Insn::Simple(DUP), Insn::Simple(POP2)]);
        mods.insert_after(1, vec![Insn::Simple(NOP)]);
        mods.apply(&mut m);
        assert_eq!(
            m.insns,
            vec![
                Insn::Simple(ICONST_0),
                Insn::Simple(DUP),
                Insn::Simple(POP2),
                Insn::Simple(NOP),
                Insn::Simple(RETURN),
            ]
        );
    }

    #[test]
    fn empty_modifier_leaves_method_untouched() {
        let mut m = method();
        let before = m.insns.clone();
        InstructionModifier::new().apply(&mut m);
        assert_eq!(m.insns, before);
    }
}
