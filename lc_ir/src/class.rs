//! Mutable class, field and method nodes.

use crate::access::{ClassAccess, FieldAccess, MethodAccess};
use crate::insn::{ConstOperand, Insn, LabelId, LabelMap};

/// Class file format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassVersion {
    pub minor: u16,
    pub major: u16,
}

/// Mutable parsed bytecode of a single class. All constant pool indirection
/// is resolved; names are internal (slash-separated).
#[derive(Debug, Clone)]
pub struct ClassNode {
    pub version: ClassVersion,
    pub access: ClassAccess,
    pub name: String,
    /// `None` only for `java/lang/Object`.
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<FieldNode>,
    pub methods: Vec<MethodNode>,
    pub source_file: Option<String>,
}

impl ClassNode {
    pub fn is_enum(&self) -> bool {
        self.access.contains(ClassAccess::ENUM)
    }

    pub fn method(&self, name: &str, desc: &str) -> Option<&MethodNode> {
        self.methods.iter().find(|m| m.name == name && m.desc == desc)
    }

    pub fn method_mut(&mut self, name: &str, desc: &str) -> Option<&mut MethodNode> {
        self.methods
            .iter_mut()
            .find(|m| m.name == name && m.desc == desc)
    }

    pub fn field(&self, name: &str, desc: &str) -> Option<&FieldNode> {
        self.fields.iter().find(|f| f.name == name && f.desc == desc)
    }

    /// Positions of all static initializers. More than one is a
    /// manipulation artifact; the merge step reduces them to one.
    pub fn static_initializers(&self) -> Vec<usize> {
        self.methods
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_static_initializer())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn static_initializer_mut(&mut self) -> Option<&mut MethodNode> {
        self.methods.iter_mut().find(|m| m.is_static_initializer())
    }
}

/// A field of a class.
#[derive(Debug, Clone)]
pub struct FieldNode {
    pub access: FieldAccess,
    pub name: String,
    pub desc: String,
    pub signature: Option<String>,
    /// The `ConstantValue` attribute, if any.
    pub value: Option<ConstOperand>,
}

impl FieldNode {
    pub fn is_static(&self) -> bool {
        self.access.contains(FieldAccess::STATIC)
    }
}

/// An exception handler range. `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryCatch {
    pub start: LabelId,
    pub end: LabelId,
    pub handler: LabelId,
    /// `None` catches everything (`finally`).
    pub catch_type: Option<String>,
}

impl TryCatch {
    pub fn clone_remapped(&self, map: &LabelMap) -> TryCatch {
        let remap = |l: &LabelId| map.get(l).copied().unwrap_or(*l);
        TryCatch {
            start: remap(&self.start),
            end: remap(&self.end),
            handler: remap(&self.handler),
            catch_type: self.catch_type.clone(),
        }
    }
}

/// A local variable debug entry, live between `start` and `end`.
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: String,
    pub desc: String,
    pub signature: Option<String>,
    pub start: LabelId,
    pub end: LabelId,
    pub index: u16,
}

impl LocalVar {
    pub fn clone_remapped(&self, map: &LabelMap) -> LocalVar {
        let remap = |l: &LabelId| map.get(l).copied().unwrap_or(*l);
        LocalVar {
            start: remap(&self.start),
            end: remap(&self.end),
            ..self.clone()
        }
    }
}

/// A method of a class. Owns its instruction list and allocates its labels.
#[derive(Debug, Clone)]
pub struct MethodNode {
    pub access: MethodAccess,
    pub name: String,
    pub desc: String,
    pub signature: Option<String>,
    pub exceptions: Vec<String>,
    pub insns: Vec<Insn>,
    pub try_catches: Vec<TryCatch>,
    pub local_vars: Vec<LocalVar>,
    pub max_stack: u16,
    pub max_locals: u16,
    next_label: u32,
}

impl MethodNode {
    pub fn new(access: MethodAccess, name: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            access,
            name: name.into(),
            desc: desc.into(),
            signature: None,
            exceptions: Vec::new(),
            insns: Vec::new(),
            try_catches: Vec::new(),
            local_vars: Vec::new(),
            max_stack: 0,
            max_locals: 0,
            next_label: 0,
        }
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(MethodAccess::STATIC)
    }

    pub fn is_static_initializer(&self) -> bool {
        self.name == "<clinit>" && self.desc == "()V"
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    /// Allocates a label unused in this method.
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// Builds a remap table assigning a fresh label of this method to every
    /// label of `donor`. Used when splicing a donor's instructions in.
    pub fn remap_from(&mut self, donor: &MethodNode) -> LabelMap {
        let mut map = LabelMap::default();
        for id in 0..donor.next_label {
            map.insert(LabelId(id), self.new_label());
        }
        map
    }

    /// Position of the `Label` node for `label`.
    pub fn label_position(&self, label: LabelId) -> Option<usize> {
        self.insns
            .iter()
            .position(|i| matches!(i, Insn::Label(l) if *l == label))
    }

    /// Position of the first real instruction at or after `label`.
    pub fn first_insn_at(&self, label: LabelId) -> Option<usize> {
        let start = self.label_position(label)?;
        (start..self.insns.len()).find(|&i| self.insns[i].is_real())
    }

    /// Number of real instructions (pseudo-nodes not counted).
    pub fn real_insn_count(&self) -> usize {
        self.insns.iter().filter(|i| i.is_real()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::*;

    fn method_with(insns: Vec<Insn>) -> MethodNode {
        let mut m = MethodNode::new(MethodAccess::STATIC, "m", "()V");
        m.insns = insns;
        m
    }

    #[test]
    fn label_lookup_skips_pseudo_nodes() {
        let mut m = method_with(vec![]);
        let l = m.new_label();
        m.insns = vec![
            Insn::Simple(NOP),
            Insn::Label(l),
            Insn::Line { line: 3, start: l },
            Insn::Simple(RETURN),
        ];
        assert_eq!(m.label_position(l), Some(1));
        assert_eq!(m.first_insn_at(l), Some(3));
        assert_eq!(m.real_insn_count(), 2);
    }

    #[test]
    fn remap_covers_all_donor_labels() {
        let mut donor = method_with(vec![]);
        donor.new_label();
        donor.new_label();

        let mut target = method_with(vec![]);
        target.new_label();
        let map = target.remap_from(&donor);
        assert_eq!(map.len(), 2);
        // fresh labels must not collide with the target's own
        assert!(map.values().all(|l| l.0 >= 1));
    }

    #[test]
    fn finds_static_initializers() {
        let mut c = ClassNode {
            version: ClassVersion { minor: 0, major: 52 },
            access: ClassAccess::PUBLIC,
            name: "Test".to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: vec![],
            fields: vec![],
            methods: vec![
                MethodNode::new(MethodAccess::STATIC, "<clinit>", "()V"),
                MethodNode::new(MethodAccess::STATIC, "m", "()V"),
                MethodNode::new(MethodAccess::STATIC, "<clinit>", "()V"),
            ],
            source_file: None,
        };
        assert_eq!(c.static_initializers(), vec![0, 2]);
        assert!(c.static_initializer_mut().is_some());
    }
}
