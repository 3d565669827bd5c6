//! Shared building blocks for passes: static-initializer handling, proxy
//! class construction, and constant materialization.

use lc_ir::opcodes::*;
use lc_ir::{
    ClassNode, ConstOperand, FieldType, Insn, InstructionModifier, MethodDescriptor, MethodNode,
};
use lc_vm::{Obj, Value};

/// Merges multiple static initializers (a manipulation artifact) into the
/// first one. Each secondary body is cloned through a fresh label remap,
/// its terminal return stripped, and spliced in before the primary's first
/// return. Returns whether anything was merged.
pub fn merge_static_initializers(class: &mut ClassNode) -> bool {
    let indices = class.static_initializers();
    if indices.len() <= 1 {
        return false;
    }

    let mut donors = Vec::with_capacity(indices.len() - 1);
    for &index in indices[1..].iter().rev() {
        donors.push(class.methods.remove(index));
    }
    donors.reverse();

    let primary = &mut class.methods[indices[0]];
    for donor in donors {
        let map = primary.remap_from(&donor);
        let mut body: Vec<Insn> = donor
            .insns
            .iter()
            .map(|insn| insn.clone_remapped(&map))
            .collect();
        if let Some(terminal) = body
            .iter()
            .rposition(|insn| matches!(insn, Insn::Simple(RETURN)))
        {
            body.remove(terminal);
        }
        let at = primary
            .insns
            .iter()
            .position(|insn| matches!(insn, Insn::Simple(RETURN)))
            .unwrap_or(primary.insns.len());
        primary.insns.splice(at..at, body);
        primary
            .try_catches
            .extend(donor.try_catches.iter().map(|tc| tc.clone_remapped(&map)));
        primary
            .local_vars
            .extend(donor.local_vars.iter().map(|lv| lv.clone_remapped(&map)));
        primary.max_stack = primary.max_stack.max(donor.max_stack);
        primary.max_locals = primary.max_locals.max(donor.max_locals);
    }
    true
}

/// The name a class's static initializer gets inside its proxy.
pub const CLINIT_PROXY: &str = "clinitProxy";

/// Builds the proxy used to re-run a class's initialization in the sandbox:
/// static fields, static methods, the initializer renamed to
/// [`CLINIT_PROXY`], and every self-reference rewritten to the proxy name.
pub fn build_proxy(class: &ClassNode, proxy_name: &str) -> ClassNode {
    let mut proxy = class.clone();
    let original = class.name.clone();
    proxy.name = proxy_name.to_string();
    proxy.fields.retain(|f| f.is_static());
    proxy.methods.retain(|m| m.is_static());
    for method in &mut proxy.methods {
        if method.is_static_initializer() {
            method.name = CLINIT_PROXY.to_string();
        }
        for insn in &mut method.insns {
            retarget(insn, &original, proxy_name);
        }
    }
    proxy
}

fn retarget(insn: &mut Insn, from: &str, to: &str) {
    let fix = |owner: &mut String| {
        if owner == from {
            *owner = to.to_string();
        }
    };
    match insn {
        Insn::Field { owner, .. } | Insn::Method { owner, .. } => fix(owner),
        Insn::Type { ty, .. } => fix(ty),
        Insn::Ldc(ConstOperand::Class(name)) => fix(name),
        Insn::Ldc(ConstOperand::MethodHandle(handle)) => fix(&mut handle.owner),
        Insn::InvokeDynamic {
            bootstrap, args, ..
        } => {
            fix(&mut bootstrap.owner);
            for arg in args {
                match arg {
                    ConstOperand::Class(name) => fix(name),
                    ConstOperand::MethodHandle(handle) => fix(&mut handle.owner),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Strips calls out of an initializer that leave the target class and are
/// not recognized runtime helpers: each such call becomes pops of its
/// arguments plus a typed default, so the surrounding stack shape holds.
pub fn isolate_initializer(method: &mut MethodNode, class_name: &str) -> usize {
    let mut mods = InstructionModifier::new();
    let mut stripped = 0;
    for (pos, insn) in method.insns.iter().enumerate() {
        let Insn::Method {
            op, owner, desc, ..
        } = insn
        else {
            continue;
        };
        if owner == class_name || is_runtime_helper(owner) {
            continue;
        }
        let Ok(parsed) = desc.parse::<MethodDescriptor>() else {
            continue;
        };
        let mut replacement = Vec::new();
        for param in parsed.params.iter().rev() {
            replacement.push(Insn::Simple(if param.size() == 2 { POP2 } else { POP }));
        }
        if *op != INVOKESTATIC {
            replacement.push(Insn::Simple(POP));
        }
        if let Some(ret) = &parsed.ret {
            replacement.push(default_push(ret));
        }
        mods.replace(pos, replacement);
        stripped += 1;
    }
    mods.apply(method);
    stripped
}

fn is_runtime_helper(owner: &str) -> bool {
    owner.starts_with("java/") || owner.starts_with("javax/crypto/")
}

fn default_push(ty: &FieldType) -> Insn {
    match ty {
        FieldType::Long => Insn::Simple(LCONST_0),
        FieldType::Float => Insn::Simple(FCONST_0),
        FieldType::Double => Insn::Simple(DCONST_0),
        FieldType::Object(_) | FieldType::Array(_) => Insn::Simple(ACONST_NULL),
        _ => Insn::Simple(ICONST_0),
    }
}

/// The optimally-encoded push for a loadable constant.
pub fn const_push(constant: &ConstOperand) -> Insn {
    match constant {
        ConstOperand::Int(v) => Insn::push_int(*v),
        ConstOperand::Long(v) => Insn::push_long(*v),
        ConstOperand::Float(v) if *v == 0.0 && v.is_sign_positive() => Insn::Simple(FCONST_0),
        ConstOperand::Float(v) if *v == 1.0 => Insn::Simple(FCONST_1),
        ConstOperand::Float(v) if *v == 2.0 => Insn::Simple(FCONST_2),
        ConstOperand::Double(v) if *v == 0.0 && v.is_sign_positive() => Insn::Simple(DCONST_0),
        ConstOperand::Double(v) if *v == 1.0 => Insn::Simple(DCONST_1),
        ConstOperand::Null => Insn::Simple(ACONST_NULL),
        other => Insn::Ldc(other.clone()),
    }
}

/// A sandbox value as a loadable constant, for passes that turn harvested
/// runtime state back into bytecode. Only scalars and strings qualify.
pub fn value_to_const(value: &Value) -> Option<ConstOperand> {
    Some(match value {
        Value::Int(v) => ConstOperand::Int(*v),
        Value::Long(v) => ConstOperand::Long(*v),
        Value::Float(v) => ConstOperand::Float(*v),
        Value::Double(v) => ConstOperand::Double(*v),
        Value::Ref(obj) => match &*obj.borrow() {
            Obj::Str(s) => ConstOperand::Str(s.clone()),
            _ => return None,
        },
        Value::Null => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lc_ir::{ClassAccess, ClassVersion, FieldAccess, FieldNode, MethodAccess};

    fn clinit(insns: Vec<Insn>) -> MethodNode {
        let mut m = MethodNode::new(MethodAccess::STATIC, "<clinit>", "()V");
        m.insns = insns;
        m
    }

    fn class_named(name: &str, methods: Vec<MethodNode>) -> ClassNode {
        ClassNode {
            version: ClassVersion { minor: 0, major: 52 },
            access: ClassAccess::PUBLIC,
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: vec![],
            fields: vec![],
            methods,
            source_file: None,
        }
    }

    #[test]
    fn merges_two_initializers_into_one() {
        let first = clinit(vec![
            Insn::push_int(1),
            Insn::Field {
                op: PUTSTATIC,
                owner: "C".to_string(),
                name: "a".to_string(),
                desc: "I".to_string(),
            },
            Insn::Simple(RETURN),
        ]);
        let second = clinit(vec![
            Insn::push_int(2),
            Insn::Field {
                op: PUTSTATIC,
                owner: "C".to_string(),
                name: "b".to_string(),
                desc: "I".to_string(),
            },
            Insn::Simple(RETURN),
        ]);
        let mut class = class_named("C", vec![first, second]);

        assert!(merge_static_initializers(&mut class));
        assert_eq!(class.static_initializers().len(), 1);
        let merged = &class.methods[0];
        // both bodies, one return, the donor's return gone
        let returns = merged
            .insns
            .iter()
            .filter(|i| matches!(i, Insn::Simple(RETURN)))
            .count();
        assert_eq!(returns, 1);
        let writes = merged
            .insns
            .iter()
            .filter(|i| matches!(i, Insn::Field { op: PUTSTATIC, .. }))
            .count();
        assert_eq!(writes, 2);
        // the donor's body runs before the primary's return
        assert!(matches!(merged.insns.last(), Some(Insn::Simple(RETURN))));
    }

    #[test]
    fn merge_is_a_no_op_for_single_initializer() {
        let mut class = class_named("C", vec![clinit(vec![Insn::Simple(RETURN)])]);
        assert!(!merge_static_initializers(&mut class));
    }

    #[test]
    fn proxy_keeps_statics_and_renames_self_references() {
        let mut instance_method = MethodNode::new(MethodAccess::PUBLIC, "run", "()V");
        instance_method.insns = vec![Insn::Simple(RETURN)];
        let mut helper = MethodNode::new(MethodAccess::STATIC, "h", "()V");
        helper.insns = vec![
            Insn::Field {
                op: GETSTATIC,
                owner: "C".to_string(),
                name: "k".to_string(),
                desc: "J".to_string(),
            },
            Insn::Simple(POP2),
            Insn::Simple(RETURN),
        ];
        let mut class = class_named(
            "C",
            vec![clinit(vec![Insn::Simple(RETURN)]), instance_method, helper],
        );
        class.fields = vec![
            FieldNode {
                access: FieldAccess::STATIC,
                name: "k".to_string(),
                desc: "J".to_string(),
                signature: None,
                value: None,
            },
            FieldNode {
                access: FieldAccess::PRIVATE,
                name: "x".to_string(),
                desc: "I".to_string(),
                signature: None,
                value: None,
            },
        ];

        let proxy = build_proxy(&class, "C$proxy");
        assert_eq!(proxy.name, "C$proxy");
        assert_eq!(proxy.fields.len(), 1);
        assert!(proxy.method(CLINIT_PROXY, "()V").is_some());
        assert!(proxy.method("run", "()V").is_none());
        let h = proxy.method("h", "()V").unwrap();
        assert!(matches!(
            &h.insns[0],
            Insn::Field { owner, .. } if owner == "C$proxy"
        ));
    }

    #[test]
    fn isolation_replaces_foreign_calls_with_stack_repair() {
        let mut m = clinit(vec![
            Insn::push_int(3),
            Insn::Method {
                op: INVOKESTATIC,
                owner: "com/other/Evil".to_string(),
                name: "f".to_string(),
                desc: "(I)J".to_string(),
            },
            Insn::Simple(POP2),
            Insn::Method {
                op: INVOKESTATIC,
                owner: "java/lang/System".to_string(),
                name: "nanoTime".to_string(),
                desc: "()J".to_string(),
            },
            Insn::Simple(POP2),
            Insn::Simple(RETURN),
        ]);
        let stripped = isolate_initializer(&mut m, "C");
        assert_eq!(stripped, 1);
        assert_eq!(
            m.insns[1..4],
            [
                Insn::Simple(POP),
                Insn::Simple(LCONST_0),
                Insn::Simple(POP2),
            ]
        );
        // the runtime helper call survives
        assert!(m
            .insns
            .iter()
            .any(|i| matches!(i, Insn::Method { owner, .. } if owner == "java/lang/System")));
    }
}
