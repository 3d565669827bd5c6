use super::*;
use crate::allatori::AllatoriStringDecryption;
use crate::cleaning::bitwise::BitwiseSimplification;
use crate::cleaning::const_fields::ConstantFieldInlining;
use crate::cleaning::inliner::TrivialMethodInlining;
use crate::cleaning::unused::UnusedClassRemoval;
use crate::zkm::des::ZkmDesDecryption;
use crate::zkm::try_catch::FakeTryCatchRemoval;
use lc_ir::opcodes::*;
use lc_ir::{
    ClassAccess, ClassRecord, ClassVersion, ConstOperand, FieldAccess, FieldNode, Handle,
    HandleKind, Insn, MethodAccess, MethodNode, TryCatch, Universe,
};

fn ctx() -> PassContext {
    PassContext {
        verbose: true,
        cancel: CancelToken::new(),
    }
}

fn class(name: &str, methods: Vec<MethodNode>) -> lc_ir::ClassNode {
    lc_ir::ClassNode {
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

fn static_method(name: &str, desc: &str, insns: Vec<Insn>) -> MethodNode {
    let mut m = MethodNode::new(MethodAccess::PUBLIC | MethodAccess::STATIC, name, desc);
    m.insns = insns;
    m.max_stack = 8;
    m.max_locals = 4;
    m
}

fn universe_of(classes: Vec<lc_ir::ClassNode>) -> Universe {
    let mut u = Universe::new();
    for node in classes {
        u.insert(ClassRecord::new(node));
    }
    u
}

#[test]
fn inlines_a_trivial_getter() {
    // S1: `static int k() { return 42; }` disappears into its caller
    let k = static_method("k", "()I", vec![Insn::push_int(42), Insn::Simple(IRETURN)]);
    let m = static_method(
        "m",
        "()I",
        vec![
            Insn::Method {
                op: INVOKESTATIC,
                owner: "P".to_string(),
                name: "k".to_string(),
                desc: "()I".to_string(),
            },
            Insn::Simple(IRETURN),
        ],
    );
    let mut u = universe_of(vec![class("P", vec![k, m])]);

    let changed = TrivialMethodInlining::new().execute(&mut u, &ctx()).unwrap();
    assert!(changed);

    let p = &u.get("P").unwrap().node;
    assert!(p.method("k", "()I").is_none());
    let m = p.method("m", "()I").unwrap();
    assert_eq!(m.insns, vec![Insn::push_int(42), Insn::Simple(IRETURN)]);
}

#[test]
fn inliner_pops_arguments_into_fresh_locals() {
    let callee = static_method(
        "add",
        "(II)I",
        vec![
            Insn::Var { op: ILOAD, var: 0 },
            Insn::Var { op: ILOAD, var: 1 },
            Insn::Simple(IADD),
            Insn::Simple(IRETURN),
        ],
    );
    let caller = static_method(
        "m",
        "()I",
        vec![
            Insn::push_int(1),
            Insn::push_int(2),
            Insn::Method {
                op: INVOKESTATIC,
                owner: "P".to_string(),
                name: "add".to_string(),
                desc: "(II)I".to_string(),
            },
            Insn::Simple(IRETURN),
        ],
    );
    let mut u = universe_of(vec![class("P", vec![callee, caller])]);
    TrivialMethodInlining::new().execute(&mut u, &ctx()).unwrap();

    let m = u.get("P").unwrap().node.method("m", "()I").unwrap();
    // arg pops in reverse, then the body shifted past the caller's locals
    assert_eq!(
        m.insns,
        vec![
            Insn::push_int(1),
            Insn::push_int(2),
            Insn::Var { op: ISTORE, var: 5 },
            Insn::Var { op: ISTORE, var: 4 },
            Insn::Var { op: ILOAD, var: 4 },
            Insn::Var { op: ILOAD, var: 5 },
            Insn::Simple(IADD),
            Insn::Simple(IRETURN),
        ]
    );
    assert!(m.max_locals >= 6);
}

#[test]
fn inlines_constant_fields_but_keeps_them() {
    // S2: `static final String S = "abc"` folds into its loads
    let clinit = static_method(
        "<clinit>",
        "()V",
        vec![
            Insn::Ldc(ConstOperand::Str("abc".to_string())),
            Insn::Field {
                op: PUTSTATIC,
                owner: "Q".to_string(),
                name: "S".to_string(),
                desc: "Ljava/lang/String;".to_string(),
            },
            Insn::Simple(RETURN),
        ],
    );
    let m = static_method(
        "m",
        "()Ljava/lang/String;",
        vec![
            Insn::Field {
                op: GETSTATIC,
                owner: "Q".to_string(),
                name: "S".to_string(),
                desc: "Ljava/lang/String;".to_string(),
            },
            Insn::Simple(ARETURN),
        ],
    );
    let mut q = class("Q", vec![clinit, m]);
    q.fields = vec![FieldNode {
        access: FieldAccess::STATIC | FieldAccess::FINAL,
        name: "S".to_string(),
        desc: "Ljava/lang/String;".to_string(),
        signature: None,
        value: None,
    }];
    let mut u = universe_of(vec![q]);

    let changed = ConstantFieldInlining::new().execute(&mut u, &ctx()).unwrap();
    assert!(changed);

    let q = &u.get("Q").unwrap().node;
    assert!(q.field("S", "Ljava/lang/String;").is_some());
    let m = q.method("m", "()Ljava/lang/String;").unwrap();
    assert_eq!(
        m.insns[0],
        Insn::Ldc(ConstOperand::Str("abc".to_string()))
    );
}

#[test]
fn fields_written_elsewhere_are_left_alone() {
    let clinit = static_method(
        "<clinit>",
        "()V",
        vec![
            Insn::push_int(5),
            Insn::Field {
                op: PUTSTATIC,
                owner: "Q".to_string(),
                name: "n".to_string(),
                desc: "I".to_string(),
            },
            Insn::Simple(RETURN),
        ],
    );
    let w = static_method(
        "w",
        "()V",
        vec![
            Insn::push_int(9),
            Insn::Field {
                op: PUTSTATIC,
                owner: "Q".to_string(),
                name: "n".to_string(),
                desc: "I".to_string(),
            },
            Insn::Simple(RETURN),
        ],
    );
    let m = static_method(
        "m",
        "()I",
        vec![
            Insn::Field {
                op: GETSTATIC,
                owner: "Q".to_string(),
                name: "n".to_string(),
                desc: "I".to_string(),
            },
            Insn::Simple(IRETURN),
        ],
    );
    let mut q = class("Q", vec![clinit, w, m]);
    q.fields = vec![FieldNode {
        access: FieldAccess::STATIC,
        name: "n".to_string(),
        desc: "I".to_string(),
        signature: None,
        value: None,
    }];
    let mut u = universe_of(vec![q]);
    ConstantFieldInlining::new().execute(&mut u, &ctx()).unwrap();

    let m = u.get("Q").unwrap().node.method("m", "()I").unwrap();
    assert!(matches!(m.insns[0], Insn::Field { .. }));
}

#[test]
fn removes_fake_rethrow_handler() {
    // S3: a handler that immediately rethrows is decoy control flow
    let mut m = static_method("m", "()V", vec![]);
    let start = m.new_label();
    let end = m.new_label();
    let handler = m.new_label();
    m.insns = vec![
        Insn::Label(start),
        Insn::Simple(ICONST_0),
        Insn::Simple(POP),
        Insn::Label(end),
        Insn::Simple(RETURN),
        Insn::Label(handler),
        Insn::Simple(ATHROW),
    ];
    m.try_catches = vec![TryCatch {
        start,
        end,
        handler,
        catch_type: Some("java/lang/RuntimeException".to_string()),
    }];
    let mut u = universe_of(vec![class("Z", vec![m])]);

    let mut pass = FakeTryCatchRemoval::new();
    let changed = pass.execute(&mut u, &ctx()).unwrap();
    assert!(changed);
    let m = u.get("Z").unwrap().node.method("m", "()V").unwrap();
    assert!(m.try_catches.is_empty());
}

#[test]
fn keeps_real_handlers() {
    let mut m = static_method("m", "()V", vec![]);
    let start = m.new_label();
    let end = m.new_label();
    let handler = m.new_label();
    m.insns = vec![
        Insn::Label(start),
        Insn::Simple(ICONST_0),
        Insn::Simple(POP),
        Insn::Label(end),
        Insn::Simple(RETURN),
        Insn::Label(handler),
        Insn::Simple(POP),
        Insn::Simple(RETURN),
    ];
    m.try_catches = vec![TryCatch {
        start,
        end,
        handler,
        catch_type: None,
    }];
    let mut u = universe_of(vec![class("Z", vec![m])]);
    let changed = FakeTryCatchRemoval::new().execute(&mut u, &ctx()).unwrap();
    assert!(!changed);
    let m = u.get("Z").unwrap().node.method("m", "()V").unwrap();
    assert_eq!(m.try_catches.len(), 1);
}

fn zkm_bootstrap_desc() -> String {
    "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/invoke/MutableCallSite;\
     Ljava/lang/String;Ljava/lang/invoke/MethodType;J)Ljava/lang/invoke/MethodHandle;"
        .to_string()
}

#[test]
fn zkm_reference_site_becomes_direct_call() {
    // S4: a keyed dynamic invoke resolves to POP2 POP2 INVOKESTATIC
    let bsm_desc = zkm_bootstrap_desc();
    let clinit = static_method(
        "<clinit>",
        "()V",
        vec![
            Insn::Ldc(ConstOperand::Long(0x1122_3344_5566_7788)),
            Insn::Field {
                op: PUTSTATIC,
                owner: "D".to_string(),
                name: "K".to_string(),
                desc: "J".to_string(),
            },
            Insn::Simple(RETURN),
        ],
    );
    let target = static_method(
        "target",
        "()J",
        vec![Insn::Ldc(ConstOperand::Long(5)), Insn::Simple(LRETURN)],
    );
    let bootstrap = static_method(
        "bsm",
        &bsm_desc,
        vec![
            Insn::Var { op: ALOAD, var: 0 },
            Insn::Ldc(ConstOperand::Class("D".to_string())),
            Insn::Ldc(ConstOperand::Str("target".to_string())),
            Insn::Ldc(ConstOperand::MethodType("()J".to_string())),
            Insn::Method {
                op: INVOKEVIRTUAL,
                owner: "java/lang/invoke/MethodHandles$Lookup".to_string(),
                name: "findStatic".to_string(),
                desc: "(Ljava/lang/Class;Ljava/lang/String;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/MethodHandle;".to_string(),
            },
            Insn::Simple(ARETURN),
        ],
    );
    let caller = static_method(
        "m",
        "()J",
        vec![
            Insn::Field {
                op: GETSTATIC,
                owner: "D".to_string(),
                name: "K".to_string(),
                desc: "J".to_string(),
            },
            Insn::Ldc(ConstOperand::Long(0xABCD)),
            Insn::Simple(LXOR),
            Insn::InvokeDynamic {
                name: "a".to_string(),
                desc: "(J)J".to_string(),
                bootstrap: Handle {
                    kind: HandleKind::InvokeStatic,
                    owner: "D".to_string(),
                    name: "bsm".to_string(),
                    desc: bsm_desc.clone(),
                },
                args: vec![],
            },
            Insn::Simple(LRETURN),
        ],
    );
    let mut d = class("D", vec![clinit, target, bootstrap, caller]);
    d.fields = vec![FieldNode {
        access: FieldAccess::STATIC,
        name: "K".to_string(),
        desc: "J".to_string(),
        signature: None,
        value: None,
    }];
    let mut u = universe_of(vec![d]);

    let changed = ZkmDesDecryption::new().execute(&mut u, &ctx()).unwrap();
    assert!(changed);

    let m = u.get("D").unwrap().node.method("m", "()J").unwrap();
    assert_eq!(
        m.insns,
        vec![
            Insn::Field {
                op: GETSTATIC,
                owner: "D".to_string(),
                name: "K".to_string(),
                desc: "J".to_string(),
            },
            Insn::Ldc(ConstOperand::Long(0xABCD)),
            Insn::Simple(POP2),
            Insn::Simple(POP2),
            Insn::Method {
                op: INVOKESTATIC,
                owner: "D".to_string(),
                name: "target".to_string(),
                desc: "()J".to_string(),
            },
            Insn::Simple(LRETURN),
        ]
    );
}

#[test]
fn zkm_string_site_becomes_ldc() {
    let decryptor = static_method(
        "dec",
        "(IJ)Ljava/lang/String;",
        vec![
            Insn::Ldc(ConstOperand::Str("secret".to_string())),
            Insn::Simple(ARETURN),
        ],
    );
    let clinit = static_method("<clinit>", "()V", vec![Insn::Simple(RETURN)]);
    let caller = static_method(
        "m",
        "()Ljava/lang/String;",
        vec![
            Insn::push_int(1),
            Insn::Ldc(ConstOperand::Long(7)),
            Insn::InvokeDynamic {
                name: "s".to_string(),
                desc: "(IJ)Ljava/lang/String;".to_string(),
                bootstrap: Handle {
                    kind: HandleKind::InvokeStatic,
                    owner: "Z".to_string(),
                    name: "dec".to_string(),
                    desc: "(IJ)Ljava/lang/String;".to_string(),
                },
                args: vec![],
            },
            Insn::Simple(ARETURN),
        ],
    );
    let mut u = universe_of(vec![class("Z", vec![clinit, decryptor, caller])]);

    let changed = ZkmDesDecryption::new().execute(&mut u, &ctx()).unwrap();
    assert!(changed);
    let m = u
        .get("Z")
        .unwrap()
        .node
        .method("m", "()Ljava/lang/String;")
        .unwrap();
    assert_eq!(
        m.insns,
        vec![
            Insn::Ldc(ConstOperand::Str("secret".to_string())),
            Insn::Simple(ARETURN),
        ]
    );
}

#[test]
fn unused_class_is_removed() {
    // S5
    let main = static_method(
        "main",
        "([Ljava/lang/String;)V",
        vec![
            Insn::Method {
                op: INVOKESTATIC,
                owner: "Used".to_string(),
                name: "u".to_string(),
                desc: "()V".to_string(),
            },
            Insn::Simple(RETURN),
        ],
    );
    let used = static_method("u", "()V", vec![Insn::Simple(RETURN)]);
    let junk = static_method("j", "()V", vec![Insn::Simple(RETURN)]);
    let mut u = universe_of(vec![
        class("Main", vec![main]),
        class("Used", vec![used]),
        class("Junk", vec![junk]),
    ]);

    let changed = UnusedClassRemoval::new().execute(&mut u, &ctx()).unwrap();
    assert!(changed);
    assert!(u.contains("Main"));
    assert!(u.contains("Used"));
    assert!(!u.contains("Junk"));
}

#[test]
fn rootless_universe_is_not_emptied() {
    let mut u = universe_of(vec![class(
        "NoMain",
        vec![static_method("f", "()V", vec![Insn::Simple(RETURN)])],
    )]);
    let changed = UnusedClassRemoval::new().execute(&mut u, &ctx()).unwrap();
    assert!(!changed);
    assert!(u.contains("NoMain"));
}

#[test]
fn folds_bitwise_and_to_iconst() {
    // S6: BIPUSH 6 ; BIPUSH 3 ; IAND -> ICONST_2
    let m = static_method(
        "m",
        "()I",
        vec![
            Insn::IntPush { op: BIPUSH, value: 6 },
            Insn::IntPush { op: BIPUSH, value: 3 },
            Insn::Simple(IAND),
            Insn::Simple(IRETURN),
        ],
    );
    let mut u = universe_of(vec![class("W", vec![m])]);

    let changed = BitwiseSimplification::new().execute(&mut u, &ctx()).unwrap();
    assert!(changed);
    let m = u.get("W").unwrap().node.method("m", "()I").unwrap();
    assert_eq!(m.insns, vec![Insn::Simple(ICONST_2), Insn::Simple(IRETURN)]);

    // a second run finds nothing: the pass is idempotent on clean input
    let changed = BitwiseSimplification::new().execute(&mut u, &ctx()).unwrap();
    assert!(!changed);
}

#[test]
fn allatori_constant_decrypts_through_the_sandbox() {
    let sb = "java/lang/StringBuilder";
    let decrypt = static_method(
        "x",
        "(Ljava/lang/String;)Ljava/lang/String;",
        vec![
            Insn::Type { op: NEW, ty: sb.to_string() },
            Insn::Simple(DUP),
            Insn::Var { op: ALOAD, var: 0 },
            Insn::Method {
                op: INVOKESPECIAL,
                owner: sb.to_string(),
                name: "<init>".to_string(),
                desc: "(Ljava/lang/String;)V".to_string(),
            },
            Insn::Method {
                op: INVOKEVIRTUAL,
                owner: sb.to_string(),
                name: "reverse".to_string(),
                desc: "()Ljava/lang/StringBuilder;".to_string(),
            },
            Insn::Method {
                op: INVOKEVIRTUAL,
                owner: sb.to_string(),
                name: "toString".to_string(),
                desc: "()Ljava/lang/String;".to_string(),
            },
            Insn::Simple(ARETURN),
        ],
    );
    let caller = static_method(
        "m",
        "()Ljava/lang/String;",
        vec![
            Insn::Ldc(ConstOperand::Str("terces".to_string())),
            Insn::Method {
                op: INVOKESTATIC,
                owner: "A".to_string(),
                name: "x".to_string(),
                desc: "(Ljava/lang/String;)Ljava/lang/String;".to_string(),
            },
            Insn::Simple(ARETURN),
        ],
    );
    let mut u = universe_of(vec![class("A", vec![decrypt, caller])]);

    let changed = AllatoriStringDecryption::new().execute(&mut u, &ctx()).unwrap();
    assert!(changed);
    let m = u
        .get("A")
        .unwrap()
        .node
        .method("m", "()Ljava/lang/String;")
        .unwrap();
    assert_eq!(
        m.insns,
        vec![
            Insn::Ldc(ConstOperand::Str("secret".to_string())),
            Insn::Simple(ARETURN),
        ]
    );
}

#[test]
fn registry_lists_unique_ids_in_order() {
    let infos = list_passes();
    assert!(!infos.is_empty());
    let mut ids: Vec<_> = infos.iter().map(|i| i.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), infos.len());
}

#[test]
fn pipeline_records_outcomes_and_skips_unknown_passes() {
    let mut m = static_method("m", "()V", vec![]);
    let start = m.new_label();
    let end = m.new_label();
    let handler = m.new_label();
    m.insns = vec![
        Insn::Label(start),
        Insn::Simple(ICONST_0),
        Insn::Simple(POP),
        Insn::Label(end),
        Insn::Simple(RETURN),
        Insn::Label(handler),
        Insn::Simple(ATHROW),
    ];
    m.try_catches = vec![TryCatch {
        start,
        end,
        handler,
        catch_type: None,
    }];
    let mut u = universe_of(vec![class("Z", vec![m])]);

    let summary = run_pipeline(
        &mut u,
        &["no-such-pass", "zkm-remove-fake-try-catch"],
        false,
        CancelToken::new(),
    );
    assert_eq!(summary.outcomes.len(), 1);
    assert!(summary.outcomes[0].changed);
    assert!(summary.outcomes[0].error.is_none());
    assert!(summary.any_changed());
}

#[test]
fn cancellation_stops_at_a_pass_boundary() {
    let mut u = universe_of(vec![]);
    let cancel = CancelToken::new();
    cancel.cancel();
    let summary = run_pipeline(&mut u, &["zkm-remove-fake-try-catch"], false, cancel);
    assert!(summary.cancelled);
    assert!(summary.outcomes.is_empty());
}
