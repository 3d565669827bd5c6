use super::*;
use lc_ir::opcodes::*;
use lc_ir::{
    ClassAccess, ClassVersion, ConstOperand, Insn, MethodAccess, MethodNode, TryCatch,
};

fn class(name: &str, methods: Vec<MethodNode>) -> ClassNode {
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

fn static_method(name: &str, desc: &str, insns: Vec<Insn>) -> MethodNode {
    let mut m = MethodNode::new(MethodAccess::PUBLIC | MethodAccess::STATIC, name, desc);
    m.insns = insns;
    m.max_stack = 8;
    m.max_locals = 8;
    m
}

#[test]
fn executes_preloaded_arithmetic() {
    let vm = Vm::new(&EmptyHandler);
    vm.preload(class(
        "T",
        vec![static_method(
            "add",
            "(II)I",
            vec![
                Insn::Var { op: ILOAD, var: 0 },
                Insn::Var { op: ILOAD, var: 1 },
                Insn::Simple(IADD),
                Insn::Simple(IRETURN),
            ],
        )],
    ));
    let result = vm
        .invoke_static("T", "add", "(II)I", vec![Value::Int(40), Value::Int(2)])
        .unwrap();
    assert!(matches!(result, Some(Value::Int(42))));
}

#[test]
fn clinit_runs_once_and_fills_statics() {
    let vm = Vm::new(&EmptyHandler);
    vm.preload(class(
        "K",
        vec![static_method(
            "<clinit>",
            "()V",
            vec![
                Insn::Ldc(ConstOperand::Long(0x1122_3344_5566_7788)),
                Insn::Field {
                    op: PUTSTATIC,
                    owner: "K".to_string(),
                    name: "KEY".to_string(),
                    desc: "J".to_string(),
                },
                Insn::Simple(RETURN),
            ],
        )],
    ));
    let value = vm.static_field("K", "KEY", "J").unwrap();
    assert!(matches!(value, Value::Long(0x1122_3344_5566_7788)));
}

#[test]
fn string_builder_reverse_round_trip() {
    let vm = Vm::new(&EmptyHandler);
    let sb = "java/lang/StringBuilder";
    vm.preload(class(
        "S",
        vec![static_method(
            "mangle",
            "()Ljava/lang/String;",
            vec![
                Insn::Type { op: NEW, ty: sb.to_string() },
                Insn::Simple(DUP),
                Insn::Method {
                    op: INVOKESPECIAL,
                    owner: sb.to_string(),
                    name: "<init>".to_string(),
                    desc: "()V".to_string(),
                },
                Insn::Ldc(ConstOperand::Str("cba".to_string())),
                Insn::Method {
                    op: INVOKEVIRTUAL,
                    owner: sb.to_string(),
                    name: "append".to_string(),
                    desc: "(Ljava/lang/String;)Ljava/lang/StringBuilder;".to_string(),
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
        )],
    ));
    let result = vm
        .invoke_static("S", "mangle", "()Ljava/lang/String;", vec![])
        .unwrap()
        .unwrap();
    assert_eq!(result.as_str().as_deref(), Some("abc"));
}

#[test]
fn division_by_zero_reaches_the_handler() {
    let vm = Vm::new(&EmptyHandler);
    let mut m = static_method("f", "()I", vec![]);
    let start = m.new_label();
    let end = m.new_label();
    let handler = m.new_label();
    m.insns = vec![
        Insn::Label(start),
        Insn::Simple(ICONST_1),
        Insn::Simple(ICONST_0),
        Insn::Simple(IDIV),
        Insn::Label(end),
        Insn::Simple(IRETURN),
        Insn::Label(handler),
        Insn::Simple(POP),
        Insn::push_int(7),
        Insn::Simple(IRETURN),
    ];
    m.try_catches = vec![TryCatch {
        start,
        end,
        handler,
        catch_type: Some("java/lang/ArithmeticException".to_string()),
    }];
    vm.preload(class("E", vec![m]));
    let result = vm.invoke_static("E", "f", "()I", vec![]).unwrap();
    assert!(matches!(result, Some(Value::Int(7))));
}

#[test]
fn uncaught_null_dereference_is_reported_as_such() {
    let vm = Vm::new(&EmptyHandler);
    vm.preload(class(
        "N",
        vec![static_method(
            "f",
            "()I",
            vec![
                Insn::Simple(ACONST_NULL),
                Insn::Simple(ARRAYLENGTH),
                Insn::Simple(IRETURN),
            ],
        )],
    ));
    let err = vm.invoke_static("N", "f", "()I", vec![]).unwrap_err();
    assert!(err.is_null_deref());
}

#[test]
fn lookup_find_static_reveals_a_direct_reference() {
    let vm = Vm::new(&EmptyHandler);
    vm.preload(class(
        "B",
        vec![static_method(
            "bootstrap",
            "(Ljava/lang/invoke/MethodHandles$Lookup;)Ljava/lang/invoke/MethodHandle;",
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
        )],
    ));
    let handle = vm
        .invoke_static(
            "B",
            "bootstrap",
            "(Ljava/lang/invoke/MethodHandles$Lookup;)Ljava/lang/invoke/MethodHandle;",
            vec![vm.trusted_lookup()],
        )
        .unwrap()
        .unwrap();
    let revealed = vm.reveal_method_handle(&handle).unwrap();
    assert_eq!(revealed.owner, "D");
    assert_eq!(revealed.name, "target");
    assert_eq!(revealed.desc, "()J");
}

#[test]
fn unknown_classes_are_stubbed_to_defaults() {
    let vm = Vm::new(&EmptyHandler);
    let result = vm
        .invoke_static("com/evil/Peripheral", "sideEffect", "()J", vec![])
        .unwrap();
    assert!(matches!(result, Some(Value::Long(0))));
}

#[test]
fn runaway_initializers_hit_the_budget() {
    let vm = Vm::new(&EmptyHandler);
    let mut m = static_method("spin", "()V", vec![]);
    let top = m.new_label();
    m.insns = vec![
        Insn::Label(top),
        Insn::Jump { op: GOTO, target: top },
    ];
    vm.preload(class("L", vec![m]));
    let err = vm.invoke_static("L", "spin", "()V", vec![]).unwrap_err();
    assert!(matches!(err, VmError::Budget));
}

#[test]
fn version_range_is_host_derived() {
    let range = supported_class_versions();
    assert_eq!(*range.start(), 45);
    assert!(range.contains(&52));
}
