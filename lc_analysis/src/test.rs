use super::*;
use lc_ir::opcodes::*;
use lc_ir::{Insn, MethodAccess, TryCatch};

fn method_with(insns: Vec<Insn>, max_locals: u16) -> MethodNode {
    let mut m = MethodNode::new(MethodAccess::STATIC, "m", "()V");
    m.insns = insns;
    m.max_locals = max_locals;
    m.max_stack = 8;
    m
}

#[test]
fn folds_bitwise_and() {
    let m = method_with(
        vec![
            Insn::push_int(6),
            Insn::push_int(3),
            Insn::Simple(IAND),
            Insn::Simple(POP),
            Insn::Simple(RETURN),
        ],
        0,
    );
    let frames = analyze(&m, &NoRefs).unwrap();
    let before_pop = frames[3].as_ref().unwrap();
    assert_eq!(before_pop.stack, vec![ConstantValue::Known(ConstOperand::Int(2))]);
}

#[test]
fn folds_long_xor_chain() {
    let m = method_with(
        vec![
            Insn::Ldc(ConstOperand::Long(0x1122_3344)),
            Insn::Ldc(ConstOperand::Long(0xff00)),
            Insn::Simple(LXOR),
            Insn::Simple(POP2),
            Insn::Simple(RETURN),
        ],
        0,
    );
    let frames = analyze(&m, &NoRefs).unwrap();
    let before_pop = frames[3].as_ref().unwrap();
    assert_eq!(
        before_pop.stack,
        vec![ConstantValue::Known(ConstOperand::Long(0x1122_3344 ^ 0xff00))]
    );
}

#[test]
fn joining_distinct_constants_widens() {
    let mut m = method_with(vec![], 2);
    let l1 = m.new_label();
    let l2 = m.new_label();
    m.insns = vec![
        Insn::Simple(ICONST_0),
        Insn::Jump { op: IFEQ, target: l1 },
        Insn::Simple(ICONST_1),
        Insn::Var { op: ISTORE, var: 1 },
        Insn::Jump { op: GOTO, target: l2 },
        Insn::Label(l1),
        Insn::Simple(ICONST_2),
        Insn::Var { op: ISTORE, var: 1 },
        Insn::Label(l2),
        Insn::Var { op: ILOAD, var: 1 },
        Insn::Simple(POP),
        Insn::Simple(RETURN),
    ];
    let frames = analyze(&m, &NoRefs).unwrap();
    let at_join = frames[9].as_ref().unwrap();
    assert!(!at_join.locals[1].is_known());
    let before_pop = frames[10].as_ref().unwrap();
    assert!(!before_pop.stack[0].is_known());
}

#[test]
fn handler_entry_has_single_unknown_on_stack() {
    let mut m = method_with(vec![], 1);
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
    let frames = analyze(&m, &NoRefs).unwrap();
    let at_handler = frames[5].as_ref().unwrap();
    assert_eq!(at_handler.stack.len(), 1);
    assert!(!at_handler.stack[0].is_known());
}

#[test]
fn unreachable_code_has_no_frames() {
    let mut m = method_with(vec![], 0);
    let l = m.new_label();
    m.insns = vec![
        Insn::Jump { op: GOTO, target: l },
        Insn::Simple(ICONST_0),
        Insn::Simple(POP),
        Insn::Label(l),
        Insn::Simple(RETURN),
    ];
    let frames = analyze(&m, &NoRefs).unwrap();
    assert!(frames[1].is_none());
    assert!(frames[2].is_none());
    assert!(frames[4].is_some());
}

struct FieldIsSeven;

impl ConstantRefHandler for FieldIsSeven {
    fn field_value(&self, owner: &str, name: &str, _desc: &str) -> Option<ConstOperand> {
        (owner == "Q" && name == "K").then_some(ConstOperand::Int(7))
    }
}

#[test]
fn reference_handler_feeds_field_loads() {
    let m = method_with(
        vec![
            Insn::Field {
                op: GETSTATIC,
                owner: "Q".to_string(),
                name: "K".to_string(),
                desc: "I".to_string(),
            },
            Insn::Simple(POP),
            Insn::Simple(RETURN),
        ],
        0,
    );
    let frames = analyze(&m, &FieldIsSeven).unwrap();
    assert_eq!(
        frames[1].as_ref().unwrap().stack,
        vec![ConstantValue::Known(ConstOperand::Int(7))]
    );
}

#[test]
fn conversions_track_through() {
    let m = method_with(
        vec![
            Insn::push_int(65),
            Insn::Simple(I2L),
            Insn::Ldc(ConstOperand::Long(1)),
            Insn::Simple(LADD),
            Insn::Simple(POP2),
            Insn::Simple(RETURN),
        ],
        0,
    );
    let frames = analyze(&m, &NoRefs).unwrap();
    assert_eq!(
        frames[4].as_ref().unwrap().stack,
        vec![ConstantValue::Known(ConstOperand::Long(66))]
    );
}
