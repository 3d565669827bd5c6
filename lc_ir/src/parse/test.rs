use super::*;
use crate::insn::Insn;
use crate::opcodes::*;

/// Assembles class bytes for fixtures; mirrors the format, big endian.
#[derive(Default)]
struct Bytes {
    out: Vec<u8>,
}

impl Bytes {
    fn u1(&mut self, v: u8) -> &mut Self {
        self.out.push(v);
        self
    }

    fn u2(&mut self, v: u16) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u4(&mut self, v: u32) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.out.extend_from_slice(bytes);
        self
    }

    fn utf8(&mut self, s: &str) -> &mut Self {
        self.u1(1).u2(s.len() as u16).raw(s.as_bytes())
    }
}

/// A class `Test` with one static method `m ()I` whose body is `code`.
fn class_with_code(code: &[u8], max_stack: u16, max_locals: u16) -> Vec<u8> {
    let mut b = Bytes::default();
    b.u4(0xCAFE_BABE).u2(0).u2(52);
    b.u2(8); // constant pool count
    b.utf8("Test"); // 1
    b.u1(7).u2(1); // 2: Class "Test"
    b.utf8("java/lang/Object"); // 3
    b.u1(7).u2(3); // 4: Class Object
    b.utf8("m"); // 5
    b.utf8("()I"); // 6
    b.utf8("Code"); // 7
    b.u2(0x0021).u2(2).u2(4); // access, this, super
    b.u2(0); // interfaces
    b.u2(0); // fields
    b.u2(1); // methods

    let mut attr = Bytes::default();
    attr.u2(max_stack).u2(max_locals);
    attr.u4(code.len() as u32).raw(code);
    attr.u2(0); // exception table
    attr.u2(0); // code attributes

    b.u2(0x0008).u2(5).u2(6); // static, name, desc
    b.u2(1); // one attribute
    b.u2(7).u4(attr.out.len() as u32).raw(&attr.out);

    b.u2(0); // class attributes
    b.out
}

#[test]
fn rejects_bad_magic() {
    let err = parse_class(&[0, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, IrError::BadMagic { magic: 0 }));
}

#[test]
fn parses_minimal_method() {
    let bytes = class_with_code(&[ICONST_2, IRETURN], 1, 0);
    let class = parse_class(&bytes).unwrap();

    assert_eq!(class.name, "Test");
    assert_eq!(class.super_name.as_deref(), Some("java/lang/Object"));
    assert_eq!(class.version.major, 52);
    assert_eq!(class.methods.len(), 1);

    let m = &class.methods[0];
    assert_eq!(m.name, "m");
    assert_eq!(m.desc, "()I");
    assert_eq!(m.max_stack, 1);
    assert_eq!(
        m.insns,
        vec![Insn::Simple(ICONST_2), Insn::Simple(IRETURN)]
    );
}

#[test]
fn branch_targets_become_labels() {
    // 0: iconst_0  1: ifeq -> 5  4: nop  5: return
    let bytes = class_with_code(&[ICONST_0, IFEQ, 0x00, 0x04, NOP, RETURN], 1, 0);
    let class = parse_class(&bytes).unwrap();
    let m = &class.methods[0];

    let label = match m.insns[1] {
        Insn::Jump { op: IFEQ, target } => target,
        ref other => panic!("expected jump, got {:?}", other),
    };
    assert_eq!(m.insns[0], Insn::Simple(ICONST_0));
    assert_eq!(m.insns[2], Insn::Simple(NOP));
    assert_eq!(m.insns[3], Insn::Label(label));
    assert_eq!(m.insns[4], Insn::Simple(RETURN));
}

#[test]
fn branch_into_an_operand_is_rejected() {
    // ifeq -> 2 lands inside its own operand bytes
    let bytes = class_with_code(&[IFEQ, 0x00, 0x02, NOP, RETURN], 1, 0);
    let err = parse_class(&bytes).unwrap_err();
    assert!(matches!(err, IrError::BadBranchTarget { target: 2 }));
}

#[test]
fn short_form_locals_are_normalized() {
    let bytes = class_with_code(&[ILOAD_2, POP, ALOAD_0, POP, RETURN], 1, 3);
    let class = parse_class(&bytes).unwrap();
    let m = &class.methods[0];
    assert_eq!(m.insns[0], Insn::Var { op: ILOAD, var: 2 });
    assert_eq!(m.insns[2], Insn::Var { op: ALOAD, var: 0 });
}

#[test]
fn unknown_attributes_are_skipped() {
    let mut b = Bytes::default();
    b.u4(0xCAFE_BABE).u2(0).u2(52);
    b.u2(5);
    b.utf8("Test"); // 1
    b.u1(7).u2(1); // 2
    b.utf8("java/lang/Object"); // 3
    b.u1(7).u2(3); // 4
    b.u2(0x0021).u2(2).u2(4);
    b.u2(0).u2(0).u2(0);
    b.u2(1); // one class attribute, with a garbage name the pool calls Utf8
    b.u2(1).u4(3).raw(&[0xde, 0xad, 0x00]);
    let class = parse_class(&b.out).unwrap();
    assert_eq!(class.name, "Test");
    assert!(class.source_file.is_none());
}

#[test]
fn long_constants_take_two_pool_slots() {
    let mut b = Bytes::default();
    b.u4(0xCAFE_BABE).u2(0).u2(52);
    b.u2(7);
    b.utf8("Test"); // 1
    b.u1(7).u2(1); // 2
    b.utf8("java/lang/Object"); // 3
    b.u1(7).u2(3); // 4
    b.u1(5).u4(0x1122_3344).u4(0x5566_7788); // 5 (+6 reserved)
    b.u2(0x0021).u2(2).u2(4);
    b.u2(0).u2(0).u2(0).u2(0);
    let class = parse_class(&b.out).unwrap();
    assert_eq!(class.name, "Test");
}

#[test]
fn modified_utf8_nul() {
    assert_eq!(decode_mutf8(&[0xc0, 0x80]).unwrap(), "\u{0}");
    assert_eq!(decode_mutf8(b"plain").unwrap(), "plain");
    // 3-byte form
    assert_eq!(decode_mutf8(&[0xe2, 0x82, 0xac]).unwrap(), "\u{20ac}");
}
