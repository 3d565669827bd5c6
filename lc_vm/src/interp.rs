//! The bytecode interpreter.

use crate::loader::{self, LoadedClass};
use crate::value::{default_return, default_value, Obj, Value};
use crate::{intrinsics, Result, ThrownException, Vm, VmError};
use lc_ir::opcodes::*;
use lc_ir::{Handle, HandleKind, Insn, LabelId, MethodDescriptor, MethodNode};
use std::collections::HashMap;
use std::rc::Rc;

pub(crate) struct OperandStack {
    vec: Vec<Value>,
}

impl OperandStack {
    fn new() -> OperandStack {
        OperandStack { vec: Vec::new() }
    }

    fn push(&mut self, value: Value) {
        self.vec.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.vec.pop().ok_or(VmError::StackUnderflow)
    }

    /// Pops two stack slots: one wide value or two narrow ones.
    fn pop2(&mut self) -> Result<Vec<Value>> {
        let top = self.pop()?;
        if top.size() == 2 {
            Ok(vec![top])
        } else {
            let under = self.pop()?;
            Ok(vec![top, under])
        }
    }

    fn pop_int(&mut self) -> Result<i32> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            _ => Err(VmError::Type { expected: "int" }),
        }
    }

    fn pop_long(&mut self) -> Result<i64> {
        match self.pop()? {
            Value::Long(v) => Ok(v),
            _ => Err(VmError::Type { expected: "long" }),
        }
    }

    fn pop_float(&mut self) -> Result<f32> {
        match self.pop()? {
            Value::Float(v) => Ok(v),
            _ => Err(VmError::Type { expected: "float" }),
        }
    }

    fn pop_double(&mut self) -> Result<f64> {
        match self.pop()? {
            Value::Double(v) => Ok(v),
            _ => Err(VmError::Type { expected: "double" }),
        }
    }

    fn pop_reference(&mut self) -> Result<Value> {
        match self.pop()? {
            v @ (Value::Null | Value::Ref(_)) => Ok(v),
            _ => Err(VmError::Type {
                expected: "reference",
            }),
        }
    }
}

pub(crate) struct LocalVariables {
    vec: Vec<Value>,
}

impl LocalVariables {
    fn new(size: usize) -> LocalVariables {
        LocalVariables {
            vec: vec![Value::Null; size],
        }
    }

    fn store(&mut self, address: u16, value: Value) {
        let index = address as usize;
        let needed = index + value.size() as usize;
        if self.vec.len() < needed {
            self.vec.resize(needed, Value::Null);
        }
        self.vec[index] = value;
    }

    fn load(&self, address: u16) -> Value {
        self.vec
            .get(address as usize)
            .cloned()
            .unwrap_or(Value::Null)
    }
}

enum Step {
    Next,
    Jump(LabelId),
    Return(Option<Value>),
}

/// Invokes a static method by the loader policy.
pub(crate) fn invoke_static(
    vm: &Vm<'_>,
    class: &str,
    name: &str,
    desc: &str,
    args: Vec<Value>,
) -> Result<Option<Value>> {
    match loader::resolve(vm, class) {
        Some(LoadedClass::User(rc)) => {
            loader::ensure_initialized(vm, &rc)?;
            match find_method(vm, class, name, desc) {
                Some((owner, method)) if method.is_static() => execute(vm, owner, method, args),
                _ => Ok(default_return(desc)),
            }
        }
        Some(LoadedClass::Intrinsic) => intrinsics::invoke_static(vm, class, name, desc, args),
        Some(LoadedClass::Stub) | None => Ok(default_return(desc)),
    }
}

/// Virtual/interface dispatch on the receiver's runtime class, falling back
/// to the intrinsic table and then to stub defaults.
pub(crate) fn invoke_instance(
    vm: &Vm<'_>,
    declared_owner: &str,
    name: &str,
    desc: &str,
    receiver: Value,
    args: Vec<Value>,
) -> Result<Option<Value>> {
    if receiver.is_null() {
        return Err(VmError::npe());
    }
    if let Some(runtime_class) = receiver.class_name() {
        if let Some((owner, method)) = find_method(vm, &runtime_class, name, desc) {
            if !method.is_static() {
                let mut locals = vec![receiver];
                locals.extend(args);
                return execute(vm, owner, method, locals);
            }
        }
    }
    intrinsics::invoke_instance(vm, declared_owner, name, desc, receiver, args)
}

/// `invokespecial`: constructors, private and super calls resolve against
/// the declared owner, not the runtime class.
fn invoke_special(
    vm: &Vm<'_>,
    owner: &str,
    name: &str,
    desc: &str,
    receiver: Value,
    args: Vec<Value>,
) -> Result<Option<Value>> {
    if receiver.is_null() {
        return Err(VmError::npe());
    }
    match loader::resolve(vm, owner) {
        Some(LoadedClass::User(rc)) => match rc.node.method(name, desc) {
            Some(method) => {
                let method = method.clone();
                let mut locals = vec![receiver];
                locals.extend(args);
                execute(vm, owner.to_string(), method, locals)
            }
            // e.g. the implicit super() into a class outside the universe
            None => intrinsics::invoke_instance(vm, owner, name, desc, receiver, args),
        },
        Some(LoadedClass::Intrinsic) => {
            if name == "<init>" {
                intrinsics::construct(owner, desc, receiver, args)
            } else {
                intrinsics::invoke_instance(vm, owner, name, desc, receiver, args)
            }
        }
        Some(LoadedClass::Stub) | None => Ok(default_return(desc)),
    }
}

/// Dispatches a method handle the way `invokeExact` would.
pub(crate) fn invoke_handle(
    vm: &Vm<'_>,
    handle: &Handle,
    mut args: Vec<Value>,
) -> Result<Option<Value>> {
    match handle.kind {
        HandleKind::InvokeStatic => invoke_static(vm, &handle.owner, &handle.name, &handle.desc, args),
        HandleKind::InvokeVirtual | HandleKind::InvokeInterface => {
            if args.is_empty() {
                return Err(VmError::StackUnderflow);
            }
            let receiver = args.remove(0);
            invoke_instance(vm, &handle.owner, &handle.name, &handle.desc, receiver, args)
        }
        HandleKind::InvokeSpecial => {
            if args.is_empty() {
                return Err(VmError::StackUnderflow);
            }
            let receiver = args.remove(0);
            invoke_special(vm, &handle.owner, &handle.name, &handle.desc, receiver, args)
        }
        HandleKind::NewInvokeSpecial => {
            let instance = new_instance(vm, &handle.owner)?;
            invoke_special(
                vm,
                &handle.owner,
                "<init>",
                &handle.desc,
                instance.clone(),
                args,
            )?;
            Ok(Some(instance))
        }
        HandleKind::GetStatic => Ok(Some(get_static(vm, &handle.owner, &handle.name, &handle.desc)?)),
        HandleKind::PutStatic => {
            let value = args.pop().ok_or(VmError::StackUnderflow)?;
            put_static(vm, &handle.owner, &handle.name, value);
            Ok(None)
        }
        HandleKind::GetField => {
            let receiver = args.pop().ok_or(VmError::StackUnderflow)?;
            Ok(Some(get_field(&receiver, &handle.name, &handle.desc)?))
        }
        HandleKind::PutField => {
            let value = args.pop().ok_or(VmError::StackUnderflow)?;
            let receiver = args.pop().ok_or(VmError::StackUnderflow)?;
            put_field(&receiver, &handle.name, value)?;
            Ok(None)
        }
    }
}

fn find_method(vm: &Vm<'_>, class: &str, name: &str, desc: &str) -> Option<(String, MethodNode)> {
    let mut current = class.to_string();
    for _ in 0..64 {
        match loader::resolve(vm, &current)? {
            LoadedClass::User(rc) => {
                if let Some(method) = rc.node.method(name, desc) {
                    return Some((current, method.clone()));
                }
                current = rc.node.super_name.clone()?;
            }
            _ => return None,
        }
    }
    None
}

pub(crate) fn get_static(vm: &Vm<'_>, owner: &str, name: &str, desc: &str) -> Result<Value> {
    match loader::resolve(vm, owner) {
        Some(LoadedClass::User(rc)) => {
            loader::ensure_initialized(vm, &rc)?;
            Ok(rc
                .statics
                .borrow()
                .get(name)
                .cloned()
                .unwrap_or_else(|| default_value(desc)))
        }
        Some(LoadedClass::Intrinsic) => Ok(intrinsics::get_static(owner, name, desc)),
        Some(LoadedClass::Stub) | None => Ok(default_value(desc)),
    }
}

pub(crate) fn put_static(vm: &Vm<'_>, owner: &str, name: &str, value: Value) {
    if let Some(LoadedClass::User(rc)) = loader::resolve(vm, owner) {
        let _ = loader::ensure_initialized(vm, &rc);
        rc.statics.borrow_mut().insert(name.to_string(), value);
    }
    // writes into intrinsic or stubbed classes are inert
}

fn get_field(receiver: &Value, name: &str, desc: &str) -> Result<Value> {
    match receiver {
        Value::Null => Err(VmError::npe()),
        Value::Ref(obj) => match &*obj.borrow() {
            Obj::Instance { fields, .. } => Ok(fields
                .get(name)
                .cloned()
                .unwrap_or_else(|| default_value(desc))),
            _ => Ok(default_value(desc)),
        },
        _ => Err(VmError::Type {
            expected: "reference",
        }),
    }
}

fn put_field(receiver: &Value, name: &str, value: Value) -> Result<()> {
    match receiver {
        Value::Null => Err(VmError::npe()),
        Value::Ref(obj) => {
            if let Obj::Instance { fields, .. } = &mut *obj.borrow_mut() {
                fields.insert(name.to_string(), value);
            }
            Ok(())
        }
        _ => Err(VmError::Type {
            expected: "reference",
        }),
    }
}

pub(crate) fn new_instance(vm: &Vm<'_>, class: &str) -> Result<Value> {
    if let Some(LoadedClass::User(rc)) = loader::resolve(vm, class) {
        loader::ensure_initialized(vm, &rc)?;
    }
    Ok(Value::obj(Obj::instance(class)))
}

fn new_array(elem: &str, len: i32) -> Result<Value> {
    if len < 0 {
        return Err(VmError::thrown(
            "java/lang/NegativeArraySizeException",
            Some(len.to_string()),
        ));
    }
    let fill = default_value(elem);
    Ok(Value::obj(Obj::Array {
        elem: elem.to_string(),
        data: vec![fill; len as usize],
    }))
}

/// Runs one method body to completion. `args` land in the local slots,
/// receiver first for instance methods.
pub(crate) fn execute(
    vm: &Vm<'_>,
    owner: String,
    method: MethodNode,
    args: Vec<Value>,
) -> Result<Option<Value>> {
    vm.enter()?;
    let result = run(vm, &method, args);
    vm.leave();
    if let Err(error) = &result {
        log::debug!("{}.{}{} raised: {}", owner, method.name, method.desc, error);
    }
    result
}

fn run(vm: &Vm<'_>, method: &MethodNode, args: Vec<Value>) -> Result<Option<Value>> {
    let mut label_pos = HashMap::new();
    for (pos, insn) in method.insns.iter().enumerate() {
        if let Insn::Label(label) = insn {
            label_pos.insert(*label, pos);
        }
    }
    let pos_of = |label: LabelId| -> Result<usize> {
        label_pos
            .get(&label)
            .copied()
            .ok_or(VmError::Unsupported { opcode: GOTO })
    };

    let mut stack = OperandStack::new();
    let mut locals = LocalVariables::new(method.max_locals as usize);
    let mut slot = 0u16;
    for value in args {
        let size = value.size() as u16;
        locals.store(slot, value);
        slot += size;
    }

    let mut pc = 0usize;
    loop {
        if pc >= method.insns.len() {
            // fell off the end; malformed but not worth a crash
            return Ok(None);
        }
        vm.charge(1)?;
        match step(vm, &method.insns[pc], &mut stack, &mut locals) {
            Ok(Step::Next) => pc += 1,
            Ok(Step::Jump(label)) => pc = pos_of(label)?,
            Ok(Step::Return(value)) => return Ok(value),
            Err(VmError::Thrown(thrown)) => {
                match find_handler(vm, method, &label_pos, pc, &thrown)? {
                    Some(handler_pos) => {
                        let value = thrown.value.unwrap_or_else(|| {
                            let mut obj = Obj::instance(thrown.class.clone());
                            if let (Obj::Instance { fields, .. }, Some(msg)) =
                                (&mut obj, &thrown.message)
                            {
                                fields.insert("message".to_string(), Value::str(msg.clone()));
                            }
                            Value::obj(obj)
                        });
                        stack.vec.clear();
                        stack.push(value);
                        pc = handler_pos;
                    }
                    None => return Err(VmError::Thrown(thrown)),
                }
            }
            Err(other) => return Err(other),
        }
    }
}

fn find_handler(
    vm: &Vm<'_>,
    method: &MethodNode,
    label_pos: &HashMap<LabelId, usize>,
    pc: usize,
    thrown: &ThrownException,
) -> Result<Option<usize>> {
    for tc in &method.try_catches {
        let (Some(&start), Some(&end), Some(&handler)) = (
            label_pos.get(&tc.start),
            label_pos.get(&tc.end),
            label_pos.get(&tc.handler),
        ) else {
            continue;
        };
        if pc < start || pc >= end {
            continue;
        }
        let matches = match &tc.catch_type {
            None => true,
            Some(catch) => loader::is_subclass(vm, &thrown.class, catch),
        };
        if matches {
            return Ok(Some(handler));
        }
    }
    Ok(None)
}

fn pop_args(stack: &mut OperandStack, desc: &str) -> Result<Vec<Value>> {
    let parsed: MethodDescriptor = desc.parse()?;
    let mut args = Vec::with_capacity(parsed.params.len());
    for _ in &parsed.params {
        args.push(stack.pop()?);
    }
    args.reverse();
    Ok(args)
}

fn step(
    vm: &Vm<'_>,
    insn: &Insn,
    stack: &mut OperandStack,
    locals: &mut LocalVariables,
) -> Result<Step> {
    match insn {
        Insn::Label(_) | Insn::Line { .. } | Insn::Frame => {}
        Insn::Simple(op) => return step_simple(*op, stack),
        Insn::IntPush { value, .. } => stack.push(Value::Int(*value)),
        Insn::Ldc(constant) => stack.push(intrinsics::constant_value(vm, constant)),
        Insn::Var { op, var } => match *op {
            ILOAD | LLOAD | FLOAD | DLOAD | ALOAD => stack.push(locals.load(*var)),
            ISTORE | LSTORE | FSTORE | DSTORE | ASTORE => {
                let value = stack.pop()?;
                locals.store(*var, value);
            }
            opcode => return Err(VmError::Unsupported { opcode }),
        },
        Insn::Iinc { var, delta } => {
            let value = match locals.load(*var) {
                Value::Int(v) => v,
                _ => return Err(VmError::Type { expected: "int" }),
            };
            locals.store(*var, Value::Int(value.wrapping_add(*delta as i32)));
        }
        Insn::Type { op, ty } => match *op {
            NEW => {
                let instance = new_instance(vm, ty)?;
                stack.push(instance);
            }
            ANEWARRAY => {
                let len = stack.pop_int()?;
                let elem = if ty.starts_with('[') {
                    ty.clone()
                } else {
                    format!("L{};", ty)
                };
                stack.push(new_array(&elem, len)?);
            }
            CHECKCAST => {
                // kept lenient: decryptors only cast values they produced
            }
            INSTANCEOF => {
                let value = stack.pop_reference()?;
                let result = match value.class_name() {
                    Some(class) => loader::is_subclass(vm, &class, ty) as i32,
                    None => 0,
                };
                stack.push(Value::Int(result));
            }
            opcode => return Err(VmError::Unsupported { opcode }),
        },
        Insn::NewArray { elem } => {
            let len = stack.pop_int()?;
            let desc = match *elem {
                T_BOOLEAN => "Z",
                T_CHAR => "C",
                T_FLOAT => "F",
                T_DOUBLE => "D",
                T_BYTE => "B",
                T_SHORT => "S",
                T_INT => "I",
                T_LONG => "J",
                _ => return Err(VmError::Unsupported { opcode: NEWARRAY }),
            };
            stack.push(new_array(desc, len)?);
        }
        Insn::MultiANewArray { desc, dims } => {
            let mut lens = Vec::with_capacity(*dims as usize);
            for _ in 0..*dims {
                lens.push(stack.pop_int()?);
            }
            lens.reverse();
            stack.push(multi_array(desc, &lens)?);
        }
        Insn::Field {
            op,
            owner: field_owner,
            name,
            desc,
        } => match *op {
            GETSTATIC => {
                let value = get_static(vm, field_owner, name, desc)?;
                stack.push(value);
            }
            PUTSTATIC => {
                let value = stack.pop()?;
                put_static(vm, field_owner, name, value);
            }
            GETFIELD => {
                let receiver = stack.pop_reference()?;
                stack.push(get_field(&receiver, name, desc)?);
            }
            PUTFIELD => {
                let value = stack.pop()?;
                let receiver = stack.pop_reference()?;
                put_field(&receiver, name, value)?;
            }
            opcode => return Err(VmError::Unsupported { opcode }),
        },
        Insn::Method {
            op,
            owner: target,
            name,
            desc,
        } => {
            let args = pop_args(stack, desc)?;
            let result = match *op {
                INVOKESTATIC => invoke_static(vm, target, name, desc, args)?,
                INVOKEVIRTUAL | INVOKEINTERFACE => {
                    let receiver = stack.pop_reference()?;
                    invoke_instance(vm, target, name, desc, receiver, args)?
                }
                INVOKESPECIAL => {
                    let receiver = stack.pop_reference()?;
                    invoke_special(vm, target, name, desc, receiver, args)?
                }
                opcode => return Err(VmError::Unsupported { opcode }),
            };
            if let Some(value) = result {
                stack.push(value);
            }
        }
        Insn::InvokeDynamic {
            name,
            desc,
            bootstrap,
            args: static_args,
        } => {
            let dynamic_args = pop_args(stack, desc)?;
            let mut bsm_args = vec![
                vm.trusted_lookup(),
                vm.intern(name),
                Value::obj(Obj::MethodTypeObj(desc.clone())),
            ];
            for constant in static_args {
                bsm_args.push(intrinsics::constant_value(vm, constant));
            }
            let call_site = invoke_handle(vm, bootstrap, bsm_args)?
                .ok_or(VmError::Type { expected: "call site" })?;
            let target = vm
                .reveal_method_handle(&call_site)
                .ok_or(VmError::Type { expected: "call site" })?;
            if let Some(value) = invoke_handle(vm, &target, dynamic_args)? {
                stack.push(value);
            }
        }
        Insn::Jump { op, target } => {
            let jump = match *op {
                GOTO => true,
                IFEQ => stack.pop_int()? == 0,
                IFNE => stack.pop_int()? != 0,
                IFLT => stack.pop_int()? < 0,
                IFGE => stack.pop_int()? >= 0,
                IFGT => stack.pop_int()? > 0,
                IFLE => stack.pop_int()? <= 0,
                IF_ICMPEQ..=IF_ICMPLE => {
                    let b = stack.pop_int()?;
                    let a = stack.pop_int()?;
                    match *op {
                        IF_ICMPEQ => a == b,
                        IF_ICMPNE => a != b,
                        IF_ICMPLT => a < b,
                        IF_ICMPGE => a >= b,
                        IF_ICMPGT => a > b,
                        _ => a <= b,
                    }
                }
                IF_ACMPEQ | IF_ACMPNE => {
                    let b = stack.pop_reference()?;
                    let a = stack.pop_reference()?;
                    let same = match (&a, &b) {
                        (Value::Null, Value::Null) => true,
                        (Value::Ref(x), Value::Ref(y)) => Rc::ptr_eq(x, y),
                        _ => false,
                    };
                    if *op == IF_ACMPEQ {
                        same
                    } else {
                        !same
                    }
                }
                IFNULL => stack.pop_reference()?.is_null(),
                IFNONNULL => !stack.pop_reference()?.is_null(),
                opcode => return Err(VmError::Unsupported { opcode }),
            };
            if jump {
                return Ok(Step::Jump(*target));
            }
        }
        Insn::TableSwitch {
            lo,
            hi,
            default,
            targets,
        } => {
            let key = stack.pop_int()?;
            let target = if key >= *lo && key <= *hi {
                targets[(key - lo) as usize]
            } else {
                *default
            };
            return Ok(Step::Jump(target));
        }
        Insn::LookupSwitch { default, pairs } => {
            let key = stack.pop_int()?;
            let target = pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, t)| *t)
                .unwrap_or(*default);
            return Ok(Step::Jump(target));
        }
    }
    Ok(Step::Next)
}

fn multi_array(desc: &str, lens: &[i32]) -> Result<Value> {
    let elem = desc
        .strip_prefix('[')
        .ok_or(VmError::Unsupported { opcode: MULTIANEWARRAY })?;
    let (&len, rest) = match lens.split_first() {
        Some(split) => split,
        None => return Ok(Value::Null),
    };
    if len < 0 {
        return Err(VmError::thrown(
            "java/lang/NegativeArraySizeException",
            Some(len.to_string()),
        ));
    }
    let mut data = Vec::with_capacity(len as usize);
    for _ in 0..len {
        if rest.is_empty() {
            data.push(default_value(elem));
        } else {
            data.push(multi_array(elem, rest)?);
        }
    }
    Ok(Value::obj(Obj::Array {
        elem: elem.to_string(),
        data,
    }))
}

fn array_index(value: &Value, index: i32) -> Result<usize> {
    let len = match value {
        Value::Null => return Err(VmError::npe()),
        Value::Ref(obj) => match &*obj.borrow() {
            Obj::Array { data, .. } => data.len(),
            _ => return Err(VmError::Type { expected: "array" }),
        },
        _ => return Err(VmError::Type { expected: "array" }),
    };
    if index < 0 || index as usize >= len {
        return Err(VmError::thrown(
            "java/lang/ArrayIndexOutOfBoundsException",
            Some(index.to_string()),
        ));
    }
    Ok(index as usize)
}

fn array_load(value: &Value, index: i32) -> Result<Value> {
    let index = array_index(value, index)?;
    match value {
        Value::Ref(obj) => match &*obj.borrow() {
            Obj::Array { data, .. } => Ok(data[index].clone()),
            _ => unreachable!(),
        },
        _ => unreachable!(),
    }
}

fn array_store(value: &Value, index: i32, item: Value) -> Result<()> {
    let index = array_index(value, index)?;
    match value {
        Value::Ref(obj) => {
            if let Obj::Array { data, .. } = &mut *obj.borrow_mut() {
                data[index] = item;
            }
            Ok(())
        }
        _ => unreachable!(),
    }
}

fn step_simple(op: u8, stack: &mut OperandStack) -> Result<Step> {
    match op {
        NOP => {}
        ACONST_NULL => stack.push(Value::Null),
        ICONST_M1..=ICONST_5 => stack.push(Value::Int(op as i32 - ICONST_0 as i32)),
        LCONST_0 | LCONST_1 => stack.push(Value::Long((op - LCONST_0) as i64)),
        FCONST_0 | FCONST_1 | FCONST_2 => stack.push(Value::Float((op - FCONST_0) as f32)),
        DCONST_0 | DCONST_1 => stack.push(Value::Double((op - DCONST_0) as f64)),
        IALOAD | LALOAD | FALOAD | DALOAD | AALOAD | BALOAD | CALOAD | SALOAD => {
            let index = stack.pop_int()?;
            let array = stack.pop_reference()?;
            stack.push(array_load(&array, index)?);
        }
        IASTORE | FASTORE | AASTORE | LASTORE | DASTORE => {
            let item = stack.pop()?;
            let index = stack.pop_int()?;
            let array = stack.pop_reference()?;
            array_store(&array, index, item)?;
        }
        BASTORE => {
            let item = stack.pop_int()?;
            let index = stack.pop_int()?;
            let array = stack.pop_reference()?;
            array_store(&array, index, Value::Int(item as i8 as i32))?;
        }
        CASTORE => {
            let item = stack.pop_int()?;
            let index = stack.pop_int()?;
            let array = stack.pop_reference()?;
            array_store(&array, index, Value::Int(item as u16 as i32))?;
        }
        SASTORE => {
            let item = stack.pop_int()?;
            let index = stack.pop_int()?;
            let array = stack.pop_reference()?;
            array_store(&array, index, Value::Int(item as i16 as i32))?;
        }
        POP => {
            stack.pop()?;
        }
        POP2 => {
            stack.pop2()?;
        }
        DUP => {
            let top = stack.pop()?;
            stack.push(top.clone());
            stack.push(top);
        }
        DUP_X1 => {
            let a = stack.pop()?;
            let b = stack.pop()?;
            stack.push(a.clone());
            stack.push(b);
            stack.push(a);
        }
        DUP_X2 => {
            let a = stack.pop()?;
            let under = stack.pop2()?;
            stack.push(a.clone());
            for value in under.into_iter().rev() {
                stack.push(value);
            }
            stack.push(a);
        }
        DUP2 => {
            let top = stack.pop2()?;
            for value in top.iter().rev() {
                stack.push(value.clone());
            }
            for value in top.into_iter().rev() {
                stack.push(value);
            }
        }
        DUP2_X1 => {
            let top = stack.pop2()?;
            let under = stack.pop()?;
            for value in top.iter().rev() {
                stack.push(value.clone());
            }
            stack.push(under);
            for value in top.into_iter().rev() {
                stack.push(value);
            }
        }
        DUP2_X2 => {
            let top = stack.pop2()?;
            let under = stack.pop2()?;
            for value in top.iter().rev() {
                stack.push(value.clone());
            }
            for value in under.into_iter().rev() {
                stack.push(value);
            }
            for value in top.into_iter().rev() {
                stack.push(value);
            }
        }
        SWAP => {
            let a = stack.pop()?;
            let b = stack.pop()?;
            stack.push(a);
            stack.push(b);
        }
        IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => {
            let b = stack.pop_int()?;
            let a = stack.pop_int()?;
            let value = match op {
                IADD => a.wrapping_add(b),
                ISUB => a.wrapping_sub(b),
                IMUL => a.wrapping_mul(b),
                IDIV | IREM if b == 0 => {
                    return Err(VmError::thrown(
                        "java/lang/ArithmeticException",
                        Some("/ by zero".to_string()),
                    ))
                }
                IDIV => a.wrapping_div(b),
                IREM => a.wrapping_rem(b),
                ISHL => a.wrapping_shl((b & 31) as u32),
                ISHR => a.wrapping_shr((b & 31) as u32),
                IUSHR => ((a as u32) >> (b & 31) as u32) as i32,
                IAND => a & b,
                IOR => a | b,
                _ => a ^ b,
            };
            stack.push(Value::Int(value));
        }
        LADD | LSUB | LMUL | LDIV | LREM | LAND | LOR | LXOR => {
            let b = stack.pop_long()?;
            let a = stack.pop_long()?;
            let value = match op {
                LADD => a.wrapping_add(b),
                LSUB => a.wrapping_sub(b),
                LMUL => a.wrapping_mul(b),
                LDIV | LREM if b == 0 => {
                    return Err(VmError::thrown(
                        "java/lang/ArithmeticException",
                        Some("/ by zero".to_string()),
                    ))
                }
                LDIV => a.wrapping_div(b),
                LREM => a.wrapping_rem(b),
                LAND => a & b,
                LOR => a | b,
                _ => a ^ b,
            };
            stack.push(Value::Long(value));
        }
        LSHL | LSHR | LUSHR => {
            let shift = stack.pop_int()?;
            let a = stack.pop_long()?;
            let value = match op {
                LSHL => a.wrapping_shl((shift & 63) as u32),
                LSHR => a.wrapping_shr((shift & 63) as u32),
                _ => ((a as u64) >> (shift & 63) as u64) as i64,
            };
            stack.push(Value::Long(value));
        }
        FADD | FSUB | FMUL | FDIV | FREM => {
            let b = stack.pop_float()?;
            let a = stack.pop_float()?;
            let value = match op {
                FADD => a + b,
                FSUB => a - b,
                FMUL => a * b,
                FDIV => a / b,
                _ => a % b,
            };
            stack.push(Value::Float(value));
        }
        DADD | DSUB | DMUL | DDIV | DREM => {
            let b = stack.pop_double()?;
            let a = stack.pop_double()?;
            let value = match op {
                DADD => a + b,
                DSUB => a - b,
                DMUL => a * b,
                DDIV => a / b,
                _ => a % b,
            };
            stack.push(Value::Double(value));
        }
        INEG => {
            let a = stack.pop_int()?;
            stack.push(Value::Int(a.wrapping_neg()));
        }
        LNEG => {
            let a = stack.pop_long()?;
            stack.push(Value::Long(a.wrapping_neg()));
        }
        FNEG => {
            let a = stack.pop_float()?;
            stack.push(Value::Float(-a));
        }
        DNEG => {
            let a = stack.pop_double()?;
            stack.push(Value::Double(-a));
        }
        I2L => {
            let a = stack.pop_int()?;
            stack.push(Value::Long(a as i64));
        }
        I2F => {
            let a = stack.pop_int()?;
            stack.push(Value::Float(a as f32));
        }
        I2D => {
            let a = stack.pop_int()?;
            stack.push(Value::Double(a as f64));
        }
        L2I => {
            let a = stack.pop_long()?;
            stack.push(Value::Int(a as i32));
        }
        L2F => {
            let a = stack.pop_long()?;
            stack.push(Value::Float(a as f32));
        }
        L2D => {
            let a = stack.pop_long()?;
            stack.push(Value::Double(a as f64));
        }
        F2I => {
            let a = stack.pop_float()?;
            stack.push(Value::Int(a as i32));
        }
        F2L => {
            let a = stack.pop_float()?;
            stack.push(Value::Long(a as i64));
        }
        F2D => {
            let a = stack.pop_float()?;
            stack.push(Value::Double(a as f64));
        }
        D2I => {
            let a = stack.pop_double()?;
            stack.push(Value::Int(a as i32));
        }
        D2L => {
            let a = stack.pop_double()?;
            stack.push(Value::Long(a as i64));
        }
        D2F => {
            let a = stack.pop_double()?;
            stack.push(Value::Float(a as f32));
        }
        I2B => {
            let a = stack.pop_int()?;
            stack.push(Value::Int(a as i8 as i32));
        }
        I2C => {
            let a = stack.pop_int()?;
            stack.push(Value::Int(a as u16 as i32));
        }
        I2S => {
            let a = stack.pop_int()?;
            stack.push(Value::Int(a as i16 as i32));
        }
        LCMP => {
            let b = stack.pop_long()?;
            let a = stack.pop_long()?;
            stack.push(Value::Int(match a.cmp(&b) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            }));
        }
        FCMPL | FCMPG => {
            let b = stack.pop_float()?;
            let a = stack.pop_float()?;
            stack.push(Value::Int(compare_floats(a as f64, b as f64, op == FCMPG)));
        }
        DCMPL | DCMPG => {
            let b = stack.pop_double()?;
            let a = stack.pop_double()?;
            stack.push(Value::Int(compare_floats(a, b, op == DCMPG)));
        }
        IRETURN | FRETURN | ARETURN => return Ok(Step::Return(Some(stack.pop()?))),
        LRETURN | DRETURN => return Ok(Step::Return(Some(stack.pop()?))),
        RETURN => return Ok(Step::Return(None)),
        ARRAYLENGTH => {
            let array = stack.pop_reference()?;
            let len = match &array {
                Value::Null => return Err(VmError::npe()),
                Value::Ref(obj) => match &*obj.borrow() {
                    Obj::Array { data, .. } => data.len() as i32,
                    _ => return Err(VmError::Type { expected: "array" }),
                },
                _ => unreachable!(),
            };
            stack.push(Value::Int(len));
        }
        ATHROW => {
            let value = stack.pop_reference()?;
            return Err(throw_value(value));
        }
        MONITORENTER | MONITOREXIT => {
            stack.pop_reference()?;
        }
        opcode => return Err(VmError::Unsupported { opcode }),
    }
    Ok(Step::Next)
}

fn compare_floats(a: f64, b: f64, nan_is_one: bool) -> i32 {
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => {
            if nan_is_one {
                1
            } else {
                -1
            }
        }
    }
}

/// Turns a thrown heap value into the error the interpreter unwinds with.
pub(crate) fn throw_value(value: Value) -> VmError {
    match &value {
        Value::Null => VmError::npe(),
        Value::Ref(obj) => {
            let (class, message) = match &*obj.borrow() {
                Obj::Instance { class, fields } => (
                    class.clone(),
                    fields.get("message").and_then(|m| m.as_str()),
                ),
                other => (
                    match other {
                        Obj::Str(_) => "java/lang/String".to_string(),
                        _ => "java/lang/Object".to_string(),
                    },
                    None,
                ),
            };
            VmError::Thrown(ThrownException {
                class,
                message,
                value: Some(value.clone()),
            })
        }
        _ => VmError::Type {
            expected: "throwable",
        },
    }
}
