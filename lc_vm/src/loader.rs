//! The restricted class loader.
//!
//! Resolution order: loader cache (universe classes arrive here through the
//! reference handler or an explicit preload) → reference handler → intrinsic
//! allow-list → synthesized stub. Stubs keep adversarial initializers in
//! peripheral classes from running while still letting decryption routines
//! link.

use crate::{interp, Result, Value, Vm};
use lc_ir::ClassNode;
use once_cell::sync::Lazy;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::rc::Rc;

/// Class format major version the interpreter itself targets.
const CURRENT_CLASS_MAJOR: u16 = 61;

/// Majors the sandbox accepts, derived from the interpreter's own version
/// rather than a frozen table.
pub fn supported_class_versions() -> RangeInclusive<u16> {
    45..=CURRENT_CLASS_MAJOR
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum InitState {
    Uninitialized,
    Running,
    Initialized,
}

/// A class materialized from the universe or the reference handler.
pub struct RuntimeClass {
    pub node: ClassNode,
    pub statics: RefCell<HashMap<String, Value>>,
    state: Cell<InitState>,
}

impl RuntimeClass {
    pub(crate) fn new(node: ClassNode) -> Self {
        Self {
            node,
            statics: RefCell::new(HashMap::new()),
            state: Cell::new(InitState::Uninitialized),
        }
    }
}

/// What a name resolved to under the loader policy.
#[derive(Clone)]
pub enum LoadedClass {
    /// Backed by real bytecode; methods execute in the interpreter.
    User(Rc<RuntimeClass>),
    /// Allow-listed runtime class backed by intrinsics.
    Intrinsic,
    /// Everything else: methods return typed defaults, initializers are
    /// empty.
    Stub,
}

pub(crate) fn resolve(vm: &Vm<'_>, name: &str) -> Option<LoadedClass> {
    if name.starts_with('[') {
        // array classes have no code to run; treat as intrinsic plumbing
        return Some(LoadedClass::Intrinsic);
    }
    if let Some(loaded) = vm.classes.borrow().get(name) {
        return Some(loaded.clone());
    }
    let loaded = match vm.handler.try_class_load(name) {
        Some(node) => {
            if !supported_class_versions().contains(&node.version.major) {
                log::warn!(
                    "class {} has unsupported version {}, loading anyway",
                    name,
                    node.version.major
                );
            }
            LoadedClass::User(Rc::new(RuntimeClass::new(node)))
        }
        None if ALLOW_LIST.contains(name) => LoadedClass::Intrinsic,
        None => {
            log::debug!("stubbing unknown class {}", name);
            LoadedClass::Stub
        }
    };
    vm.classes
        .borrow_mut()
        .insert(name.to_string(), loaded.clone());
    Some(loaded)
}

/// Runs `<clinit>` once. Reentrant loads observe the class as initializing
/// and do not recurse, as on a real runtime.
pub(crate) fn ensure_initialized(vm: &Vm<'_>, rc: &Rc<RuntimeClass>) -> Result<()> {
    if rc.state.get() != InitState::Uninitialized {
        return Ok(());
    }
    rc.state.set(InitState::Running);
    let result = match rc.node.method("<clinit>", "()V") {
        Some(clinit) => interp::execute(vm, rc.node.name.clone(), clinit.clone(), Vec::new())
            .map(|_| ()),
        None => Ok(()),
    };
    rc.state.set(InitState::Initialized);
    result
}

/// Runtime classes the sandbox backs with intrinsics instead of stubs:
/// strings, boxed numerics, the small collection surface decryptors touch,
/// crypto primitives, and method-handle plumbing. Dangerous members of
/// these classes are individually disabled in the intrinsic table.
static ALLOW_LIST: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "java/lang/Object",
        "java/lang/String",
        "java/lang/StringBuilder",
        "java/lang/StringBuffer",
        "java/lang/Math",
        "java/lang/System",
        "java/lang/Class",
        "java/lang/Boolean",
        "java/lang/Byte",
        "java/lang/Character",
        "java/lang/Short",
        "java/lang/Integer",
        "java/lang/Long",
        "java/lang/Float",
        "java/lang/Double",
        "java/lang/Throwable",
        "java/lang/Error",
        "java/lang/Exception",
        "java/lang/RuntimeException",
        "java/lang/IllegalArgumentException",
        "java/lang/IllegalStateException",
        "java/lang/NullPointerException",
        "java/lang/ArithmeticException",
        "java/lang/ClassCastException",
        "java/lang/StringIndexOutOfBoundsException",
        "java/lang/ArrayIndexOutOfBoundsException",
        "java/util/Arrays",
        "java/util/HashMap",
        "java/lang/invoke/MethodHandles",
        "java/lang/invoke/MethodHandles$Lookup",
        "java/lang/invoke/MethodHandle",
        "java/lang/invoke/MethodType",
        "java/lang/invoke/CallSite",
        "java/lang/invoke/ConstantCallSite",
        "java/lang/invoke/MutableCallSite",
        "java/security/Key",
        "javax/crypto/Cipher",
        "javax/crypto/SecretKey",
        "javax/crypto/SecretKeyFactory",
        "javax/crypto/spec/DESKeySpec",
        "javax/crypto/spec/SecretKeySpec",
        "javax/crypto/spec/IvParameterSpec",
    ]
    .into_iter()
    .collect()
});

/// Supertype edges for runtime classes the loader never materializes.
/// Enough to dispatch catch clauses over stubbed and intrinsic exceptions.
static BUILTIN_SUPERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("java/lang/Error", "java/lang/Throwable"),
        ("java/lang/Exception", "java/lang/Throwable"),
        ("java/lang/RuntimeException", "java/lang/Exception"),
        ("java/lang/NullPointerException", "java/lang/RuntimeException"),
        ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
        ("java/lang/ClassCastException", "java/lang/RuntimeException"),
        ("java/lang/NegativeArraySizeException", "java/lang/RuntimeException"),
        ("java/lang/IllegalArgumentException", "java/lang/RuntimeException"),
        ("java/lang/IllegalStateException", "java/lang/RuntimeException"),
        ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
        (
            "java/lang/ArrayIndexOutOfBoundsException",
            "java/lang/IndexOutOfBoundsException",
        ),
        (
            "java/lang/StringIndexOutOfBoundsException",
            "java/lang/IndexOutOfBoundsException",
        ),
        (
            "java/lang/ReflectiveOperationException",
            "java/lang/Exception",
        ),
        (
            "java/lang/NoSuchMethodException",
            "java/lang/ReflectiveOperationException",
        ),
        (
            "java/security/GeneralSecurityException",
            "java/lang/Exception",
        ),
        (
            "java/security/NoSuchAlgorithmException",
            "java/security/GeneralSecurityException",
        ),
        (
            "java/security/InvalidKeyException",
            "java/security/GeneralSecurityException",
        ),
        (
            "javax/crypto/BadPaddingException",
            "java/security/GeneralSecurityException",
        ),
        (
            "javax/crypto/IllegalBlockSizeException",
            "java/security/GeneralSecurityException",
        ),
        (
            "javax/crypto/NoSuchPaddingException",
            "java/security/GeneralSecurityException",
        ),
        ("java/lang/invoke/WrongMethodTypeException", "java/lang/RuntimeException"),
    ]
    .into_iter()
    .collect()
});

/// Conservative subtyping over user classes and the builtin table. A name
/// that resolves nowhere only matches itself and `java/lang/Object` /
/// `java/lang/Throwable`, which keeps catch-all handlers working over
/// stubbed exception types.
pub(crate) fn is_subclass(vm: &Vm<'_>, sub: &str, sup: &str) -> bool {
    if sup == "java/lang/Object" {
        return true;
    }
    let mut current = sub.to_string();
    for _ in 0..64 {
        if current == sup {
            return true;
        }
        if let Some(LoadedClass::User(rc)) = resolve(vm, &current) {
            if rc.node.interfaces.iter().any(|i| i == sup) {
                return true;
            }
            match &rc.node.super_name {
                Some(parent) => current = parent.clone(),
                None => return false,
            }
            continue;
        }
        match BUILTIN_SUPERS.get(current.as_str()) {
            Some(parent) => current = parent.to_string(),
            // unresolvable chain: exceptions still match blanket handlers
            None => return sup == "java/lang/Throwable",
        }
    }
    false
}
