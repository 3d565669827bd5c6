//!
//! The sandbox VM: a restricted loader and interpreter that executes
//! selected classes from the universe so obfuscator initialization code can
//! run and its results be read back.
//!
//! A `Vm` is single-use and cheap. It shares nothing with other instances
//! except the immutable allow-list table, so class identity and static
//! state reset with every new `Vm`.

use lc_ir::{ClassNode, Handle};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

mod interp;
mod intrinsics;
mod loader;
#[cfg(test)]
mod test;
mod value;

pub use loader::{supported_class_versions, LoadedClass, RuntimeClass};
pub use value::{default_return, default_value, Obj, ObjRef, Value};

/// An exception raised by sandboxed code (or by the sandbox on its behalf).
#[derive(Debug)]
pub struct ThrownException {
    /// Internal name of the exception class.
    pub class: String,
    pub message: Option<String>,
    /// The heap object, when the code built one.
    pub value: Option<Value>,
}

/// Errors surfacing from sandbox execution.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("sandboxed code threw {}: {}", .0.class, .0.message.as_deref().unwrap_or(""))]
    Thrown(ThrownException),
    #[error("class {0} not found in the sandbox")]
    ClassNotFound(String),
    #[error("method {owner}.{name}{desc} not found")]
    MethodNotFound {
        owner: String,
        name: String,
        desc: String,
    },
    #[error("value of unexpected type: expected {expected}")]
    Type { expected: &'static str },
    #[error("operand stack underflow in sandboxed method")]
    StackUnderflow,
    #[error("instruction budget exhausted")]
    Budget,
    #[error("call depth limit exceeded")]
    Depth,
    #[error("unsupported instruction {opcode:#04x}")]
    Unsupported { opcode: u8 },
    #[error(transparent)]
    Ir(#[from] lc_ir::IrError),
}

impl VmError {
    pub fn thrown(class: &str, message: impl Into<Option<String>>) -> VmError {
        VmError::Thrown(ThrownException {
            class: class.to_string(),
            message: message.into(),
            value: None,
        })
    }

    pub fn npe() -> VmError {
        VmError::thrown("java/lang/NullPointerException", None)
    }

    /// A cryptographic padding failure, the ZKM signal for a wrong key.
    pub fn is_bad_padding(&self) -> bool {
        matches!(self, VmError::Thrown(t) if t.class == "javax/crypto/BadPaddingException")
    }

    pub fn is_null_deref(&self) -> bool {
        matches!(self, VmError::Thrown(t) if t.class == "java/lang/NullPointerException")
    }
}

pub type Result<T> = std::result::Result<T, VmError>;

/// Resolves class names the sandbox cannot find in its own cache.
/// Implementations typically look into the universe.
pub trait ReferenceHandler {
    fn try_class_load(&self, name: &str) -> Option<ClassNode>;
}

/// A handler that knows nothing; only preloaded, intrinsic and stubbed
/// classes resolve.
pub struct EmptyHandler;

impl ReferenceHandler for EmptyHandler {
    fn try_class_load(&self, _name: &str) -> Option<ClassNode> {
        None
    }
}

/// A revealed method handle: enough to reconstruct the direct reference
/// instruction a dynamic call site stood for.
pub type RevealedHandle = Handle;

/// The sandbox. See the module docs for the lifecycle.
pub struct Vm<'h> {
    pub(crate) handler: &'h dyn ReferenceHandler,
    pub(crate) classes: RefCell<HashMap<String, LoadedClass>>,
    strings: RefCell<HashMap<String, ObjRef>>,
    steps: Cell<u64>,
    max_steps: u64,
    depth: Cell<u32>,
}

/// Instruction budget per `Vm`; initializers past this are runaway.
const DEFAULT_MAX_STEPS: u64 = 4_000_000;
const MAX_DEPTH: u32 = 128;

impl<'h> Vm<'h> {
    pub fn new(handler: &'h dyn ReferenceHandler) -> Self {
        Self {
            handler,
            classes: RefCell::new(HashMap::new()),
            strings: RefCell::new(HashMap::new()),
            steps: Cell::new(0),
            max_steps: DEFAULT_MAX_STEPS,
            depth: Cell::new(0),
        }
    }

    /// Injects a class into the loader cache without initializing it.
    pub fn preload(&self, node: ClassNode) {
        let name = node.name.clone();
        self.classes
            .borrow_mut()
            .insert(name, LoadedClass::User(Rc::new(RuntimeClass::new(node))));
    }

    /// Resolves a class by the loader policy. `None` means the name could
    /// not be resolved at all, which the policy reserves for array-shaped
    /// or malformed names; plain unknown classes come back as stubs.
    pub fn load_class(&self, name: &str) -> Option<LoadedClass> {
        loader::resolve(self, name)
    }

    /// Runs the class's static initializer if it has not run yet.
    pub fn initialize_class(&self, name: &str) -> Result<()> {
        if let Some(LoadedClass::User(rc)) = self.load_class(name) {
            loader::ensure_initialized(self, &rc)?;
        }
        Ok(())
    }

    /// Invokes a static method and returns its result (`None` for void).
    pub fn invoke_static(
        &self,
        class: &str,
        name: &str,
        desc: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        interp::invoke_static(self, class, name, desc, args)
    }

    /// Reads a static field after initialization, as the constant-field
    /// inliner does. `None` when the class is not a user class or the
    /// field was never written and has no default.
    pub fn static_field(&self, class: &str, name: &str, desc: &str) -> Option<Value> {
        match self.load_class(class)? {
            LoadedClass::User(rc) => {
                loader::ensure_initialized(self, &rc).ok()?;
                Some(
                    rc.statics
                        .borrow()
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| default_value(desc)),
                )
            }
            _ => None,
        }
    }

    /// A lookup with private access everywhere, as obfuscator bootstrap
    /// methods demand. The single acknowledged piece of runtime privilege.
    pub fn trusted_lookup(&self) -> Value {
        Value::obj(Obj::Lookup { trusted: true })
    }

    /// Exposes the target reference of a method handle value, also looking
    /// through call sites. `None` if the value is no handle.
    pub fn reveal_method_handle(&self, value: &Value) -> Option<RevealedHandle> {
        match value {
            Value::Ref(obj) => match &*obj.borrow() {
                Obj::MethodHandleObj(handle) => Some(handle.clone()),
                Obj::CallSite { target: Some(target) } => self.reveal_method_handle(target),
                _ => None,
            },
            _ => None,
        }
    }

    /// Materializes a loadable constant as a runtime value, the way `ldc`
    /// would.
    pub fn constant(&self, constant: &lc_ir::ConstOperand) -> Value {
        intrinsics::constant_value(self, constant)
    }

    /// One interned string object per distinct content, per `Vm`.
    pub fn intern(&self, s: &str) -> Value {
        let mut strings = self.strings.borrow_mut();
        let obj = strings
            .entry(s.to_string())
            .or_insert_with(|| Rc::new(RefCell::new(Obj::Str(s.to_string()))));
        Value::Ref(obj.clone())
    }

    pub(crate) fn charge(&self, steps: u64) -> Result<()> {
        let used = self.steps.get() + steps;
        self.steps.set(used);
        if used > self.max_steps {
            return Err(VmError::Budget);
        }
        Ok(())
    }

    pub(crate) fn enter(&self) -> Result<()> {
        let depth = self.depth.get() + 1;
        if depth > MAX_DEPTH {
            return Err(VmError::Depth);
        }
        self.depth.set(depth);
        Ok(())
    }

    pub(crate) fn leave(&self) {
        self.depth.set(self.depth.get() - 1);
    }
}
