//! Runtime values and heap objects of the sandbox.

use lc_ir::Handle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub type ObjRef = Rc<RefCell<Obj>>;

/// A value on the operand stack or in a local slot. Wide values are one
/// entry; the interpreter accounts for their two-slot width where the
/// instruction set cares.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    Ref(ObjRef),
}

impl Value {
    pub fn size(&self) -> u8 {
        match self {
            Value::Long(_) | Value::Double(_) => 2,
            _ => 1,
        }
    }

    pub fn obj(obj: Obj) -> Value {
        Value::Ref(Rc::new(RefCell::new(obj)))
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::obj(Obj::Str(s.into()))
    }

    /// The runtime class of the value, for dispatch and `instanceof`.
    pub fn class_name(&self) -> Option<String> {
        match self {
            Value::Ref(obj) => Some(match &*obj.borrow() {
                Obj::Str(_) => "java/lang/String".to_string(),
                Obj::Array { elem, .. } => format!("[{}", elem),
                Obj::Instance { class, .. } => class.clone(),
                Obj::ClassObj(_) => "java/lang/Class".to_string(),
                Obj::MethodTypeObj(_) => "java/lang/invoke/MethodType".to_string(),
                Obj::MethodHandleObj(_) => "java/lang/invoke/MethodHandle".to_string(),
                Obj::Lookup { .. } => "java/lang/invoke/MethodHandles$Lookup".to_string(),
                Obj::CallSite { .. } => "java/lang/invoke/MutableCallSite".to_string(),
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match self {
            Value::Ref(obj) => match &*obj.borrow() {
                Obj::Str(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A heap object. Strings and invoke-plumbing values get their own variants;
/// everything else is a plain field bag.
#[derive(Debug)]
pub enum Obj {
    Str(String),
    /// `elem` is the element descriptor (`I`, `C`, `Ljava/lang/String;`).
    Array { elem: String, data: Vec<Value> },
    Instance {
        class: String,
        fields: HashMap<String, Value>,
    },
    ClassObj(String),
    MethodTypeObj(String),
    MethodHandleObj(Handle),
    Lookup { trusted: bool },
    CallSite { target: Option<Value> },
}

impl Obj {
    pub fn instance(class: impl Into<String>) -> Obj {
        Obj::Instance {
            class: class.into(),
            fields: HashMap::new(),
        }
    }
}

/// The default value for a field or stubbed return of type `desc`.
pub fn default_value(desc: &str) -> Value {
    match desc.as_bytes().first() {
        Some(b'J') => Value::Long(0),
        Some(b'F') => Value::Float(0.0),
        Some(b'D') => Value::Double(0.0),
        Some(b'L') | Some(b'[') => Value::Null,
        _ => Value::Int(0),
    }
}

/// Default return value for a stubbed method with descriptor `desc`;
/// `None` for void.
pub fn default_return(desc: &str) -> Option<Value> {
    let ret = desc.split(')').nth(1)?;
    match ret {
        "V" => None,
        other => Some(default_value(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_by_descriptor() {
        assert!(matches!(default_value("I"), Value::Int(0)));
        assert!(matches!(default_value("J"), Value::Long(0)));
        assert!(matches!(default_value("[B"), Value::Null));
        assert!(matches!(default_value("Ljava/lang/String;"), Value::Null));
    }

    #[test]
    fn default_returns() {
        assert!(default_return("()V").is_none());
        assert!(matches!(default_return("(II)J"), Some(Value::Long(0))));
        assert!(matches!(
            default_return("()Ljava/lang/Object;"),
            Some(Value::Null)
        ));
    }

    #[test]
    fn runtime_class_names() {
        assert_eq!(
            Value::str("x").class_name().as_deref(),
            Some("java/lang/String")
        );
        let arr = Value::obj(Obj::Array {
            elem: "I".to_string(),
            data: vec![],
        });
        assert_eq!(arr.class_name().as_deref(), Some("[I"));
        assert_eq!(Value::Int(1).class_name(), None);
    }
}
