//! Field and method descriptor parsing.

use crate::{IrError, Result};
use std::fmt;
use std::str::FromStr;

/// The type of a field, parameter or return value.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum FieldType {
    /// B
    Byte,
    /// C
    Char,
    /// D
    Double,
    /// F
    Float,
    /// I
    Int,
    /// J
    Long,
    /// L `ClassName` ;
    Object(String),
    /// S
    Short,
    /// Z
    Boolean,
    /// [
    Array(Box<Self>),
}

impl FieldType {
    fn parse(chars: &mut std::str::Chars<'_>, whole: &str) -> Result<Self> {
        let bad = || IrError::BadDescriptor(whole.to_string());
        Ok(match chars.next().ok_or_else(bad)? {
            'B' => Self::Byte,
            'C' => Self::Char,
            'D' => Self::Double,
            'F' => Self::Float,
            'I' => Self::Int,
            'J' => Self::Long,
            'S' => Self::Short,
            'Z' => Self::Boolean,
            '[' => Self::Array(Box::new(Self::parse(chars, whole)?)),
            'L' => {
                let mut name = String::new();
                loop {
                    match chars.next().ok_or_else(bad)? {
                        ';' => break,
                        c => name.push(c),
                    }
                }
                Self::Object(name)
            }
            _ => return Err(bad()),
        })
    }

    /// Stack slots a value of this type occupies.
    pub fn size(&self) -> u8 {
        match self {
            Self::Double | Self::Long => 2,
            _ => 1,
        }
    }

    /// Whether values of this type live on the stack as references.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Array(_))
    }
}

impl FromStr for FieldType {
    type Err = IrError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let ty = Self::parse(&mut chars, s)?;
        if chars.next().is_some() {
            return Err(IrError::BadDescriptor(s.to_string()));
        }
        Ok(ty)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte => write!(f, "B"),
            Self::Char => write!(f, "C"),
            Self::Double => write!(f, "D"),
            Self::Float => write!(f, "F"),
            Self::Int => write!(f, "I"),
            Self::Long => write!(f, "J"),
            Self::Object(name) => write!(f, "L{};", name),
            Self::Short => write!(f, "S"),
            Self::Boolean => write!(f, "Z"),
            Self::Array(inner) => write!(f, "[{}", inner),
        }
    }
}

/// A parsed method descriptor. `ret` is `None` for `V`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    /// Stack slots the parameters occupy, not counting a receiver.
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(|p| p.size() as u16).sum()
    }

    /// Net stack effect of invoking a method with this descriptor,
    /// `receiver` included when the invocation consumes one.
    pub fn stack_effect(&self, receiver: bool) -> i32 {
        let pushed = self.ret.as_ref().map(|t| t.size() as i32).unwrap_or(0);
        pushed - self.param_slots() as i32 - receiver as i32
    }
}

impl FromStr for MethodDescriptor {
    type Err = IrError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || IrError::BadDescriptor(s.to_string());
        let mut chars = s.chars();
        if chars.next() != Some('(') {
            return Err(bad());
        }
        let mut params = Vec::new();
        loop {
            // peek for the closing paren without consuming a type char
            let rest = chars.as_str();
            match rest.chars().next().ok_or_else(bad)? {
                ')' => {
                    chars.next();
                    break;
                }
                _ => params.push(FieldType::parse(&mut chars, s)?),
            }
        }
        let ret = match chars.as_str() {
            "V" => None,
            _ => Some(FieldType::parse(&mut chars, s)?),
        };
        if ret.is_some() && chars.next().is_some() {
            return Err(bad());
        }
        Ok(Self { params, ret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_types() {
        assert_eq!("I".parse::<FieldType>().unwrap(), FieldType::Int);
        assert_eq!(
            "Ljava/lang/String;".parse::<FieldType>().unwrap(),
            FieldType::Object("java/lang/String".to_string())
        );
        assert_eq!(
            "[[J".parse::<FieldType>().unwrap(),
            FieldType::Array(Box::new(FieldType::Array(Box::new(FieldType::Long))))
        );
        assert!("Ljava/lang/String".parse::<FieldType>().is_err());
        assert!("II".parse::<FieldType>().is_err());
    }

    #[test]
    fn method_descriptors() {
        let desc: MethodDescriptor = "(IJLjava/lang/String;)V".parse().unwrap();
        assert_eq!(
            desc.params,
            vec![
                FieldType::Int,
                FieldType::Long,
                FieldType::Object("java/lang/String".to_string())
            ]
        );
        assert_eq!(desc.ret, None);
        assert_eq!(desc.param_slots(), 4);
        assert_eq!(desc.stack_effect(false), -4);
        assert_eq!(desc.stack_effect(true), -5);

        let desc: MethodDescriptor = "()J".parse().unwrap();
        assert_eq!(desc.ret, Some(FieldType::Long));
        assert_eq!(desc.stack_effect(false), 2);
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!("(I)VX".parse::<MethodDescriptor>().is_err());
        assert!("(".parse::<MethodDescriptor>().is_err());
    }
}
