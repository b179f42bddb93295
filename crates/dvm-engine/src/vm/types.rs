//! Static register types produced by the front-end type checker

use crate::vm::value::ValueTag;

/// Scalar payload kinds that live unboxed inside a value slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    /// 0 or 1 in the integer payload word
    Bool,
    /// Signed 64-bit integer (enums use the same payload)
    Int,
    /// IEEE-754 double
    Float,
    /// Two doubles, real then imaginary
    Complex,
}

impl ScalarKind {
    /// Number of 64-bit payload words
    pub fn lanes(self) -> usize {
        match self {
            ScalarKind::Complex => 2,
            _ => 1,
        }
    }
}

/// Element kind of a numeric array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Int,
    Float,
    Complex,
}

impl ElementKind {
    /// Size of one element in 64-bit words
    pub fn words(self) -> usize {
        match self {
            ElementKind::Complex => 2,
            _ => 1,
        }
    }

    /// Tag of a scalar value of this kind
    pub fn tag(self) -> ValueTag {
        match self {
            ElementKind::Int => ValueTag::Int,
            ElementKind::Float => ValueTag::Float,
            ElementKind::Complex => ValueTag::Complex,
        }
    }

    /// Scalar kind of one element
    pub fn scalar(self) -> ScalarKind {
        match self {
            ElementKind::Int => ScalarKind::Int,
            ElementKind::Float => ScalarKind::Float,
            ElementKind::Complex => ScalarKind::Complex,
        }
    }

    /// Decode from a value tag
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            t if t == ValueTag::Int as u32 => Some(ElementKind::Int),
            t if t == ValueTag::Float as u32 => Some(ElementKind::Float),
            t if t == ValueTag::Complex as u32 => Some(ElementKind::Complex),
            _ => None,
        }
    }
}

/// Static type of a virtual register or container item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Untyped none (also the index type of whole-array assignment)
    None,
    Bool,
    Int,
    Float,
    Complex,
    /// Enumerated value, stored as an integer payload
    Enum,
    String,
    /// Numeric array with the given element kind
    Array(ElementKind),
    /// List of items of one type
    List(Box<ValueType>),
    /// Fixed tuple with per-item types
    Tuple(Vec<ValueType>),
    /// Class instance, by class id
    Object(u32),
    /// Dynamically typed
    Any,
}

impl ValueType {
    /// Scalar payload kind, if values of this type are unboxed scalars
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            ValueType::Bool => Some(ScalarKind::Bool),
            ValueType::Int | ValueType::Enum => Some(ScalarKind::Int),
            ValueType::Float => Some(ScalarKind::Float),
            ValueType::Complex => Some(ScalarKind::Complex),
            _ => None,
        }
    }

    /// Tag every value of this type carries, `None` for dynamic types
    pub fn tag(&self) -> Option<ValueTag> {
        Some(match self {
            ValueType::None => ValueTag::None,
            ValueType::Bool => ValueTag::Bool,
            ValueType::Int => ValueTag::Int,
            ValueType::Float => ValueTag::Float,
            ValueType::Complex => ValueTag::Complex,
            ValueType::Enum => ValueTag::Enum,
            ValueType::String => ValueTag::String,
            ValueType::Array(_) => ValueTag::Array,
            ValueType::List(_) => ValueTag::List,
            ValueType::Tuple(_) => ValueTag::Tuple,
            ValueType::Object(_) => ValueTag::Object,
            ValueType::Any => return None,
        })
    }

    /// Integer-like discriminant usable by a compiled switch
    pub fn is_integral(&self) -> bool {
        matches!(self, ValueType::Int | ValueType::Enum)
    }

    /// Array with integer, float, or complex elements
    pub fn is_numeric_array(&self) -> bool {
        matches!(self, ValueType::Array(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_kinds() {
        assert_eq!(ValueType::Enum.scalar_kind(), Some(ScalarKind::Int));
        assert_eq!(ValueType::Complex.scalar_kind().map(ScalarKind::lanes), Some(2));
        assert_eq!(ValueType::String.scalar_kind(), None);
        assert_eq!(ValueType::Any.tag(), None);
    }

    #[test]
    fn test_element_kind_order() {
        assert!(ElementKind::Int < ElementKind::Float);
        assert!(ElementKind::Float < ElementKind::Complex);
        assert_eq!(ElementKind::from_tag(ValueTag::Float as u32), Some(ElementKind::Float));
        assert_eq!(ElementKind::from_tag(ValueTag::String as u32), None);
    }
}
