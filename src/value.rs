/// The polymorphic value cell.
///
/// A `Value` is a tagged cell no larger than two machine words: POD
/// primitives are carried inline, heap entities by generational handle,
/// native objects by reference count, and library roots by `&'static`
/// pointer. The `as_*` accessors are cheap casts that return a default on
/// type mismatch; the heavyweight `to_*` coercions need heap access and
/// live on `ExecutionUnit`.

use crate::atom::Atom;
use crate::error::CallReturnValue;
use crate::gc::{ObjId, StringId};
use crate::object::{NativeObject, StaticObject};
use crate::program::StringLiteral;
use std::fmt;
use std::rc::Rc;

/// Host callable: `(vm, environment, this, argc) -> CallReturnValue`.
/// Arguments are on the VM's runtime stack.
pub type NativeFunction = fn(
    &mut crate::vm::ExecutionUnit,
    &mut crate::runtime::Environment,
    Value,
    u32,
) -> CallReturnValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Undefined,
    Null,
    Bool,
    Integer,
    Float,
    StringLiteral,
    String,
    Id,
    Object,
    NativeObject,
    NativeFunction,
    StaticObject,
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Integer(i32),
    Float(f32),
    StringLiteral(StringLiteral),
    String(StringId),
    Id(Atom),
    Object(ObjId),
    NativeObject(Rc<dyn NativeObject>),
    NativeFunction(NativeFunction),
    StaticObject(&'static StaticObject),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Undefined => ValueType::Undefined,
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::StringLiteral(_) => ValueType::StringLiteral,
            Value::String(_) => ValueType::String,
            Value::Id(_) => ValueType::Id,
            Value::Object(_) => ValueType::Object,
            Value::NativeObject(_) => ValueType::NativeObject,
            Value::NativeFunction(_) => ValueType::NativeFunction,
            Value::StaticObject(_) => ValueType::StaticObject,
        }
    }

    // ── Cheap casts ─────────────────────────────────────────────────────

    pub fn as_int(&self) -> i32 {
        match self {
            Value::Integer(i) => *i,
            _ => 0,
        }
    }

    pub fn as_float(&self) -> f32 {
        match self {
            Value::Float(f) => *f,
            _ => 0.0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            _ => false,
        }
    }

    pub fn as_object(&self) -> Option<ObjId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<StringId> {
        match self {
            Value::String(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_string_literal(&self) -> Option<StringLiteral> {
        match self {
            Value::StringLiteral(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_atom(&self) -> Atom {
        match self {
            Value::Id(atom) => *atom,
            _ => Atom::NONE,
        }
    }

    pub fn as_native_object(&self) -> Option<Rc<dyn NativeObject>> {
        match self {
            Value::NativeObject(rc) => Some(rc.clone()),
            _ => None,
        }
    }

    pub fn as_native_function(&self) -> Option<NativeFunction> {
        match self {
            Value::NativeFunction(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_static_object(&self) -> Option<&'static StaticObject> {
        match self {
            Value::StaticObject(obj) => Some(obj),
            _ => None,
        }
    }

    // ── Predicates ──────────────────────────────────────────────────────

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Value::Integer(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    pub fn is_number(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_) | Value::StringLiteral(_))
    }

    pub fn is_string_literal(&self) -> bool {
        matches!(self, Value::StringLiteral(_))
    }

    pub fn is_id(&self) -> bool {
        matches!(self, Value::Id(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// "Defined": anything but `Undefined`. Property lookups use this to
    /// distinguish a missing binding from a stored `Null`.
    pub fn is_defined(&self) -> bool {
        !self.is_undefined()
    }

    /// True for values whose referent the GC tracks.
    pub fn needs_gc(&self) -> bool {
        matches!(self, Value::Object(_) | Value::String(_))
    }
}

impl Default for Value {
    fn default() -> Value {
        Value::Undefined
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::StringLiteral(a), Value::StringLiteral(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Id(a), Value::Id(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::NativeObject(a), Value::NativeObject(b)) => Rc::ptr_eq(a, b),
            (Value::NativeFunction(a), Value::NativeFunction(b)) => *a == *b,
            (Value::StaticObject(a), Value::StaticObject(b)) => std::ptr::eq(*a, *b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Integer(i) => write!(f, "Integer({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::StringLiteral(id) => write!(f, "StringLiteral({:?})", id),
            Value::String(id) => write!(f, "String({:?})", id),
            Value::Id(atom) => write!(f, "Id({})", atom.raw()),
            Value::Object(id) => write!(f, "Object({:?})", id),
            Value::NativeObject(_) => write!(f, "NativeObject(..)"),
            Value::NativeFunction(_) => write!(f, "NativeFunction(..)"),
            Value::StaticObject(_) => write!(f, "StaticObject(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_accessor_round_trip() {
        let v = Value::Integer(-42);
        assert_eq!(v.value_type(), ValueType::Integer);
        assert_eq!(v.as_int(), -42);

        let f = Value::Float(1.5);
        assert_eq!(f.value_type(), ValueType::Float);
        assert_eq!(f.as_float(), 1.5);

        let b = Value::Bool(true);
        assert_eq!(b.value_type(), ValueType::Bool);
        assert!(b.as_bool());

        let id = Value::Id(Atom::from_raw(7));
        assert_eq!(id.value_type(), ValueType::Id);
        assert_eq!(id.as_atom(), Atom::from_raw(7));
    }

    #[test]
    fn mismatched_accessors_return_defaults() {
        assert_eq!(Value::Null.as_int(), 0);
        assert_eq!(Value::Bool(true).as_float(), 0.0);
        assert!(Value::Integer(1).as_object().is_none());
    }

    #[test]
    fn undefined_is_the_only_undefined() {
        assert!(Value::Undefined.is_undefined());
        assert!(!Value::Null.is_undefined());
        assert!(Value::Null.is_defined());
    }
}
