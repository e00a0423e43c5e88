/// The object model: property-bearing heap entities, closures, up-values,
/// and the read-only static objects that back library roots.
///
/// Heap entities are one struct with a kind sum instead of a virtual
/// hierarchy: every object carries an ordered property map, an optional
/// prototype and an optional native payload, and the kind adds array
/// elements or callable state on top.

use crate::atom::Atom;
use crate::gc::{Marker, ObjId};
use crate::value::{NativeFunction, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Property write modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetType {
    /// Append a new binding; fails if the property already exists.
    AlwaysAdd,
    /// Overwrite an existing binding; fails if absent.
    NeverAdd,
    /// Create on first write, overwrite afterwards.
    AddIfNeeded,
}

/// Up-value descriptor recorded by the parser on the owning function:
/// which local of which enclosing frame, and the name for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpValueDesc {
    pub index: u32,
    pub frame: u16,
    pub name: Atom,
}

/// A boxed capture cell. Open up-values reference a live stack slot of an
/// enclosing activation; when that frame is popped the cell is closed and
/// owns the final value. The transition happens exactly once.
#[derive(Debug)]
pub struct UpValue {
    pub stack_index: usize,
    pub closed: bool,
    pub value: Value,
}

impl UpValue {
    pub fn open(stack_index: usize) -> UpValue {
        UpValue {
            stack_index,
            closed: false,
            value: Value::Undefined,
        }
    }
}

pub type UpValueRef = Rc<RefCell<UpValue>>;

/// Compiled function body: bytecode, constant pool, up-value descriptors
/// and frame metadata. Code and constants are shared so the executing VM
/// can hold them without borrowing the heap.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub code: Rc<Vec<u8>>,
    pub constants: Rc<Vec<Value>>,
    pub upvalues: Vec<UpValueDesc>,
    pub formal_param_count: u16,
    pub local_count: u16,
    pub name: Atom,
}

impl FunctionBody {
    pub fn new() -> FunctionBody {
        FunctionBody {
            code: Rc::new(Vec::new()),
            constants: Rc::new(Vec::new()),
            upvalues: Vec::new(),
            formal_param_count: 0,
            local_count: 0,
            name: Atom::NONE,
        }
    }

    pub fn add_upvalue(&mut self, index: u32, frame: u16, name: Atom) -> u32 {
        let entry = UpValueDesc { index, frame, name };
        if let Some(pos) = self.upvalues.iter().position(|u| *u == entry) {
            return pos as u32;
        }
        self.upvalues.push(entry);
        (self.upvalues.len() - 1) as u32
    }
}

/// A function bound to its captured up-values and an optional `this`.
#[derive(Debug, Clone)]
pub struct ClosureBody {
    pub func: ObjId,
    pub this: Value,
    pub upvalues: Vec<UpValueRef>,
}

/// Host-provided object held behind a shared reference count. The core
/// only needs to mark through it and downcast at the boundary.
pub trait NativeObject {
    fn gc_mark(&self, _marker: &mut Marker) {}
    fn as_any(&self) -> &dyn std::any::Any;
}

#[derive(Clone)]
pub enum ObjectKind {
    Mater,
    Array(Vec<Value>),
    Function(FunctionBody),
    Closure(ClosureBody),
}

/// A garbage-collected heap entity.
pub struct HeapObject {
    pub type_name: Atom,
    pub proto: Value,
    pub properties: Vec<(Atom, Value)>,
    pub native: Option<Rc<dyn NativeObject>>,
    pub kind: ObjectKind,
}

impl HeapObject {
    pub fn new(kind: ObjectKind) -> HeapObject {
        HeapObject {
            type_name: Atom::NONE,
            proto: Value::Undefined,
            properties: Vec::new(),
            native: None,
            kind,
        }
    }

    pub fn function(&self) -> Option<&FunctionBody> {
        match &self.kind {
            ObjectKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn closure(&self) -> Option<&ClosureBody> {
        match &self.kind {
            ObjectKind::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn name(&self) -> Atom {
        match &self.kind {
            ObjectKind::Function(f) => f.name,
            _ => Atom::NONE,
        }
    }

    pub fn can_make_closure(&self) -> bool {
        matches!(&self.kind, ObjectKind::Function(_))
    }

    /// Own-property read; proto-chain walking happens at the `Value`
    /// layer where the heap is available.
    pub fn property(&self, prop: Atom) -> Option<Value> {
        self.properties
            .iter()
            .find(|(k, _)| *k == prop)
            .map(|(_, v)| v.clone())
    }

    pub fn set_property(&mut self, prop: Atom, value: Value, set_type: SetType) -> bool {
        let existing = self.properties.iter_mut().find(|(k, _)| *k == prop);
        match (existing, set_type) {
            (Some(_), SetType::AlwaysAdd) => false,
            (Some(slot), _) => {
                slot.1 = value;
                true
            }
            (None, SetType::NeverAdd) => false,
            (None, _) => {
                self.properties.push((prop, value));
                true
            }
        }
    }

    pub fn num_properties(&self) -> usize {
        self.properties.len()
    }

    pub fn property_key_for_index(&self, i: usize) -> Atom {
        self.properties.get(i).map(|(k, _)| *k).unwrap_or(Atom::NONE)
    }

    pub fn gc_mark_children(&self, marker: &mut Marker) {
        marker.value(&self.proto);
        for (_, v) in &self.properties {
            marker.value(v);
        }
        if let Some(native) = &self.native {
            native.gc_mark(marker);
        }
        match &self.kind {
            ObjectKind::Mater => {}
            ObjectKind::Array(elements) => {
                for v in elements {
                    marker.value(v);
                }
            }
            ObjectKind::Function(f) => {
                for v in f.constants.iter() {
                    marker.value(v);
                }
            }
            ObjectKind::Closure(c) => {
                marker.object(c.func);
                marker.value(&c.this);
                for up in &c.upvalues {
                    let up = up.borrow();
                    if up.closed {
                        marker.value(&up.value);
                    }
                }
            }
        }
    }
}

/// Constant value stored in a static-object table.
#[derive(Debug, Clone, Copy)]
pub enum StaticValue {
    Int(i32),
}

/// Read-only table-backed object used for library roots. Never allocated,
/// never collected; `Value::StaticObject` holds a `&'static` reference.
pub struct StaticObject {
    pub name: crate::atom::SharedAtom,
    pub functions: &'static [(crate::atom::SharedAtom, NativeFunction)],
    pub objects: &'static [(crate::atom::SharedAtom, &'static StaticObject)],
    pub values: &'static [(crate::atom::SharedAtom, StaticValue)],
}

impl StaticObject {
    pub fn property(&self, prop: Atom) -> Option<Value> {
        for &(name, func) in self.functions {
            if Atom::from(name) == prop {
                return Some(Value::NativeFunction(func));
            }
        }
        for &(name, obj) in self.objects {
            if Atom::from(name) == prop {
                return Some(Value::StaticObject(obj));
            }
        }
        for &(name, value) in self.values {
            if Atom::from(name) == prop {
                return Some(match value {
                    StaticValue::Int(i) => Value::Integer(i),
                });
            }
        }
        None
    }
}

/// Convenience constructors used across the VM and libraries.
pub fn mater_object() -> HeapObject {
    HeapObject::new(ObjectKind::Mater)
}

pub fn mater_array() -> HeapObject {
    HeapObject::new(ObjectKind::Array(Vec::new()))
}

pub fn function_object(body: FunctionBody) -> HeapObject {
    HeapObject::new(ObjectKind::Function(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::SharedAtom;

    #[test]
    fn set_property_modes() {
        let mut obj = mater_object();
        let key = Atom::from(SharedAtom::Value);

        assert!(!obj.set_property(key, Value::Integer(1), SetType::NeverAdd));
        assert!(obj.set_property(key, Value::Integer(1), SetType::AlwaysAdd));
        assert!(!obj.set_property(key, Value::Integer(2), SetType::AlwaysAdd));
        assert!(obj.set_property(key, Value::Integer(3), SetType::AddIfNeeded));
        assert_eq!(obj.property(key), Some(Value::Integer(3)));
    }

    #[test]
    fn properties_preserve_insertion_order() {
        let mut obj = mater_object();
        let a = Atom::from(SharedAtom::Back);
        let b = Atom::from(SharedAtom::Front);
        obj.set_property(a, Value::Integer(1), SetType::AlwaysAdd);
        obj.set_property(b, Value::Integer(2), SetType::AlwaysAdd);
        assert_eq!(obj.property_key_for_index(0), a);
        assert_eq!(obj.property_key_for_index(1), b);
    }

    #[test]
    fn upvalue_descriptors_deduplicate() {
        let mut f = FunctionBody::new();
        let first = f.add_upvalue(0, 1, Atom::from(SharedAtom::Value));
        let again = f.add_upvalue(0, 1, Atom::from(SharedAtom::Value));
        let other = f.add_upvalue(1, 1, Atom::from(SharedAtom::Name));
        assert_eq!(first, again);
        assert_ne!(first, other);
    }
}
