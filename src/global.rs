/// Library roots reachable from every script: the `Global` static
/// object, the stock `Iterator` used by for-in, `JSON`, and the built-in
/// property calls on arrays and strings.
///
/// Identifier resolution falls through `this` and the program to
/// `GLOBAL`, so everything registered here is visible as a bare name.

use crate::atom::{Atom, SharedAtom};
use crate::error::{CallReturnValue, Error};
use crate::gc::ObjId;
use crate::object::{mater_array, mater_object, ObjectKind, SetType, StaticObject};
use crate::runtime::Environment;
use crate::time::{Duration, Time};
use crate::timer::TIMER_PROTO;
use crate::value::Value;
use crate::vm::ExecutionUnit;

pub static ITERATOR: StaticObject = StaticObject {
    name: SharedAtom::Iterator,
    functions: &[
        (SharedAtom::Constructor, iterator_constructor),
        (SharedAtom::Done, iterator_done),
        (SharedAtom::GetValue, iterator_get_value),
        (SharedAtom::Next, iterator_next),
        (SharedAtom::SetValue, iterator_set_value),
    ],
    objects: &[],
    values: &[],
};

pub static JSON: StaticObject = StaticObject {
    name: SharedAtom::Json,
    functions: &[
        (SharedAtom::Parse, json_parse),
        (SharedAtom::Stringify, json_stringify),
    ],
    objects: &[],
    values: &[],
};

pub static GLOBAL: StaticObject = StaticObject {
    name: SharedAtom::Global,
    functions: &[
        (SharedAtom::Arguments, global_arguments),
        (SharedAtom::CurrentTime, global_current_time),
        (SharedAtom::Delay, global_delay),
        (SharedAtom::Meminfo, global_meminfo),
        (SharedAtom::Print, global_print),
        (SharedAtom::Println, global_println),
        (SharedAtom::ToFloat, global_to_float),
        (SharedAtom::ToInt, global_to_int),
        (SharedAtom::ToUInt, global_to_uint),
        (SharedAtom::WaitForEvent, global_wait_for_event),
    ],
    objects: &[
        (SharedAtom::Iterator, &ITERATOR),
        (SharedAtom::Json, &JSON),
        (SharedAtom::Timer, &TIMER_PROTO),
    ],
    values: &[],
};

// ── Global functions ────────────────────────────────────────────────────

fn global_current_time(
    eu: &mut ExecutionUnit,
    _env: &mut Environment,
    _this: Value,
    _nparams: u32,
) -> CallReturnValue {
    let seconds = Time::now().us() as f64 / 1_000_000.0;
    eu.stack_push(Value::Float(seconds as f32));
    CallReturnValue::ReturnCount(1)
}

fn global_delay(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    nparams: u32,
) -> CallReturnValue {
    if nparams < 1 {
        return CallReturnValue::ReturnCount(0);
    }
    let seconds = eu.to_float_value(env, &eu.native_arg(0, nparams));
    let duration = Duration::from_secs_f32(seconds);
    if duration.is_zero() {
        return CallReturnValue::ReturnCount(0);
    }
    CallReturnValue::Delay(duration)
}

fn print_args(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    nparams: u32,
    newline: bool,
) -> CallReturnValue {
    for i in 0..nparams {
        let s = eu.to_string_value(env, &eu.native_arg(i, nparams));
        eu.print(env, &s);
    }
    if newline {
        eu.print(env, "\n");
    }
    CallReturnValue::ReturnCount(0)
}

fn global_print(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    nparams: u32,
) -> CallReturnValue {
    print_args(eu, env, nparams, false)
}

fn global_println(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    nparams: u32,
) -> CallReturnValue {
    print_args(eu, env, nparams, true)
}

fn global_to_float(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    nparams: u32,
) -> CallReturnValue {
    if nparams < 1 {
        return CallReturnValue::ReturnCount(0);
    }
    let s = eu.to_string_value(env, &eu.native_arg(0, nparams));
    match s.trim().parse::<f32>() {
        Ok(f) => {
            eu.stack_push(Value::Float(f));
            CallReturnValue::ReturnCount(1)
        }
        Err(_) => CallReturnValue::Error(Error::CannotConvertStringToNumber),
    }
}

fn global_to_int(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    nparams: u32,
) -> CallReturnValue {
    if nparams < 1 {
        return CallReturnValue::ReturnCount(0);
    }
    let s = eu.to_string_value(env, &eu.native_arg(0, nparams));
    match s.trim().parse::<i32>() {
        Ok(i) => {
            eu.stack_push(Value::Integer(i));
            CallReturnValue::ReturnCount(1)
        }
        Err(_) => CallReturnValue::Error(Error::CannotConvertStringToNumber),
    }
}

fn global_to_uint(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    nparams: u32,
) -> CallReturnValue {
    if nparams < 1 {
        return CallReturnValue::ReturnCount(0);
    }
    let s = eu.to_string_value(env, &eu.native_arg(0, nparams));
    match s.trim().parse::<u32>() {
        Ok(u) => {
            eu.stack_push(Value::Integer(u as i32));
            CallReturnValue::ReturnCount(1)
        }
        Err(_) => CallReturnValue::Error(Error::CannotConvertStringToNumber),
    }
}

/// The arguments of the innermost script frame, extras included.
fn global_arguments(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    _nparams: u32,
) -> CallReturnValue {
    let mut array = mater_array();
    if let ObjectKind::Array(elements) = &mut array.kind {
        for i in 0..eu.argument_count() {
            elements.push(eu.argument(i));
        }
    }
    let id = env.heap.alloc_object(array);
    eu.stack_push(Value::Object(id));
    CallReturnValue::ReturnCount(1)
}

fn global_wait_for_event(
    _eu: &mut ExecutionUnit,
    _env: &mut Environment,
    _this: Value,
    _nparams: u32,
) -> CallReturnValue {
    CallReturnValue::WaitForEvent
}

fn global_meminfo(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    _nparams: u32,
) -> CallReturnValue {
    let free_size = env.system.heap_free_size();
    let info = env.heap.memory_info().clone();

    let mut obj = mater_object();
    let free_atom = env.atoms.atomize("freeSize");
    let alloc_atom = env.atoms.atomize("allocatedSize");
    let count_atom = env.atoms.atomize("numAllocations");
    obj.set_property(free_atom, Value::Integer(free_size), SetType::AlwaysAdd);
    obj.set_property(
        alloc_atom,
        Value::Integer(info.total_allocated_bytes as i32),
        SetType::AlwaysAdd,
    );
    obj.set_property(
        count_atom,
        Value::Integer(info.num_allocations as i32),
        SetType::AlwaysAdd,
    );
    let id = env.heap.alloc_object(obj);
    eu.stack_push(Value::Object(id));
    CallReturnValue::ReturnCount(1)
}

// ── Iterator ────────────────────────────────────────────────────────────

fn iterator_backing(env: &Environment, this: &Value) -> (Value, i32) {
    let obj = this
        .as_object()
        .and_then(|id| env.heap.object(id))
        .map(|o| {
            (
                o.property(SharedAtom::DunderObject.into())
                    .unwrap_or(Value::Undefined),
                o.property(SharedAtom::DunderIndex.into())
                    .unwrap_or(Value::Integer(0))
                    .as_int(),
            )
        });
    obj.unwrap_or((Value::Undefined, 0))
}

fn iterator_length(env: &Environment, backing: &Value) -> i32 {
    match backing {
        Value::Object(id) => match env.heap.object(*id).map(|o| &o.kind) {
            Some(ObjectKind::Array(elements)) => elements.len() as i32,
            Some(_) => env
                .heap
                .object(*id)
                .map(|o| o.num_properties() as i32)
                .unwrap_or(0),
            None => 0,
        },
        Value::String(id) => env.heap.string(*id).map(|s| s.len() as i32).unwrap_or(0),
        Value::StringLiteral(_) => 0,
        _ => 0,
    }
}

fn iterator_constructor(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    this: Value,
    nparams: u32,
) -> CallReturnValue {
    if nparams != 1 {
        return CallReturnValue::Error(Error::WrongNumberOfParams);
    }
    let Some(id) = this.as_object() else {
        return CallReturnValue::Error(Error::MissingThis);
    };
    let backing = eu.native_arg(0, nparams);
    if let Some(obj) = env.heap.object_mut(id) {
        obj.set_property(
            SharedAtom::DunderObject.into(),
            backing,
            SetType::AddIfNeeded,
        );
        obj.set_property(
            SharedAtom::DunderIndex.into(),
            Value::Integer(0),
            SetType::AddIfNeeded,
        );
    }
    CallReturnValue::ReturnCount(0)
}

fn iterator_done(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    this: Value,
    _nparams: u32,
) -> CallReturnValue {
    let (backing, index) = iterator_backing(env, &this);
    let done = index >= iterator_length(env, &backing);
    eu.stack_push(Value::Bool(done));
    CallReturnValue::ReturnCount(1)
}

fn iterator_next(
    _eu: &mut ExecutionUnit,
    env: &mut Environment,
    this: Value,
    _nparams: u32,
) -> CallReturnValue {
    let Some(id) = this.as_object() else {
        return CallReturnValue::Error(Error::MissingThis);
    };
    let (_, index) = iterator_backing(env, &this);
    if let Some(obj) = env.heap.object_mut(id) {
        obj.set_property(
            SharedAtom::DunderIndex.into(),
            Value::Integer(index + 1),
            SetType::AddIfNeeded,
        );
    }
    CallReturnValue::ReturnCount(0)
}

fn iterator_get_value(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    this: Value,
    _nparams: u32,
) -> CallReturnValue {
    let (backing, index) = iterator_backing(env, &this);
    let value = eu.element_of(env, &backing, &Value::Integer(index));
    eu.stack_push(value);
    CallReturnValue::ReturnCount(1)
}

fn iterator_set_value(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    this: Value,
    nparams: u32,
) -> CallReturnValue {
    if nparams != 1 {
        return CallReturnValue::Error(Error::WrongNumberOfParams);
    }
    let (backing, index) = iterator_backing(env, &this);
    let value = eu.native_arg(0, nparams);
    eu.set_element_on(
        env,
        &backing,
        &Value::Integer(index),
        value,
        SetType::AddIfNeeded,
    );
    CallReturnValue::ReturnCount(0)
}

// ── JSON ────────────────────────────────────────────────────────────────

fn json_to_value(env: &mut Environment, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                    return Value::Integer(i as i32);
                }
            }
            Value::Float(n.as_f64().unwrap_or(0.0) as f32)
        }
        serde_json::Value::String(s) => Value::String(env.heap.alloc_string(s.clone())),
        serde_json::Value::Array(items) => {
            let mut array = mater_array();
            if let ObjectKind::Array(elements) = &mut array.kind {
                elements.reserve(items.len());
            }
            let id = env.heap.alloc_object(array);
            for item in items {
                let v = json_to_value(env, item);
                if let Some(obj) = env.heap.object_mut(id) {
                    if let ObjectKind::Array(elements) = &mut obj.kind {
                        elements.push(v);
                    }
                }
            }
            Value::Object(id)
        }
        serde_json::Value::Object(map) => {
            let id = env.heap.alloc_object(mater_object());
            for (key, item) in map {
                let atom = env.atoms.atomize(key);
                let v = json_to_value(env, item);
                if let Some(obj) = env.heap.object_mut(id) {
                    obj.set_property(atom, v, SetType::AddIfNeeded);
                }
            }
            Value::Object(id)
        }
    }
}

fn value_to_json(
    eu: &ExecutionUnit,
    env: &Environment,
    v: &Value,
    depth: u32,
) -> serde_json::Value {
    if depth > 32 {
        return serde_json::Value::Null;
    }
    match v {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(_) | Value::StringLiteral(_) | Value::Id(_) => {
            serde_json::Value::String(eu.to_string_value(env, v))
        }
        Value::Object(id) => match env.heap.object(*id).map(|o| &o.kind) {
            Some(ObjectKind::Array(elements)) => serde_json::Value::Array(
                elements
                    .iter()
                    .map(|e| value_to_json(eu, env, e, depth + 1))
                    .collect(),
            ),
            Some(ObjectKind::Mater) => {
                let obj = env.heap.object(*id).unwrap();
                let mut map = serde_json::Map::new();
                for (key, value) in &obj.properties {
                    map.insert(
                        env.atoms.string_from(*key).to_string(),
                        value_to_json(eu, env, value, depth + 1),
                    );
                }
                serde_json::Value::Object(map)
            }
            _ => serde_json::Value::Null,
        },
        _ => serde_json::Value::Null,
    }
}

fn json_parse(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    nparams: u32,
) -> CallReturnValue {
    if nparams < 1 {
        return CallReturnValue::Error(Error::WrongNumberOfParams);
    }
    let s = eu.to_string_value(env, &eu.native_arg(0, nparams));
    let value = match serde_json::from_str::<serde_json::Value>(&s) {
        Ok(json) => json_to_value(env, &json),
        Err(_) => Value::Undefined,
    };
    eu.stack_push(value);
    CallReturnValue::ReturnCount(1)
}

fn json_stringify(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    _this: Value,
    nparams: u32,
) -> CallReturnValue {
    if nparams < 1 {
        return CallReturnValue::Error(Error::WrongNumberOfParams);
    }
    let v = eu.native_arg(0, nparams);
    let json = value_to_json(eu, env, &v, 0);
    let s = serde_json::to_string(&json).unwrap_or_default();
    let id = env.heap.alloc_string(s);
    eu.stack_push(Value::String(id));
    CallReturnValue::ReturnCount(1)
}

// ── Built-in property calls on arrays and strings ───────────────────────

fn array_id_of(env: &Environment, v: &Value) -> Option<ObjId> {
    let id = v.as_object()?;
    match env.heap.object(id)?.kind {
        ObjectKind::Array(_) => Some(id),
        _ => None,
    }
}

/// Methods the VM resolves before any property lookup: `push_back`,
/// `pop_back` and friends on arrays, `split`/`trim` on strings, and
/// `toString` on anything. Returns `None` when `prop` is not one of
/// them.
pub fn call_builtin_property(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    obj: &Value,
    prop: Atom,
    nparams: u32,
) -> Option<CallReturnValue> {
    if prop == Atom::from(SharedAtom::ToString) {
        let s = eu.to_string_value(env, obj);
        let id = env.heap.alloc_string(s);
        eu.stack_push(Value::String(id));
        return Some(CallReturnValue::ReturnCount(1));
    }

    if let Some(id) = array_id_of(env, obj) {
        let result = array_call_property(eu, env, id, prop, nparams);
        if result.is_some() {
            return result;
        }
    }

    if obj.is_string() {
        let result = string_call_property(eu, env, obj, prop, nparams);
        if result.is_some() {
            return result;
        }
    }

    None
}

fn array_call_property(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    id: ObjId,
    prop: Atom,
    nparams: u32,
) -> Option<CallReturnValue> {
    let with_elements = |env: &mut Environment, f: &mut dyn FnMut(&mut Vec<Value>) -> Value| {
        let obj = env.heap.object_mut(id)?;
        match &mut obj.kind {
            ObjectKind::Array(elements) => Some(f(elements)),
            _ => None,
        }
    };

    if prop == Atom::from(SharedAtom::Length) {
        let len = with_elements(env, &mut |e| Value::Integer(e.len() as i32))?;
        eu.stack_push(len);
        return Some(CallReturnValue::ReturnCount(1));
    }
    if prop == Atom::from(SharedAtom::PushBack) {
        let v = eu.native_arg(0, nparams);
        with_elements(env, &mut |e| {
            e.push(v.clone());
            Value::Undefined
        })?;
        return Some(CallReturnValue::ReturnCount(0));
    }
    if prop == Atom::from(SharedAtom::PushFront) {
        let v = eu.native_arg(0, nparams);
        with_elements(env, &mut |e| {
            e.insert(0, v.clone());
            Value::Undefined
        })?;
        return Some(CallReturnValue::ReturnCount(0));
    }
    if prop == Atom::from(SharedAtom::PopBack) {
        let v = with_elements(env, &mut |e| e.pop().unwrap_or(Value::Undefined))?;
        eu.stack_push(v);
        return Some(CallReturnValue::ReturnCount(1));
    }
    if prop == Atom::from(SharedAtom::PopFront) {
        let v = with_elements(env, &mut |e| {
            if e.is_empty() {
                Value::Undefined
            } else {
                e.remove(0)
            }
        })?;
        eu.stack_push(v);
        return Some(CallReturnValue::ReturnCount(1));
    }
    if prop == Atom::from(SharedAtom::Back) {
        let v = with_elements(env, &mut |e| e.last().cloned().unwrap_or(Value::Undefined))?;
        eu.stack_push(v);
        return Some(CallReturnValue::ReturnCount(1));
    }
    if prop == Atom::from(SharedAtom::Front) {
        let v = with_elements(env, &mut |e| e.first().cloned().unwrap_or(Value::Undefined))?;
        eu.stack_push(v);
        return Some(CallReturnValue::ReturnCount(1));
    }
    if prop == Atom::from(SharedAtom::Join) {
        let sep = if nparams > 0 {
            eu.to_string_value(env, &eu.native_arg(0, nparams))
        } else {
            ",".to_string()
        };
        let elements = match &env.heap.object(id)?.kind {
            ObjectKind::Array(e) => e.clone(),
            _ => return None,
        };
        let parts: Vec<String> = elements
            .iter()
            .map(|e| eu.to_string_value(env, e))
            .collect();
        let joined = env.heap.alloc_string(parts.join(&sep));
        eu.stack_push(Value::String(joined));
        return Some(CallReturnValue::ReturnCount(1));
    }
    None
}

fn string_call_property(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    obj: &Value,
    prop: Atom,
    nparams: u32,
) -> Option<CallReturnValue> {
    if prop == Atom::from(SharedAtom::Length) {
        let len = eu.to_string_value(env, obj).len();
        eu.stack_push(Value::Integer(len as i32));
        return Some(CallReturnValue::ReturnCount(1));
    }
    if prop == Atom::from(SharedAtom::Trim) {
        let s = eu.to_string_value(env, obj).trim().to_string();
        let id = env.heap.alloc_string(s);
        eu.stack_push(Value::String(id));
        return Some(CallReturnValue::ReturnCount(1));
    }
    if prop == Atom::from(SharedAtom::Split) {
        let s = eu.to_string_value(env, obj);
        let sep = if nparams > 0 {
            eu.to_string_value(env, &eu.native_arg(0, nparams))
        } else {
            ",".to_string()
        };
        let parts: Vec<String> = if sep.is_empty() {
            s.chars().map(|c| c.to_string()).collect()
        } else {
            s.split(&sep).map(|p| p.to_string()).collect()
        };
        let mut array = mater_array();
        if let ObjectKind::Array(elements) = &mut array.kind {
            for part in parts {
                let sid = env.heap.alloc_string(part);
                elements.push(Value::String(sid));
            }
        }
        let id = env.heap.alloc_object(array);
        eu.stack_push(Value::Object(id));
        return Some(CallReturnValue::ReturnCount(1));
    }
    None
}
