/// Cooperative timers.
///
/// Active timers live in the scheduler's list, sorted by fire time with
/// insertion order preserved for equal deadlines. The scheduler fires
/// every due timer at the top of each iteration; repeating timers
/// re-enroll relative to their nominal fire time so they do not drift.

use crate::atom::SharedAtom;
use crate::error::{CallReturnValue, Error};
use crate::gc::Marker;
use crate::object::{NativeObject, SetType, StaticObject, StaticValue};
use crate::runtime::Environment;
use crate::time::{Duration, Time};
use crate::value::Value;
use crate::vm::ExecutionUnit;
use std::cell::RefCell;
use std::rc::Rc;

pub type TimerCallback = Rc<RefCell<dyn FnMut()>>;

pub struct Timer {
    pub duration: Duration,
    pub time_to_fire: Time,
    pub repeating: bool,
    pub running: bool,
    pub callback: TimerCallback,
}

pub type TimerRef = Rc<RefCell<Timer>>;

impl Timer {
    pub fn new(duration: Duration, repeating: bool, callback: TimerCallback) -> TimerRef {
        Rc::new(RefCell::new(Timer {
            duration,
            time_to_fire: Time::default(),
            repeating,
            running: false,
            callback,
        }))
    }
}

/// The scheduler's sorted list of armed timers.
#[derive(Default)]
pub struct TimerList {
    timers: Vec<TimerRef>,
}

impl TimerList {
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn next_fire_time(&self) -> Option<Time> {
        self.timers.first().map(|t| t.borrow().time_to_fire)
    }

    pub fn insert(&mut self, timer: TimerRef) {
        let fire = timer.borrow().time_to_fire;
        let pos = self
            .timers
            .iter()
            .position(|t| t.borrow().time_to_fire > fire)
            .unwrap_or(self.timers.len());
        self.timers.insert(pos, timer);
    }

    pub fn remove(&mut self, timer: &TimerRef) {
        if let Some(pos) = self.timers.iter().position(|t| Rc::ptr_eq(t, timer)) {
            self.timers.remove(pos);
        }
    }

    /// Arm and enroll: `time_to_fire = now + duration`.
    pub fn start(&mut self, timer: &TimerRef) {
        {
            let mut t = timer.borrow_mut();
            t.time_to_fire = Time::now() + t.duration;
            t.running = true;
        }
        self.remove(timer);
        self.insert(timer.clone());
    }

    pub fn stop(&mut self, timer: &TimerRef) {
        timer.borrow_mut().running = false;
        self.remove(timer);
    }

    /// Pop the front timer if it is due.
    pub fn pop_due(&mut self, now: Time) -> Option<TimerRef> {
        let due = {
            let first = self.timers.first()?;
            first.borrow().time_to_fire <= now
        };
        if due {
            Some(self.timers.remove(0))
        } else {
            None
        }
    }
}

// ── Script-visible Timer library root ───────────────────────────────────

struct TimerNative {
    timer: TimerRef,
}

impl NativeObject for TimerNative {
    fn gc_mark(&self, _marker: &mut Marker) {}
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub static TIMER_PROTO: StaticObject = StaticObject {
    name: SharedAtom::Timer,
    functions: &[
        (SharedAtom::Constructor, timer_constructor),
        (SharedAtom::Start, timer_start),
        (SharedAtom::Stop, timer_stop),
    ],
    objects: &[],
    values: &[
        (SharedAtom::Once, StaticValue::Int(0)),
        (SharedAtom::Repeating, StaticValue::Int(1)),
    ],
};

/// `new Timer(duration, [Once|Repeating,] callback)`; duration is in
/// seconds. The callback fires as an event on the owning VM.
fn timer_constructor(
    eu: &mut ExecutionUnit,
    env: &mut Environment,
    this: Value,
    nparams: u32,
) -> CallReturnValue {
    if !(2..=3).contains(&nparams) {
        return CallReturnValue::Error(Error::WrongNumberOfParams);
    }
    let Some(this_id) = this.as_object() else {
        return CallReturnValue::Error(Error::MissingThis);
    };

    let duration = Duration::from_secs_f32(eu.to_float_value(env, &eu.native_arg(0, nparams)));
    let (repeating, func) = if nparams > 2 {
        let repeating = eu.to_bool_value(env, &eu.native_arg(1, nparams));
        (repeating, eu.native_arg(2, nparams))
    } else {
        (false, eu.native_arg(1, nparams))
    };

    // Keep the callback reachable from the timer object
    if let Some(obj) = env.heap.object_mut(this_id) {
        obj.set_property(
            SharedAtom::DunderObject.into(),
            func.clone(),
            SetType::AddIfNeeded,
        );
    }

    let events = eu.events_handle();
    let signals = eu.signals();
    let wake = eu.wake_handle();
    let timer = Timer::new(
        duration,
        repeating,
        Rc::new(RefCell::new(move || {
            ExecutionUnit::enqueue_event(
                &events,
                &signals,
                &wake,
                func.clone(),
                Value::Undefined,
                &[],
            );
        })),
    );

    if let Some(obj) = env.heap.object_mut(this_id) {
        obj.native = Some(Rc::new(TimerNative { timer }));
    }

    CallReturnValue::ReturnCount(0)
}

fn with_timer_native<F>(env: &mut Environment, this: &Value, f: F) -> CallReturnValue
where
    F: FnOnce(&mut Environment, TimerRef) -> CallReturnValue,
{
    let Some(id) = this.as_object() else {
        return CallReturnValue::Error(Error::MissingThis);
    };
    let native = env.heap.object(id).and_then(|o| o.native.clone());
    let Some(native) = native else {
        return CallReturnValue::Error(Error::InvalidArgumentValue);
    };
    let Some(timer) = native.as_any().downcast_ref::<TimerNative>() else {
        return CallReturnValue::Error(Error::InvalidArgumentValue);
    };
    f(env, timer.timer.clone())
}

fn timer_start(
    _eu: &mut ExecutionUnit,
    env: &mut Environment,
    this: Value,
    _nparams: u32,
) -> CallReturnValue {
    with_timer_native(env, &this, |env, timer| {
        env.timers.borrow_mut().start(&timer);
        CallReturnValue::ReturnCount(0)
    })
}

fn timer_stop(
    _eu: &mut ExecutionUnit,
    env: &mut Environment,
    this: Value,
    _nparams: u32,
) -> CallReturnValue {
    with_timer_native(env, &this, |env, timer| {
        env.timers.borrow_mut().stop(&timer);
        CallReturnValue::ReturnCount(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Rc::new(RefCell::new(|| {}))
    }

    #[test]
    fn timers_sort_by_fire_time_with_fifo_ties() {
        let mut list = TimerList::default();
        let a = Timer::new(Duration::from_ms(10), false, noop());
        let b = Timer::new(Duration::from_ms(10), false, noop());
        let c = Timer::new(Duration::from_ms(1), false, noop());

        let base = Time::now();
        a.borrow_mut().time_to_fire = base + Duration::from_ms(10);
        b.borrow_mut().time_to_fire = base + Duration::from_ms(10);
        c.borrow_mut().time_to_fire = base + Duration::from_ms(1);
        list.insert(a.clone());
        list.insert(b.clone());
        list.insert(c.clone());

        let far = base + Duration::from_ms(100);
        let first = list.pop_due(far).unwrap();
        assert!(Rc::ptr_eq(&first, &c));
        let second = list.pop_due(far).unwrap();
        assert!(Rc::ptr_eq(&second, &a));
        let third = list.pop_due(far).unwrap();
        assert!(Rc::ptr_eq(&third, &b));
        assert!(list.pop_due(far).is_none());
    }

    #[test]
    fn stop_removes_from_list() {
        let mut list = TimerList::default();
        let t = Timer::new(Duration::from_ms(5), false, noop());
        list.start(&t);
        assert!(!list.is_empty());
        list.stop(&t);
        assert!(list.is_empty());
        assert!(!t.borrow().running);
    }
}
