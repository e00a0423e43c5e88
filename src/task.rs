/// Tasks: scheduler-tracked units wrapping an executable.
///
/// `Executable` is the seam between the scheduler and an interpreter;
/// the bytecode VM is the one implementation here, but the scheduler
/// never assumes more than this surface.

use crate::error::{CallReturnValue, Error};
use crate::gc::Marker;
use crate::runtime::Environment;
use crate::vm::{ExecutionUnit, VmSignals};
use std::cell::RefCell;
use std::rc::Rc;

pub trait Executable {
    fn execute(&mut self, env: &mut Environment) -> CallReturnValue;
    fn ready_to_run(&self) -> bool;
    fn gc_mark(&self, marker: &mut Marker);
    fn signals(&self) -> Rc<VmSignals>;
    fn set_console_print_function(&mut self, f: Rc<dyn Fn(&str)>);
}

impl Executable for ExecutionUnit {
    fn execute(&mut self, env: &mut Environment) -> CallReturnValue {
        self.continue_execution(env)
    }

    fn ready_to_run(&self) -> bool {
        ExecutionUnit::ready_to_run(self)
    }

    fn gc_mark(&self, marker: &mut Marker) {
        ExecutionUnit::gc_mark(self, marker)
    }

    fn signals(&self) -> Rc<VmSignals> {
        ExecutionUnit::signals(self)
    }

    fn set_console_print_function(&mut self, f: Rc<dyn Fn(&str)>) {
        ExecutionUnit::set_console_print_function(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    WaitingForEvent,
    Delaying,
    Terminated,
}

pub type FinishCallback = Box<dyn FnOnce(&Task)>;

pub struct Task {
    executable: Rc<RefCell<dyn Executable>>,
    state: TaskState,
    error: Option<Error>,
    finish_cb: Option<FinishCallback>,
}

pub type TaskRef = Rc<RefCell<Task>>;

impl Task {
    pub fn new(executable: Rc<RefCell<dyn Executable>>) -> TaskRef {
        Rc::new(RefCell::new(Task {
            executable,
            state: TaskState::Ready,
            error: None,
            finish_cb: None,
        }))
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    pub fn set_finish_callback(&mut self, cb: FinishCallback) {
        self.finish_cb = Some(cb);
    }

    pub fn take_finish_callback(&mut self) -> Option<FinishCallback> {
        self.finish_cb.take()
    }

    pub fn ready_to_run(&self) -> bool {
        self.state == TaskState::Ready || self.executable.borrow().ready_to_run()
    }

    pub fn execute(&mut self, env: &mut Environment) -> CallReturnValue {
        self.executable.borrow_mut().execute(env)
    }

    pub fn signals(&self) -> Rc<VmSignals> {
        self.executable.borrow().signals()
    }

    pub fn request_yield(&self) {
        self.signals().request_yield();
    }

    pub fn request_terminate(&self) {
        self.signals().request_terminate();
    }

    pub fn gc_mark(&self, marker: &mut Marker) {
        self.executable.borrow().gc_mark(marker);
    }

    pub fn set_console_print_function(&self, f: Rc<dyn Fn(&str)>) {
        self.executable.borrow_mut().set_console_print_function(f);
    }
}
