/// Process-wide runtime state with explicit init and teardown.
///
/// `Environment` bundles what used to be singletons in embedded
/// runtimes of this shape: the atom table, the GC heap, the host system
/// interface, the armed-timer list, and the scheduler wake flag. A
/// `Runtime` owns one environment plus the task manager and offers the
/// compile / spawn / drive conveniences the CLI and tests use.

use crate::atom::{Atom, AtomTable, SharedAtom};
use crate::error::ParseErrorList;
use crate::gc::Heap;
use crate::object::{function_object, FunctionBody};
use crate::parser::Parser;
use crate::program::Program;
use crate::scheduler::TaskManager;
use crate::system::{ConsoleSystemInterface, SystemInterface};
use crate::task::{FinishCallback, Task, TaskRef};
use crate::time::Time;
use crate::timer::TimerList;
use crate::value::Value;
use crate::vm::ExecutionUnit;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub struct Environment {
    pub atoms: AtomTable,
    pub heap: Heap,
    pub system: Rc<dyn SystemInterface>,
    pub timers: Rc<RefCell<TimerList>>,
    pub wake: Rc<Cell<bool>>,
}

impl Environment {
    pub fn new(system: Rc<dyn SystemInterface>) -> Environment {
        Environment {
            atoms: AtomTable::new(),
            heap: Heap::new(),
            system,
            timers: Rc::new(RefCell::new(TimerList::default())),
            wake: Rc::new(Cell::new(false)),
        }
    }
}

pub struct Runtime {
    pub env: Environment,
    pub tasks: TaskManager,
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime::with_system(Rc::new(ConsoleSystemInterface))
    }

    pub fn with_system(system: Rc<dyn SystemInterface>) -> Runtime {
        Runtime {
            env: Environment::new(system),
            tasks: TaskManager::new(),
        }
    }

    /// Compile source into a program: one top-level function plus the
    /// literal pool. Errors come back as the accumulated parse list.
    pub fn compile(&mut self, source: &str) -> Result<Rc<RefCell<Program>>, ParseErrorList> {
        let main = self
            .env
            .heap
            .alloc_object(function_object(FunctionBody::new()));
        if let Some(obj) = self.env.heap.object_mut(main) {
            // Predefined so scripts can overwrite it with a listener
            obj.set_property(
                Atom::from(SharedAtom::ConsoleListener),
                Value::Null,
                crate::object::SetType::AlwaysAdd,
            );
        }

        let mut program = Program::new(main);
        Parser::parse(source, &mut self.env, &mut program)?;
        Ok(Rc::new(RefCell::new(program)))
    }

    /// Wrap a compiled program in a VM task and enqueue it.
    pub fn spawn(
        &mut self,
        program: Rc<RefCell<Program>>,
        console: Option<Rc<dyn Fn(&str)>>,
        finish: Option<FinishCallback>,
    ) -> TaskRef {
        let mut eu = ExecutionUnit::new(self.env.wake.clone());
        if let Some(console) = console {
            eu.set_console_print_function(console);
        }
        eu.start_execution(&mut self.env, program);
        let task = Task::new(Rc::new(RefCell::new(eu)));
        self.tasks.run(task.clone(), finish, &self.env);
        task
    }

    /// Drive the scheduler until no task can make progress: every task
    /// finished, or the remainder are waiting on events with no armed
    /// timer left to produce one.
    pub fn run_until_idle(&mut self) {
        loop {
            let worked = self.tasks.run_one_iteration(&mut self.env);
            if self.tasks.is_empty() {
                break;
            }
            if worked {
                continue;
            }
            let next = self.env.timers.borrow().next_fire_time();
            match next {
                Some(fire) => {
                    let now = Time::now();
                    if fire > now {
                        std::thread::sleep((fire - now).to_std());
                    }
                }
                None => break,
            }
        }
    }

    pub fn gc(&mut self, force: bool) {
        self.tasks.collect_garbage(&mut self.env, force);
    }
}

impl Default for Runtime {
    fn default() -> Runtime {
        Runtime::new()
    }
}
