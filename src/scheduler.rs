/// The cooperative task scheduler.
///
/// One iteration fires every due timer, then hands the first ready task
/// a 50 ms time slice. Ready tasks rotate to the tail so two busy tasks
/// interleave strictly. A task's `CallReturnValue` decides its next
/// state; finished and terminated tasks leave the list and run their
/// finish callback.

use crate::error::{CallReturnValue, Error};
use crate::runtime::Environment;
use crate::task::{FinishCallback, TaskRef, TaskState};
use crate::time::{Duration, Time};
use std::rc::Rc;

const TIME_SLICE: Duration = Duration::from_us(50_000);

pub struct TaskManager {
    list: Vec<TaskRef>,
}

impl TaskManager {
    pub fn new() -> TaskManager {
        TaskManager { list: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn run(&mut self, task: TaskRef, finish_cb: Option<FinishCallback>, env: &Environment) {
        {
            let mut t = task.borrow_mut();
            if let Some(cb) = finish_cb {
                t.set_finish_callback(cb);
            }
            t.set_state(TaskState::Ready);
        }
        self.list.push(task);
        env.wake.set(true);
    }

    pub fn terminate(&mut self, task: &TaskRef) {
        if let Some(pos) = self.list.iter().position(|t| Rc::ptr_eq(t, task)) {
            self.list.remove(pos);
        }
        task.borrow().request_terminate();
        task.borrow_mut().set_state(TaskState::Terminated);
    }

    /// Fire timers whose deadline has passed, oldest first. Repeating
    /// timers re-enroll relative to their nominal fire time.
    fn fire_timers(&mut self, env: &mut Environment) -> bool {
        let mut fired = false;
        let now = Time::now();
        loop {
            let due = env.timers.borrow_mut().pop_due(now);
            let Some(timer) = due else { break };
            fired = true;

            let (callback, repeating) = {
                let mut t = timer.borrow_mut();
                t.running = false;
                (t.callback.clone(), t.repeating)
            };
            (callback.borrow_mut())();

            if repeating {
                {
                    let mut t = timer.borrow_mut();
                    let duration = t.duration;
                    t.time_to_fire += duration;
                    t.running = true;
                }
                env.timers.borrow_mut().insert(timer);
            }
        }
        fired
    }

    /// Collect with every task's VM as a root set.
    pub fn collect_garbage(&self, env: &mut Environment, force: bool) {
        let list = &self.list;
        let Environment { heap, .. } = env;
        heap.collect(force, |marker| {
            for task in list {
                task.borrow().gc_mark(marker);
            }
        });
    }

    /// One scheduling round. Returns true iff any work was done.
    pub fn run_one_iteration(&mut self, env: &mut Environment) -> bool {
        let fired = self.fire_timers(env);
        env.wake.set(false);

        let force = env.heap.gc_pending;
        self.collect_garbage(env, force);

        let Some(pos) = self.list.iter().position(|t| t.borrow().ready_to_run()) else {
            return fired;
        };

        let task = self.list[pos].clone();

        // Round-robin: a ready task goes to the tail before running
        if task.borrow().state() == TaskState::Ready {
            self.list.remove(pos);
            self.list.push(task.clone());
        }

        task.borrow()
            .signals()
            .deadline
            .set(Some(Time::now() + TIME_SLICE));
        let result = { task.borrow_mut().execute(env) };
        task.borrow().signals().deadline.set(None);

        match result {
            CallReturnValue::Yield => {
                task.borrow_mut().set_state(TaskState::Ready);
            }
            CallReturnValue::Finished
            | CallReturnValue::Terminated
            | CallReturnValue::Error(_) => {
                if let CallReturnValue::Error(error) = result {
                    task.borrow_mut().set_error(error);
                } else if result.is_terminated() {
                    task.borrow_mut().set_error(Error::Runtime);
                }
                task.borrow_mut().set_state(TaskState::Terminated);
                if let Some(p) = self.list.iter().position(|t| Rc::ptr_eq(t, &task)) {
                    self.list.remove(p);
                }
                let cb = task.borrow_mut().take_finish_callback();
                if let Some(cb) = cb {
                    cb(&task.borrow());
                }
            }
            CallReturnValue::WaitForEvent => {
                task.borrow_mut().set_state(TaskState::WaitingForEvent);
            }
            CallReturnValue::Delay(_) => {
                task.borrow_mut().set_state(TaskState::Delaying);
            }
            _ => {
                // ReturnCount / FunctionStart never escape the VM
                task.borrow_mut().set_state(TaskState::Ready);
            }
        }
        true
    }
}

impl Default for TaskManager {
    fn default() -> TaskManager {
        TaskManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Marker;
    use crate::system::ConsoleSystemInterface;
    use crate::task::{Executable, Task};
    use crate::vm::VmSignals;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    struct StubExec {
        signals: Rc<VmSignals>,
        runs: Rc<Cell<u32>>,
        result: CallReturnValue,
    }

    impl Executable for StubExec {
        fn execute(&mut self, _env: &mut Environment) -> CallReturnValue {
            self.runs.set(self.runs.get() + 1);
            self.result
        }
        fn ready_to_run(&self) -> bool {
            true
        }
        fn gc_mark(&self, _marker: &mut Marker) {}
        fn signals(&self) -> Rc<VmSignals> {
            self.signals.clone()
        }
        fn set_console_print_function(&mut self, _f: Rc<dyn Fn(&str)>) {}
    }

    fn stub_task(result: CallReturnValue) -> (TaskRef, Rc<Cell<u32>>) {
        let runs = Rc::new(Cell::new(0));
        let exec = StubExec {
            signals: Rc::new(VmSignals::default()),
            runs: runs.clone(),
            result,
        };
        (Task::new(Rc::new(RefCell::new(exec))), runs)
    }

    #[test]
    fn empty_manager_does_no_work() {
        let mut manager = TaskManager::new();
        let mut env = Environment::new(Rc::new(ConsoleSystemInterface));
        assert!(!manager.run_one_iteration(&mut env));
    }

    #[test]
    fn finished_task_leaves_the_list_and_finishes() {
        let mut manager = TaskManager::new();
        let mut env = Environment::new(Rc::new(ConsoleSystemInterface));
        let (task, runs) = stub_task(CallReturnValue::Finished);

        let finished = Rc::new(Cell::new(false));
        let flag = finished.clone();
        manager.run(
            task.clone(),
            Some(Box::new(move |t| {
                assert_eq!(t.state(), TaskState::Terminated);
                flag.set(true);
            })),
            &env,
        );

        assert!(manager.run_one_iteration(&mut env));
        assert_eq!(runs.get(), 1);
        assert!(manager.is_empty());
        assert!(finished.get());
    }

    #[test]
    fn yielding_tasks_round_robin() {
        let mut manager = TaskManager::new();
        let mut env = Environment::new(Rc::new(ConsoleSystemInterface));
        let (a, runs_a) = stub_task(CallReturnValue::Yield);
        let (b, runs_b) = stub_task(CallReturnValue::Yield);
        manager.run(a, None, &env);
        manager.run(b, None, &env);

        for _ in 0..4 {
            assert!(manager.run_one_iteration(&mut env));
        }
        // Strict alternation: two rounds each
        assert_eq!(runs_a.get(), 2);
        assert_eq!(runs_b.get(), 2);
    }
}
