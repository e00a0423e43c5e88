/// Integration tests for the scheduler, timers and event dispatch.
///
/// These tests verify:
///   • One-shot timers deliver their callback exactly once
///   • Events dispatch in FIFO order
///   • delay() suspends a task for at least the requested span
///   • Round-robin fairness between two ready tasks
///   • Termination drops a task and runs its finish callback

use m8rscript::{Runtime, TaskState};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

fn capture(runtime: &mut Runtime, src: &str) -> Rc<RefCell<String>> {
    let program = runtime.compile(src).expect("parse should succeed");
    let out = Rc::new(RefCell::new(String::new()));
    let sink = out.clone();
    runtime.spawn(
        program,
        Some(Rc::new(move |s: &str| sink.borrow_mut().push_str(s))),
        None,
    );
    out
}

#[test]
fn test_one_shot_timer_fires_once() {
    let mut runtime = Runtime::new();
    let out = capture(
        &mut runtime,
        r#"
        var t = new Timer(0.05, Timer.Once, function() { println("hi"); });
        t.start();
        waitForEvent();
        "#,
    );
    let started = Instant::now();
    runtime.run_until_idle();
    assert_eq!(*out.borrow(), "hi\n");
    assert!(started.elapsed().as_millis() >= 45, "timer fired too early");
}

#[test]
fn test_stopped_timer_does_not_fire() {
    let mut runtime = Runtime::new();
    let out = capture(
        &mut runtime,
        r#"
        var t = new Timer(0.05, function() { println("nope"); });
        t.start();
        t.stop();
        println("done");
        "#,
    );
    runtime.run_until_idle();
    assert_eq!(*out.borrow(), "done\n");
}

#[test]
fn test_events_dispatch_in_fifo_order() {
    let mut runtime = Runtime::new();
    let out = capture(
        &mut runtime,
        r#"
        var t1 = new Timer(0.03, function() { println(1); });
        var t2 = new Timer(0.03, function() { println(2); });
        var t3 = new Timer(0.03, function() { println(3); });
        t1.start();
        t2.start();
        t3.start();
        waitForEvent();
        "#,
    );
    runtime.run_until_idle();
    assert_eq!(*out.borrow(), "1\n2\n3\n");
}

#[test]
fn test_delay_suspends_then_resumes() {
    let mut runtime = Runtime::new();
    let out = capture(
        &mut runtime,
        r#"
        println("a");
        delay(0.04);
        println("b");
        "#,
    );
    let started = Instant::now();
    runtime.run_until_idle();
    assert_eq!(*out.borrow(), "a\nb\n");
    assert!(started.elapsed().as_millis() >= 35, "delay too short");
}

#[test]
fn test_round_robin_between_delaying_tasks() {
    let mut runtime = Runtime::new();
    let out = Rc::new(RefCell::new(String::new()));

    for name in ["A", "B"] {
        let src = format!(
            r#"
            var i = 0;
            while (i < 3) {{
                println("{}", i);
                ++i;
                delay(0.01);
            }}
            "#,
            name
        );
        let program = runtime.compile(&src).expect("parse should succeed");
        let sink = out.clone();
        runtime.spawn(
            program,
            Some(Rc::new(move |s: &str| sink.borrow_mut().push_str(s))),
            None,
        );
    }

    runtime.run_until_idle();
    let text = out.borrow().clone();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 6, "got: {}", text);
    // Neither task runs twice in a row while the other is runnable
    let a1 = lines.iter().position(|l| *l == "A1").expect("A1 missing");
    let b0 = lines.iter().position(|l| *l == "B0").expect("B0 missing");
    assert!(b0 < a1, "B should run between A iterations: {}", text);
}

#[test]
fn test_repeating_timer_fires_until_stopped() {
    let mut runtime = Runtime::new();
    let out = capture(
        &mut runtime,
        r#"
        var count = 0;
        var t = new Timer(0.02, Timer.Repeating, function() {
            count += 1;
            println(count);
        });
        t.start();
        waitForEvent();
        "#,
    );
    runtime.run_until_idle();
    // waitForEvent resumes after the first delivery; later firings land
    // after the task finished
    let text = out.borrow().clone();
    assert!(text.starts_with("1\n"), "got: {}", text);
}

#[test]
fn test_finish_callback_runs_on_completion() {
    let mut runtime = Runtime::new();
    let program = runtime.compile("var a = 1;").expect("parse should succeed");
    let finished = Rc::new(RefCell::new(false));
    let flag = finished.clone();
    runtime.spawn(
        program,
        None,
        Some(Box::new(move |task: &m8rscript::Task| {
            assert_eq!(task.state(), TaskState::Terminated);
            *flag.borrow_mut() = true;
        })),
    );
    runtime.run_until_idle();
    assert!(*finished.borrow());
}

#[test]
fn test_terminate_removes_task() {
    let mut runtime = Runtime::new();
    let program = runtime
        .compile(
            r#"
            println("once");
            waitForEvent();
            println("never");
            "#,
        )
        .expect("parse should succeed");
    let out = Rc::new(RefCell::new(String::new()));
    let sink = out.clone();
    let task = runtime.spawn(
        program,
        Some(Rc::new(move |s: &str| sink.borrow_mut().push_str(s))),
        None,
    );

    // Let the task reach waitForEvent, then pull it
    runtime.tasks.run_one_iteration(&mut runtime.env);
    runtime.tasks.terminate(&task);
    runtime.run_until_idle();

    assert_eq!(*out.borrow(), "once\n");
    assert!(runtime.tasks.is_empty());
    assert_eq!(task.borrow().state(), TaskState::Terminated);
}

#[test]
fn test_waiting_task_with_no_event_sources_idles() {
    let mut runtime = Runtime::new();
    let out = capture(
        &mut runtime,
        r#"
        println("once");
        waitForEvent();
        println("never");
        "#,
    );
    runtime.run_until_idle();
    assert_eq!(*out.borrow(), "once\n");
}

#[test]
fn test_error_budget_terminates_task() {
    let mut runtime = Runtime::new();
    let out = capture(
        &mut runtime,
        r#"
        var o = {};
        var i = 0;
        while (i < 100) {
            println(o.nothing);
            ++i;
        }
        "#,
    );
    runtime.run_until_idle();
    let text = out.borrow().clone();
    assert!(
        text.contains("Too many runtime errors"),
        "expected the error budget message: {}",
        text
    );
}
