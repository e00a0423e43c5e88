/// Integration tests for language execution end to end.
///
/// These tests verify:
///   • Arithmetic precedence and integer/float coercion
///   • Closure capture through up-values, open and closed
///   • for-in iteration over arrays via the stock Iterator
///   • switch dispatch, empty-case fall-through, break
///   • Non-unwinding runtime error recovery
///   • Identifier resolution across this / program / Global
///   • JSON round-trip and codegen error limits

use m8rscript::Runtime;
use std::cell::RefCell;
use std::rc::Rc;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn run_script(src: &str) -> String {
    let mut runtime = Runtime::new();
    let program = runtime.compile(src).expect("parse should succeed");
    let out = Rc::new(RefCell::new(String::new()));
    let sink = out.clone();
    runtime.spawn(
        program,
        Some(Rc::new(move |s: &str| sink.borrow_mut().push_str(s))),
        None,
    );
    runtime.run_until_idle();
    let result = out.borrow().clone();
    result
}

fn parse_errors(src: &str) -> m8rscript::ParseErrorList {
    let mut runtime = Runtime::new();
    runtime.compile(src).expect_err("parse should fail")
}

// ─── Arithmetic and expressions ───────────────────────────────────────────────

#[test]
fn test_arithmetic_precedence() {
    let out = run_script("var a = 2 + 3 * 4; println(a);");
    assert_eq!(out, "14\n");
}

#[test]
fn test_compound_assignment_and_incdec() {
    let out = run_script(
        r#"
        var a = 10;
        a += 5;
        a -= 3;
        a *= 2;
        var b = a++;
        var c = --a;
        println(a, " ", b, " ", c);
        "#,
    );
    assert_eq!(out, "24 24 24\n");
}

#[test]
fn test_ternary_and_logical_operators() {
    let out = run_script(
        r#"
        var x = 5 > 3 ? 1 : 2;
        println(x);
        println(1 && 0);
        println(0 || 7);
        println(0 && 1);
        println(0 || 0);
        "#,
    );
    assert_eq!(out, "1\n0\n1\n0\n0\n");
}

#[test]
fn test_string_concatenation() {
    let out = run_script(r#"var s = "x=" + 5; println(s + "!");"#);
    assert_eq!(out, "x=5!\n");
}

#[test]
fn test_bitwise_and_shift() {
    let out = run_script(
        r#"
        println(6 & 3);
        println(6 | 3);
        println(6 ^ 3);
        println(1 << 4);
        println(-8 >>> 1);
        println(-8 >> 28);
        "#,
    );
    // '>>>' is the arithmetic shift, '>>' the logical one
    assert_eq!(out, "2\n7\n5\n16\n-4\n15\n");
}

#[test]
fn test_float_arithmetic() {
    let out = run_script("println(1.5 + 2.25);");
    assert_eq!(out, "3.75\n");
}

#[test]
fn test_hex_literals() {
    let out = run_script("println(0x10 + 0xff);");
    assert_eq!(out, "271\n");
}

// ─── Control flow ─────────────────────────────────────────────────────────────

#[test]
fn test_while_loop() {
    let out = run_script(
        r#"
        var i = 0;
        var sum = 0;
        while (i < 5) { sum += i; ++i; }
        println(sum);
        "#,
    );
    assert_eq!(out, "10\n");
}

#[test]
fn test_do_while_runs_at_least_once() {
    let out = run_script(
        r#"
        var i = 10;
        do { println(i); ++i; } while (i < 5);
        "#,
    );
    assert_eq!(out, "10\n");
}

#[test]
fn test_for_loop_with_break_and_continue() {
    let out = run_script(
        r#"
        var sum = 0;
        for (var i = 0; i < 10; ++i) {
            if (i == 3) continue;
            if (i == 6) break;
            sum += i;
        }
        println(sum);
        "#,
    );
    // 0+1+2+4+5
    assert_eq!(out, "12\n");
}

#[test]
fn test_switch_break_selects_one_case() {
    let out = run_script(
        "switch(2){case 1: println(1); case 2: println(2); break; case 3: println(3);}",
    );
    assert_eq!(out, "2\n");
}

#[test]
fn test_switch_empty_case_falls_through() {
    let out = run_script(
        r#"
        switch (1) {
            case 1:
            case 2: println("both"); break;
            default: println("neither");
        }
        "#,
    );
    assert_eq!(out, "both\n");
}

#[test]
fn test_switch_default() {
    let out = run_script(
        r#"
        switch (9) {
            case 1: println("one"); break;
            default: println("other"); break;
        }
        "#,
    );
    assert_eq!(out, "other\n");
}

// ─── Functions and closures ───────────────────────────────────────────────────

#[test]
fn test_function_call_and_return() {
    let out = run_script(
        r#"
        function add(a, b) { return a + b; }
        println(add(3, 4));
        "#,
    );
    assert_eq!(out, "7\n");
}

#[test]
fn test_missing_arguments_are_undefined() {
    let out = run_script(
        r#"
        function probe(a, b) { return b; }
        println(probe(1));
        "#,
    );
    assert_eq!(out, "undefined\n");
}

#[test]
fn test_closure_counter() {
    let out = run_script(
        r#"
        function make() {
            var i = 0;
            return function() { return ++i; };
        }
        var f = make();
        println(f());
        println(f());
        "#,
    );
    assert_eq!(out, "1\n2\n");
}

#[test]
fn test_independent_closures() {
    let out = run_script(
        r#"
        function make() {
            var i = 0;
            return function() { return ++i; };
        }
        var f = make();
        var g = make();
        println(f());
        println(f());
        println(g());
        "#,
    );
    assert_eq!(out, "1\n2\n1\n");
}

#[test]
fn test_recursion() {
    let out = run_script(
        r#"
        function fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        println(fib(10));
        "#,
    );
    assert_eq!(out, "55\n");
}

// ─── Arrays, objects and iteration ────────────────────────────────────────────

#[test]
fn test_array_literal_and_indexing() {
    let out = run_script(
        r#"
        var a = [10, 20, 30];
        a[1] = 25;
        println(a[0] + a[1] + a[2]);
        "#,
    );
    assert_eq!(out, "65\n");
}

#[test]
fn test_for_in_sums_elements() {
    let out = run_script(
        r#"
        var a = [10, 20, 30];
        var s = 0;
        for (var v : a) s += v;
        println(s);
        "#,
    );
    assert_eq!(out, "60\n");
}

#[test]
fn test_array_methods() {
    let out = run_script(
        r#"
        var a = [1, 2];
        a.push_back(3);
        println(a.length());
        println(a.back());
        println(a.pop_back());
        println(a.length());
        println(a.join("-"));
        "#,
    );
    assert_eq!(out, "3\n3\n3\n2\n1-2\n");
}

#[test]
fn test_object_literal_and_property_access() {
    let out = run_script(
        r#"
        var o = { x: 3, y: 4 };
        o.x = 5;
        println(o.x + o.y);
        "#,
    );
    assert_eq!(out, "9\n");
}

#[test]
fn test_class_with_constructor_and_method() {
    let out = run_script(
        r#"
        class Point {
            var x = 0;
            var y = 0;
            constructor(a, b) {
                this.x = a;
                this.y = b;
            }
            function sum() { return this.x + this.y; }
        }
        var p = new Point(3, 4);
        println(p.sum());
        "#,
    );
    assert_eq!(out, "7\n");
}

#[test]
fn test_string_methods() {
    let out = run_script(
        r#"
        var parts = "a,b,c".split(",");
        println(parts.length());
        println(parts[2]);
        println("  pad  ".trim());
        "#,
    );
    assert_eq!(out, "3\nc\npad\n");
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[test]
fn test_runtime_error_recovery() {
    let out = run_script(
        r#"
        var o = { x: 1 };
        println(o.missing);
        println("after");
        "#,
    );
    assert!(
        out.contains("Runtime Error: Property 'missing' does not exist on line 3"),
        "got: {}",
        out
    );
    assert!(out.ends_with("after\n"), "execution should continue: {}", out);
}

#[test]
fn test_undefined_global_reports_error() {
    let out = run_script("nosuchthing(); println(\"next\");");
    assert!(out.contains("does not exist in global scope"), "got: {}", out);
    assert!(out.ends_with("next\n"), "got: {}", out);
}

#[test]
fn test_parse_error_reported_with_line() {
    let errors = parse_errors("var a = ;\n");
    assert!(!errors.is_empty());
    assert_eq!(errors[0].lineno, 1);
}

#[test]
fn test_duplicate_param_is_a_parse_error() {
    let errors = parse_errors("function f(a, a) { return a; }");
    assert!(errors
        .iter()
        .any(|e| e.description.contains("already exists")));
}

#[test]
fn test_oversized_jump_is_a_codegen_error() {
    // A loop body big enough to push the exit jump past the 16-bit range
    let mut src = String::from("var a = 0;\nwhile (a < 1) {\n");
    for _ in 0..9000 {
        src.push_str("a = a + 1234567;\n");
    }
    src.push_str("}\n");
    let errors = parse_errors(&src);
    assert!(errors.iter().any(|e| e.description.contains("jump")));
}

// ─── Library roots ────────────────────────────────────────────────────────────

#[test]
fn test_json_round_trip() {
    let out = run_script(
        r#"
        var v = JSON.parse("{\"a\": 1, \"b\": [true, null, \"x\"]}");
        println(v.a);
        println(JSON.stringify(v));
        "#,
    );
    assert_eq!(out, "1\n{\"a\":1,\"b\":[true,null,\"x\"]}\n");
}

#[test]
fn test_to_int_and_to_float() {
    let out = run_script(
        r#"
        println(toInt(" 42 ") + 1);
        println(toFloat("2.5"));
        "#,
    );
    assert_eq!(out, "43\n2.5\n");
}

#[test]
fn test_arguments_builtin_sees_extras() {
    let out = run_script(
        r#"
        function f(a) {
            var all = arguments();
            return all.length();
        }
        println(f(1, 2, 3));
        "#,
    );
    assert_eq!(out, "3\n");
}

// ─── GC ───────────────────────────────────────────────────────────────────────

#[test]
fn test_gc_keeps_reachable_values() {
    let mut runtime = Runtime::new();
    let program = runtime
        .compile(
            r#"
            var s = "";
            for (var i = 0; i < 40; ++i) {
                s = s + "x";
            }
            println(s.length());
            "#,
        )
        .expect("parse should succeed");
    let out = Rc::new(RefCell::new(String::new()));
    let sink = out.clone();
    runtime.spawn(
        program,
        Some(Rc::new(move |s: &str| sink.borrow_mut().push_str(s))),
        None,
    );
    // A forced collection before the first instruction must not free
    // anything the task can still reach
    runtime.gc(true);
    runtime.run_until_idle();
    assert_eq!(*out.borrow(), "40\n");
}
