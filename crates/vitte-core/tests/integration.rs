//! tests/integration.rs — end-to-end source-to-stdout scenarios.
//!
//! Each positive case feeds a full program to a fresh [`Vm`] and checks
//! byte-exact stdout; each negative case checks that the VM reports a
//! runtime error rather than panicking or silently continuing.

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use vitte_core::{Config, InterpretError, Vm};

/// An in-memory `Write` sink shared with the assertion after `interpret`
/// returns, so the VM's own writer (not a side-channel) is what's checked.
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_writer(Config::default(), Box::new(buf.clone()));
    let result = vm.interpret(source);
    let out = String::from_utf8(buf.0.borrow().clone()).unwrap();
    (result, out)
}

fn assert_stdout(source: &str, expected: &str) {
    let (result, out) = run(source);
    assert!(result.is_ok(), "expected success, got {:?} (stdout so far: {out:?})", result.err());
    assert_eq!(out, expected);
}

fn assert_runtime_error(source: &str) {
    let (result, _out) = run(source);
    match result {
        Err(InterpretError::Runtime(_)) => {}
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn arithmetic_precedence() {
    assert_stdout("print 1 + 2 * 3;", "7\n");
}

#[test]
fn string_concatenation() {
    assert_stdout(r#"var a = "he"; var b = "llo"; print a + b;"#, "hello\n");
}

#[test]
fn closure_over_returning_function_survives_enclosing_return() {
    assert_stdout(
        r#"
        fun make() {
            var x = 0;
            fun inc() { x = x + 1; return x; }
            return inc;
        }
        var f = make();
        print f();
        print f();
        print f();
        "#,
        "1\n2\n3\n",
    );
}

#[test]
fn inheritance_copies_methods_and_dispatches_through_bound_method() {
    assert_stdout(
        r#"
        class A { greet() { return "hi"; } }
        class B < A {}
        print B().greet();
        "#,
        "hi\n",
    );
}

#[test]
fn initializer_sets_fields_and_methods_mutate_them() {
    assert_stdout(
        r#"
        class C {
            init(n) { this.n = n; }
            inc() { this.n = this.n + 1; return this.n; }
        }
        var c = C(3);
        print c.inc();
        print c.inc();
        "#,
        "4\n5\n",
    );
}

#[test]
fn break_and_continue_clean_up_locals_correctly() {
    assert_stdout(
        r#"
        for (var i = 0; i < 3; i = i + 1) {
            if (i == 1) { continue; }
            if (i == 2) { break; }
            print i;
        }
        print "done";
        "#,
        "0\ndone\n",
    );
}

#[test]
fn switch_matched_case_leaves_stack_balanced() {
    // A matched case used to leave the switch subject on the stack; run
    // it in a loop and confirm later statements still see a clean stack.
    assert_stdout(
        r#"
        for (var i = 0; i < 5; i = i + 1) {
            switch (i) {
                case 0: print "zero"; break;
                case 1: print "one"; break;
                default: print "other";
            }
            print "after";
        }
        "#,
        "zero\nafter\none\nafter\nother\nafter\nother\nafter\nother\nafter\n",
    );
}

#[test]
fn adding_number_to_string_is_a_runtime_error() {
    assert_runtime_error(r#"print 1 + "x";"#);
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    assert_runtime_error("var x = 1; x();");
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    assert_runtime_error("fun f(a) {} f(1, 2);");
}

#[test]
fn undefined_variable_read_is_a_runtime_error() {
    assert_runtime_error("print zzz;");
}

#[test]
fn running_a_program_twice_in_fresh_vms_yields_identical_stdout() {
    let source = r#"
        class Counter {
            init() { this.n = 0; }
            next() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter();
        print c.next();
        print c.next();
        print c.next();
    "#;
    let (r1, out1) = run(source);
    let (r2, out2) = run(source);
    assert!(r1.is_ok() && r2.is_ok());
    assert_eq!(out1, out2);
}

#[test]
fn compile_error_does_not_execute_anything() {
    let (result, out) = run("print 1 +;");
    assert!(matches!(result, Err(InterpretError::Compile(_))));
    assert!(out.is_empty());
}

#[test]
fn print_renders_every_value_kind() {
    assert_stdout("print nil;", "nil\n");
    assert_stdout("print true;", "true\n");
    assert_stdout("print false;", "false\n");
    assert_stdout("print 1.5;", "1.5\n");
    assert_stdout(r#"print "raw";"#, "raw\n");
    assert_stdout("fun f() {} print f;", "<fn f>\n");
    assert_stdout("class A {} print A;", "A\n");
    assert_stdout("class A {} print A();", "<A instance>\n");
}
