// Integration tests driving the compiler and VM together, the way a
// loxi script actually runs. Output-producing tests capture `print` via
// an injectable sink rather than scraping stdout.

use loxi::compiler;
use loxi::value::Value;
use loxi::vm::Vm;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

#[derive(Clone, Default)]
struct Collector(Rc<RefCell<Vec<u8>>>);

impl io::Write for Collector {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Collector {
    fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("print only ever writes UTF-8 text")
    }
}

fn run(source: &str) -> (Vm, String) {
    let sink = Collector::default();
    let mut vm = Vm::with_output(sink.clone());
    let function = compiler::compile(source, vm.heap_mut()).expect("source should compile");
    vm.interpret(function).expect("source should run without a runtime error");
    (vm, sink.text())
}

fn run_expect_err(source: &str) -> String {
    let mut vm = Vm::new();
    let function = compiler::compile(source, vm.heap_mut()).expect("source should compile");
    let err = vm.interpret(function).expect_err("expected a runtime error");
    err.message
}

fn expect_compile_error(source: &str) -> Vec<String> {
    let mut vm = Vm::new();
    let errors = compiler::compile(source, vm.heap_mut()).expect_err("expected a compile error");
    errors.into_iter().map(|e| e.message).collect()
}

#[test]
fn arithmetic_and_comparison() {
    let (_, out) = run(r#"print 1 + 2 * 3; print (1 + 2) == 3; print 4 < 5;"#);
    assert_eq!(out, "7\ntrue\ntrue\n");
}

#[test]
fn string_concatenation() {
    let (_, out) = run(r#"print "foo" + "bar";"#);
    assert_eq!(out, "foobar\n");
}

#[test]
fn adding_string_and_number_is_a_runtime_error() {
    let message = run_expect_err(r#"print 1 + "a";"#);
    assert_eq!(message, "Operands must be two numbers or two strings.");
}

#[test]
fn string_interning_gives_reference_equal_literals() {
    let (vm, _) = run(r#"var a = "hi"; var b = "hi"; var same = a == b;"#);
    assert_eq!(vm.global("same"), Some(Value::Bool(true)));
}

#[test]
fn duplicate_local_in_same_scope_is_a_compile_error() {
    let errors = expect_compile_error("{ var a = 1; var a = 2; }");
    assert!(errors.iter().any(|m| m.contains("Already a variable")));
}

#[test]
fn shadowing_in_a_nested_scope_is_allowed() {
    let (_, out) = run("var a = 1; { var a = 2; print a; } print a;");
    assert_eq!(out, "2\n1\n");
}

#[test]
fn closures_share_a_captured_local_counter() {
    let source = r#"
        fun make() {
            var count = 0;
            fun inc() {
                count = count + 1;
                return count;
            }
            return inc;
        }
        var counter = make();
        print counter();
        print counter();
        print counter();
    "#;
    let (_, out) = run(source);
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn two_closures_over_the_same_local_share_the_upvalue() {
    let source = r#"
        fun pair() {
            var shared = 0;
            fun set(v) { shared = v; }
            fun get() { return shared; }
            set(42);
            return get();
        }
        print pair();
    "#;
    let (_, out) = run(source);
    assert_eq!(out, "42\n");
}

#[test]
fn control_flow_output_shapes() {
    let (_, out) = run(r#"
        for (var i = 0; i < 3; i = i + 1) { print i; }
        var j = 0;
        while (j < 2) { print j; j = j + 1; }
        if (true) { print "yes"; } else { print "no"; }
    "#);
    assert_eq!(out, "0\n1\n2\n0\n1\nyes\n");
}

#[test]
fn classes_support_init_and_field_access() {
    let source = r#"
        class Counter {
            init(start) {
                this.value = start;
            }
            bump() {
                this.value = this.value + 1;
                return this.value;
            }
        }
        var c = Counter(10);
        print c.bump();
        print c.value;
    "#;
    let (_, out) = run(source);
    assert_eq!(out, "11\n11\n");
}

#[test]
fn accessing_an_undefined_field_is_a_runtime_error() {
    let message = run_expect_err(
        r#"
        class Empty {}
        var e = Empty();
        print e.missing;
        "#,
    );
    assert_eq!(message, "Undefined property 'missing'.");
}

#[test]
fn arity_mismatch_names_expected_and_actual() {
    let message = run_expect_err("fun one(a) { return a; } one(1, 2);");
    assert_eq!(message, "Expected 1 arguments but got 2.");
}

#[test]
fn assigning_to_an_undefined_global_is_a_runtime_error() {
    let message = run_expect_err("nope = 1;");
    assert_eq!(message, "Undefined variable 'nope'.");
}

#[cfg(feature = "stress-gc")]
#[test]
fn closures_and_classes_survive_gc_stress() {
    let source = r#"
        fun make() {
            var count = 0;
            fun inc() { count = count + 1; return count; }
            return inc;
        }
        var counter = make();
        class Pair { init(a, b) { this.a = a; this.b = b; } }
        var total = 0;
        for (var i = 0; i < 50; i = i + 1) {
            var p = Pair("x" + "y", i);
            total = counter();
        }
        print total;
    "#;
    let (_, out) = run(source);
    assert_eq!(out, "50\n");
}
