//! Full pipeline integration tests
//!
//! Source -> Scanner -> Compiler -> Chunk -> VM -> Result, end to end.

use core_types::Value;
use integration_tests::{execute, execute_and_get};

#[test]
fn test_number_literal() {
    assert_eq!(
        execute_and_get("var r = 42;", "r"),
        Some(Value::Number(42.0))
    );
}

#[test]
fn test_arithmetic_pipeline() {
    assert_eq!(
        execute_and_get("var r = (10 + 20) * 2 - 18;", "r"),
        Some(Value::Number(42.0))
    );
}

#[test]
fn test_string_concatenation() {
    let source = r#"var r = "con" + "cat"; assert(r == "concat");"#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_variable_shadowing_in_blocks() {
    let source = r#"
        var x = "outer";
        {
            var x = "inner";
            assert(x == "inner");
        }
        assert(x == "outer");
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_if_else_branches() {
    let source = r#"
        var r;
        if (1 > 2) { r = "then"; } else { r = "else"; }
        assert(r == "else");
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_full_class_hierarchy() {
    let source = r#"
        trait Describes {
            def describe() { return this.kind(); }
        }

        class Animal {
            def init(name) { this.name = name; }
            def kind() { return "animal"; }
        }

        class Dog < Animal {
            use Describes;
            def kind() { return "dog: " + this.name; }
        }

        var d = Dog("rex");
        assert(d.describe() == "dog: rex");
        assert(d.kind() == "dog: rex");
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_super_through_two_levels() {
    let source = r#"
        class A { def f() { return 1; } }
        class B < A { def f() { return super.f() * 10; } }
        class C < B { def f() { return super.f() + 5; } }
        assert(C().f() == 15);
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_counter_closure_program() {
    let source = r#"
        def makeCounter() {
            var count = 0;
            def counter() {
                count = count + 1;
                return count;
            }
            return counter;
        }

        var a = makeCounter();
        var b = makeCounter();
        a(); a(); a();
        b();
        assert(a() == 4);
        assert(b() == 2);
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_loop_accumulation() {
    let source = r#"
        var total = 0;
        for (var i = 1; i <= 100; i = i + 1) { total += i; }
        assert(total == 5050);
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_list_of_closures_captures_loop_variable_per_iteration() {
    let source = r#"
        var fns = [];
        for (var i = 0; i < 3; i = i + 1) {
            var captured = i;
            def reader() { return captured; }
            fns.push(reader);
        }
        assert(fns[0]() == 0);
        assert(fns[1]() == 1);
        assert(fns[2]() == 2);
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_dict_heavy_program() {
    let source = r#"
        var scores = {};
        var names = ["ada", "alan", "grace"];
        for (var i = 0; i < 3; i = i + 1) {
            scores[names[i]] = i * 10;
        }
        assert(scores.len() == 3);
        assert(scores["grace"] == 20);
        assert(scores.keys().len() == 3);
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_fizzbuzz_style_program() {
    let source = r#"
        var out = [];
        for (var i = 1; i <= 15; i = i + 1) {
            if (i % 15 == 0) { out.push("fizzbuzz"); }
            else if (i % 3 == 0) { out.push("fizz"); }
            else if (i % 5 == 0) { out.push("buzz"); }
            else { out.push(i); }
        }
        assert(out[2] == "fizz");
        assert(out[4] == "buzz");
        assert(out[14] == "fizzbuzz");
        assert(out[0] == 1);
    "#;
    assert!(execute(source).is_ok());
}

#[test]
fn test_compile_errors_do_not_execute() {
    // The bad declaration below the good one must prevent execution
    // entirely.
    let err = execute("var ok = 1; var = 2;").unwrap_err();
    assert!(err.contains("Error"));
}

#[test]
fn test_error_reporting_includes_line() {
    let err = execute("var x = 1;\nvar = 2;").unwrap_err();
    assert!(err.contains("[line 2]"));
}
