//! Language-level tests driving source through the full VM.

use core_types::Value;
use interpreter::Vm;

/// Run a source snippet in a fresh VM; assertions inside use assert().
fn run(source: &str) -> Result<Value, String> {
    let mut vm = Vm::new();
    vm.interpret(source).map_err(|e| e.to_string())
}

/// Run a snippet and read back a global.
fn run_and_get(source: &str, global: &str) -> Value {
    let mut vm = Vm::new();
    vm.interpret(source).expect("execution succeeds");
    vm.get_global(global).expect("global defined")
}

#[test]
fn test_arithmetic() {
    assert_eq!(run_and_get("var x = (10 + 20) * 2 - 18;", "x"), Value::Number(42.0));
    assert_eq!(run_and_get("var x = 7 % 3;", "x"), Value::Number(1.0));
    assert_eq!(run_and_get("var x = 2 ** 10;", "x"), Value::Number(1024.0));
    // ** is right-associative.
    assert_eq!(run_and_get("var x = 2 ** 3 ** 2;", "x"), Value::Number(512.0));
}

#[test]
fn test_bitwise_operators() {
    assert_eq!(run_and_get("var x = 6 & 3;", "x"), Value::Number(2.0));
    assert_eq!(run_and_get("var x = 6 | 3;", "x"), Value::Number(7.0));
    assert_eq!(run_and_get("var x = 6 ^ 3;", "x"), Value::Number(5.0));
}

#[test]
fn test_comparison_and_logic() {
    assert!(run("assert(1 < 2); assert(2 <= 2); assert(3 > 2); assert(3 >= 3);").is_ok());
    assert!(run("assert(true and true); assert(false or true);").is_ok());
    assert!(run("assert(!(1 == 2)); assert(1 != 2);").is_ok());
}

#[test]
fn test_short_circuit() {
    let source = r#"
        var called = false;
        def touch() { called = true; return true; }
        var r = false and touch();
        assert(called == false);
        var s = true or touch();
        assert(called == false);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_compound_assignment() {
    let source = r#"
        var x = 10;
        x += 5; assert(x == 15);
        x -= 3; assert(x == 12);
        x *= 2; assert(x == 24);
        x /= 4; assert(x == 6);
        x &= 3; assert(x == 2);
        x |= 4; assert(x == 6);
        x ^= 1; assert(x == 7);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_prefix_increment_decrement() {
    let source = r#"
        var x = 1;
        ++x; assert(x == 2);
        --x; assert(x == 1);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_prefix_increment_on_field() {
    let source = r#"
        class Counter { def init() { this.count = 0; } }
        var c = Counter();
        ++c.count;
        ++c.count;
        assert(c.count == 2);
    "#;
    assert!(run(source).is_ok());
}

// Spec scenario 1: closures capture per-call environments.
#[test]
fn test_closures_capture_distinct_environments() {
    let source = r#"
        def make(x) { def g() { return x; } return g; }
        var a = make(1); var b = make(2);
        assert(a() == 1); assert(b() == 2);
    "#;
    assert!(run(source).is_ok());
}

// Spec scenario 2: trait composition.
#[test]
fn test_trait_composition() {
    let source = r#"
        trait T { def greet() { return "hi"; } }
        class C { use T; }
        assert(C().greet() == "hi");
    "#;
    assert!(run(source).is_ok());
}

// Spec scenario 3: inheritance override with super.
#[test]
fn test_inheritance_override() {
    let source = r#"
        class A { def f() { return 1; } }
        class B < A { def f() { return super.f() + 1; } }
        assert(B().f() == 2);
    "#;
    assert!(run(source).is_ok());
}

// Spec scenario 4: break exits mid-loop.
#[test]
fn test_break_in_for_loop() {
    let source = r#"
        var s = 0;
        for (var i = 0; i < 10; i = i + 1) { if (i == 5) break; s = s + i; }
        assert(s == 10);
    "#;
    assert!(run(source).is_ok());
}

// Spec scenario 5: dict literals versus blocks.
#[test]
fn test_dict_literals_vs_blocks() {
    let source = r#"
        { }
        { var x = 1; }
        assert({"a": 1}["a"] == 1);
    "#;
    assert!(run(source).is_ok());
}

// Spec scenario 6: string escapes and interning.
#[test]
fn test_string_escape_and_interning() {
    let source = r#"
        assert("a\nb".len() == 3);
        assert("abc" == "ab" + "c");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_continue_skips_iteration() {
    let source = r#"
        var s = 0;
        for (var i = 0; i < 5; i = i + 1) { if (i == 2) continue; s = s + i; }
        assert(s == 8);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_while_loop() {
    let source = r#"
        var n = 0;
        while (n < 10) { n = n + 1; }
        assert(n == 10);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_while_without_condition_runs_until_break() {
    let source = r#"
        var n = 0;
        while { n = n + 1; if (n == 3) break; }
        assert(n == 3);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_nested_loops_break_inner_only() {
    let source = r#"
        var total = 0;
        for (var i = 0; i < 3; i = i + 1) {
            for (var j = 0; j < 10; j = j + 1) {
                if (j == 2) break;
                total = total + 1;
            }
        }
        assert(total == 6);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_shared_upvalue_between_closures() {
    let source = r#"
        def pair() {
            var count = 0;
            def inc() { count = count + 1; return count; }
            def get() { return count; }
            var result = [inc, get];
            return result;
        }
        var fns = pair();
        fns[0]();
        fns[0]();
        assert(fns[1]() == 2);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_closure_survives_scope_exit() {
    let source = r#"
        var get;
        {
            var captured = "inside";
            def reader() { return captured; }
            get = reader;
        }
        assert(get() == "inside");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_recursion() {
    let source = r#"
        def fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }
        assert(fib(10) == 55);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_optional_parameters() {
    let source = r#"
        def greet(name, greeting = "hello") { return greeting + " " + name; }
        assert(greet("ada") == "hello ada");
        assert(greet("ada", "hi") == "hi ada");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_optional_parameter_defaults_can_reference_earlier_params() {
    let source = r#"
        def double(x, y = x) { return x + y; }
        assert(double(3) == 6);
        assert(double(3, 4) == 7);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_arity_errors() {
    assert!(run("def f(a) { return a; } f();").is_err());
    assert!(run("def f(a) { return a; } f(1, 2);").is_err());
    assert!(run("def f(a, b = 2) { return a; } f(1, 2, 3);").is_err());
}

#[test]
fn test_class_fields_and_methods() {
    let source = r#"
        class Point {
            def init(x, y) { this.x = x; this.y = y; }
            def sum() { return this.x + this.y; }
        }
        var p = Point(3, 4);
        assert(p.sum() == 7);
        p.x = 10;
        assert(p.sum() == 14);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_init_returns_this_implicitly() {
    let source = r#"
        class A { def init() { this.v = 1; } }
        var a = A();
        assert(type(a) == "instance");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_method_resolution_field_over_method() {
    let source = r#"
        def replacement() { return "field"; }
        class C { def probe() { return "method"; } }
        var c = C();
        c.probe = replacement;
        assert(c.probe() == "field");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_bound_method_keeps_receiver() {
    let source = r#"
        class Greeter {
            def init(name) { this.name = name; }
            def greet() { return this.name; }
        }
        var m = Greeter("ada").greet;
        assert(m() == "ada");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_static_methods() {
    let source = r#"
        class MathUtils { static square(n) { return n * n; } }
        assert(MathUtils.square(5) == 25);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_inherited_methods_resolve_through_chain() {
    let source = r#"
        class A { def a() { return "a"; } }
        class B < A { def b() { return "b"; } }
        class C < B { def c() { return "c"; } }
        var c = C();
        assert(c.a() == "a");
        assert(c.b() == "b");
        assert(c.c() == "c");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_trait_method_overridden_by_class() {
    let source = r#"
        trait T { def who() { return "trait"; } }
        class C { use T; def who() { return "class"; } }
        assert(C().who() == "class");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_multiple_traits() {
    let source = r#"
        trait Walks { def walk() { return "walking"; } }
        trait Swims { def swim() { return "swimming"; } }
        class Duck { use Walks, Swims; }
        var d = Duck();
        assert(d.walk() == "walking");
        assert(d.swim() == "swimming");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_lists() {
    let source = r#"
        var l = [1, 2, 3];
        assert(l[0] == 1);
        assert(l[-1] == 3);
        l[1] = 20;
        assert(l[1] == 20);
        l.push(4);
        assert(l.len() == 4);
        assert(l.pop() == 4);
        assert(l.contains(3));
        var joined = [1] + [2, 3];
        assert(joined.len() == 3);
        assert(joined[2] == 3);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_list_out_of_bounds_errors() {
    assert!(run("var l = [1]; l[5];").is_err());
    assert!(run("var l = [1]; l[-5];").is_err());
}

#[test]
fn test_dicts() {
    let source = r#"
        var d = {"a": 1, 2: "two", true: 3, nil: 4};
        assert(d["a"] == 1);
        assert(d[2] == "two");
        assert(d[true] == 3);
        assert(d[nil] == 4);
        d["b"] = 5;
        assert(d.exists("b"));
        assert(d.get("missing") == nil);
        assert(d.get("missing", 9) == 9);
        d.remove("b");
        assert(!d.exists("b"));
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_dict_missing_key_errors() {
    assert!(run("var d = {}; d[\"nope\"];").is_err());
}

#[test]
fn test_dict_and_exists_agree() {
    let source = r#"
        var d = {"k": nil};
        assert(d.exists("k"));
        assert(d["k"] == nil);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_slicing() {
    let source = r#"
        var l = [1, 2, 3, 4, 5];
        assert(l[1:3].len() == 2);
        assert(l[1:3][0] == 2);
        assert(l[:2].len() == 2);
        assert(l[3:].len() == 2);
        assert("hello"[1:3] == "el");
        assert("hello"[:2] == "he");
        assert("hello"[3:] == "lo");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_string_indexing() {
    let source = r#"
        assert("abc"[0] == "a");
        assert("abc"[-1] == "c");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_string_methods() {
    let source = r#"
        assert("Hello".lower() == "hello");
        assert("Hello".upper() == "HELLO");
        assert("hello".contains("ell"));
        assert("hello".startsWith("he"));
        assert("hello".endsWith("lo"));
        assert("a,b,c".split(",").len() == 3);
        assert("a,b".replace(",", "-") == "a-b");
        assert("hello".find("llo") == 2);
        assert("hello".find("x") == -1);
        assert("  x  ".trim() == "x");
        assert((42).toString() == "42");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_subscript_compound_assignment() {
    let source = r#"
        var l = [1, 2, 3];
        l[0] += 10; assert(l[0] == 11);
        l[0] -= 1; assert(l[0] == 10);
        l[0] *= 2; assert(l[0] == 20);
        var d = {"n": 5};
        d["n"] += 1; assert(d["n"] == 6);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_var_comma_declarations() {
    let source = "var a = 1, b = 2, c; assert(a == 1); assert(b == 2); assert(c == nil);";
    assert!(run(source).is_ok());
}

#[test]
fn test_undefined_variable_errors() {
    assert!(run("missing;").is_err());
    assert!(run("missing = 1;").is_err());
}

#[test]
fn test_global_late_binding() {
    let source = r#"
        def caller() { return later(); }
        def later() { return 7; }
        assert(caller() == 7);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_stack_overflow_reported() {
    assert!(run("def f() { return f(); } f();").is_err());
}

#[test]
fn test_builtin_module_import() {
    let source = r#"
        import "Math";
        assert(Math.sqrt(9) == 3);
        assert(Math.abs(0 - 5) == 5);
        assert(Math.max(1, 9, 4) == 9);
        assert(Math.pi > 3.14 and Math.pi < 3.15);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_json_module_round_trip() {
    let source = r#"
        import "JSON";
        var parsed = JSON.parse("{\"a\": [1, 2], \"b\": true}");
        assert(parsed["a"][0] == 1);
        assert(parsed["b"] == true);
        var text = JSON.stringify([1, 2, 3]);
        assert(text == "[1.0,2.0,3.0]" or text == "[1,2,3]");
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_unavailable_module_surfaces_error_through_hook() {
    let source = r#"
        import "HTTP";
        HTTP.get("http://example.com");
    "#;
    let err = run(source).unwrap_err();
    assert!(err.contains("not available"));
}

#[test]
fn test_type_and_str_and_bool() {
    let source = r#"
        assert(type(1) == "number");
        assert(type("s") == "string");
        assert(type(nil) == "nil");
        assert(type([]) == "list");
        assert(str(42) == "42");
        assert(bool(0) == true);
        assert(bool(nil) == false);
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn test_equality_semantics() {
    let source = r#"
        assert(1 == 1.0);
        assert(nil == nil);
        assert(true != 1);
        assert(nil != false);
        assert("x" != 120);
        var a = [1]; var b = [1];
        assert(a != b);
        assert(a == a);
    "#;
    assert!(run(source).is_ok());
}
