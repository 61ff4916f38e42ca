//! Closure and upvalue semantics end to end.

use raven_runtime::run_capture;

fn output(source: &str) -> String {
    let (result, out) = run_capture(source);
    if let Err(error) = result {
        panic!("unexpected failure for {:?}: {}", source, error);
    }
    out
}

#[test]
fn test_closure_observes_mutation_while_local_is_live() {
    let source = "func outer() { var a = 1; func get() { a } a = 2; print get(); } outer();";
    assert_eq!(output(source), "2\n");
}

#[test]
fn test_closure_keeps_snapshot_after_scope_closes() {
    let source = "func outer() { var a = 10; func get() { a } get } \
                  var g = outer(); print g();";
    assert_eq!(output(source), "10\n");
}

#[test]
fn test_sibling_closures_share_one_upvalue() {
    let source = "func make() { var v = 0; func set() { v = 5; } func get() { v } [set, get] } \
                  var pair = make(); pair[0](); print pair[1]();";
    assert_eq!(output(source), "5\n");
}

#[test]
fn test_transitive_capture_through_intermediate_function() {
    let source = "func outer() { var x = \"deep\"; \
                  func middle() { func inner() { x } inner } middle } \
                  print outer()()();";
    assert_eq!(output(source), "deep\n");
}

#[test]
fn test_each_call_gets_fresh_upvalues() {
    let source = "func counter() { var n = 0; func tick() { n = n + 1; n } tick } \
                  var a = counter(); var b = counter(); \
                  print a(); print a(); print b();";
    assert_eq!(output(source), "1\n2\n1\n");
}

#[test]
fn test_assignment_through_upvalue_writes_the_shared_cell() {
    let source = "func outer() { var a = 1; func bump() { a = a + 10; } bump(); bump(); print a; } outer();";
    assert_eq!(output(source), "21\n");
}

#[test]
fn test_methods_close_over_enclosing_function_locals() {
    let source = "func build(tag) { class Tagged { show() { print tag; } } Tagged } \
                  var c = build(\"seen\"); c().show();";
    assert_eq!(output(source), "seen\n");
}
