//! Runtime error reporting: messages, stack traces, and the unwound VM.

use raven_runtime::{InterpretError, run_capture};

fn runtime_error(source: &str) -> raven_runtime::RuntimeError {
    let (result, _) = run_capture(source);
    match result {
        Err(InterpretError::Runtime(error)) => error,
        Err(InterpretError::Compile(errors)) => {
            panic!("expected runtime error, got compile errors: {}", errors)
        }
        Ok(()) => panic!("expected runtime error, got success for {:?}", source),
    }
}

#[test]
fn test_mixed_add_operands() {
    let error = runtime_error("print 1 + \"a\";");
    assert_eq!(error.message, "Operands must be two numbers or two strings.");
}

#[test]
fn test_list_index_out_of_bounds() {
    let error = runtime_error("var xs=[1]; print xs[5];");
    assert_eq!(error.message, "List index out of bounds.");
    let error = runtime_error("var xs=[1]; print xs[0-1];");
    assert_eq!(error.message, "List index out of bounds.");
}

#[test]
fn test_list_index_must_be_whole() {
    let error = runtime_error("var xs=[1]; print xs[0.5];");
    assert_eq!(error.message, "List index must be a whole number.");
    let error = runtime_error("var xs=[1]; print xs[\"0\"];");
    assert_eq!(error.message, "List index must be a whole number.");
}

#[test]
fn test_wrong_argument_count_to_class() {
    let error = runtime_error("class A {} A(1);");
    assert_eq!(error.message, "Expected 0 arguments but got 1.");
}

#[test]
fn test_wrong_argument_count_to_function() {
    let error = runtime_error("func f(a) { a } f();");
    assert_eq!(error.message, "Expected 1 arguments but got 0.");
}

#[test]
fn test_undefined_variable() {
    let error = runtime_error("print missing;");
    assert_eq!(error.message, "Undefined variable 'missing'.");
    let error = runtime_error("missing = 1;");
    assert_eq!(error.message, "Undefined variable 'missing'.");
}

#[test]
fn test_undefined_property_and_key() {
    let error = runtime_error("class A {} print A().nope;");
    assert_eq!(error.message, "Undefined property 'nope'.");
    let error = runtime_error("var d = dict {}; print d[\"k\"];");
    assert_eq!(error.message, "Undefined key 'k'.");
}

#[test]
fn test_value_without_properties() {
    let error = runtime_error("print 5.length;");
    assert_eq!(error.message, "Value has no properties.");
    let error = runtime_error("var n = 5; n.f = 1;");
    assert_eq!(error.message, "Only instances have fields.");
}

#[test]
fn test_calling_a_non_callable() {
    let error = runtime_error("var x = 5; x();");
    assert_eq!(error.message, "Can only call functions and classes.");
}

#[test]
fn test_arithmetic_type_errors() {
    let error = runtime_error("print 1 - \"a\";");
    assert_eq!(error.message, "Operands must be numbers.");
    let error = runtime_error("print -\"a\";");
    assert_eq!(error.message, "Operand must be a number.");
}

#[test]
fn test_inheriting_from_a_non_class() {
    let error = runtime_error("var NotAClass = 5; class A < NotAClass {}");
    assert_eq!(error.message, "Superclass must be a class.");
}

#[test]
fn test_non_iterable_for_target() {
    let error = runtime_error("for x in 5 { print x; }");
    assert_eq!(error.message, "Only lists and strings are iterable.");
}

#[test]
fn test_unhashable_dict_key() {
    let error = runtime_error("var d = dict {[1] => 2};");
    assert_eq!(error.message, "Unhashable type.");
}

#[test]
fn test_unwrapping_none() {
    let error = runtime_error("none.unwrap;");
    assert_eq!(error.message, "Can't unwrap 'none'.");
}

#[test]
fn test_frame_overflow_on_runaway_recursion() {
    let error = runtime_error("func f() { f() } f();");
    assert_eq!(error.message, "Stack overflow.");
}

#[test]
fn test_trace_lists_frames_innermost_first() {
    let source = "func boom() { 1 + \"a\"; }\nfunc go() { boom(); }\ngo();";
    let error = runtime_error(source);
    assert_eq!(error.trace.len(), 3);
    assert_eq!(error.trace[0], "[line 1] in boom()");
    assert_eq!(error.trace[1], "[line 2] in go()");
    assert_eq!(error.trace[2], "[line 3] in script");
}

#[test]
fn test_compile_errors_are_reported_not_run() {
    let (result, out) = run_capture("print 1; var;");
    assert_eq!(out, "");
    match result {
        Err(InterpretError::Compile(errors)) => {
            assert!(errors.contains("Expect variable name."));
        }
        other => panic!("expected compile errors, got {:?}", other),
    }
}
