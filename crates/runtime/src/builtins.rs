//! Native builtins: the `clock` global and the member tables for
//! strings, lists, dicts, and options.
//!
//! Every native follows the same contract: it receives the host, the
//! receiver value (`nil` for plain calls like `clock()`), and the
//! argument values, and returns the single result the VM pushes in place
//! of the callee and arguments.

use raven_core::{Heap, NativeError, NativeFn, NativeHost, Obj, ObjNative, Table, Value};

/// Member tables for the built-in receiver types, keyed by interned
/// member name.
#[derive(Debug)]
pub struct Builtins {
    pub string: Table,
    pub list: Table,
    pub dict: Table,
    pub option: Table,
}

impl Builtins {
    pub fn new(heap: &mut Heap) -> Builtins {
        let mut string = Table::new();
        register(heap, &mut string, "length", 0, string_length);

        let mut list = Table::new();
        register(heap, &mut list, "append", 1, list_append);
        register(heap, &mut list, "length", 0, list_length);

        let mut dict = Table::new();
        register(heap, &mut dict, "length", 0, dict_length);

        let mut option = Table::new();
        register(heap, &mut option, "unwrap", 0, option_unwrap);

        Builtins {
            string,
            list,
            dict,
            option,
        }
    }
}

fn register(heap: &mut Heap, table: &mut Table, name: &str, arity: u8, function: NativeFn) {
    let name_handle = heap.intern(name);
    let hash = heap.string(name_handle).hash;
    let native = heap.allocate(Obj::Native(ObjNative { function, arity }));
    table.set(Value::object(name_handle), hash, Value::object(native));
}

fn expect_arity(args: &[Value], expected: usize) -> Result<(), NativeError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(NativeError::Runtime(format!(
            "Expected {} arguments but got {}.",
            expected,
            args.len()
        )))
    }
}

/// `clock()`: seconds since the VM started running.
pub fn clock(
    host: &mut dyn NativeHost,
    _receiver: Value,
    args: &[Value],
) -> Result<Value, NativeError> {
    expect_arity(args, 0)?;
    Ok(Value::number(host.elapsed().as_secs_f64()))
}

/// `"abc".length`: number of characters.
fn string_length(
    host: &mut dyn NativeHost,
    receiver: Value,
    args: &[Value],
) -> Result<Value, NativeError> {
    expect_arity(args, 0)?;
    let handle = receiver
        .as_object()
        .ok_or_else(|| NativeError::Runtime("Receiver is not a string.".to_string()))?;
    match host.heap().get(handle) {
        Obj::String(s) => Ok(Value::number(s.chars.chars().count() as f64)),
        _ => Err(NativeError::Runtime("Receiver is not a string.".to_string())),
    }
}

/// `xs.append(v)`: push onto the list; evaluates to the appended value.
fn list_append(
    host: &mut dyn NativeHost,
    receiver: Value,
    args: &[Value],
) -> Result<Value, NativeError> {
    expect_arity(args, 1)?;
    let handle = receiver
        .as_object()
        .ok_or_else(|| NativeError::Runtime("Receiver is not a list.".to_string()))?;
    match host.heap_mut().get_mut(handle) {
        Obj::List(items) => {
            items.push(args[0]);
            Ok(args[0])
        }
        _ => Err(NativeError::Runtime("Receiver is not a list.".to_string())),
    }
}

fn list_length(
    host: &mut dyn NativeHost,
    receiver: Value,
    args: &[Value],
) -> Result<Value, NativeError> {
    expect_arity(args, 0)?;
    let handle = receiver
        .as_object()
        .ok_or_else(|| NativeError::Runtime("Receiver is not a list.".to_string()))?;
    match host.heap().get(handle) {
        Obj::List(items) => Ok(Value::number(items.len() as f64)),
        _ => Err(NativeError::Runtime("Receiver is not a list.".to_string())),
    }
}

fn dict_length(
    host: &mut dyn NativeHost,
    receiver: Value,
    args: &[Value],
) -> Result<Value, NativeError> {
    expect_arity(args, 0)?;
    let handle = receiver
        .as_object()
        .ok_or_else(|| NativeError::Runtime("Receiver is not a dict.".to_string()))?;
    match host.heap().get(handle) {
        Obj::Dict(entries) => Ok(Value::number(entries.len() as f64)),
        _ => Err(NativeError::Runtime("Receiver is not a dict.".to_string())),
    }
}

/// `opt.unwrap()`: the carried value; a runtime error on `none`.
fn option_unwrap(
    host: &mut dyn NativeHost,
    receiver: Value,
    args: &[Value],
) -> Result<Value, NativeError> {
    expect_arity(args, 0)?;
    let handle = receiver
        .as_object()
        .ok_or_else(|| NativeError::Runtime("Receiver is not an option.".to_string()))?;
    match host.heap().get(handle) {
        Obj::Option(Some(value)) => Ok(*value),
        Obj::Option(None) => Err(NativeError::Runtime("Can't unwrap 'none'.".to_string())),
        _ => Err(NativeError::Runtime(
            "Receiver is not an option.".to_string(),
        )),
    }
}
