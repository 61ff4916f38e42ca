//! Raven Runtime
//!
//! The execution half of the language: a single-threaded stack VM with
//! call frames, a mark-sweep collected heap, globals, and the native
//! builtin surface. Feed source text to [`Vm::interpret`]; globals
//! persist across calls so a REPL can reuse one VM.
//!
//! # Modules
//!
//! - `vm`: dispatch loop, call and property protocols, GC root marking
//! - `builtins`: `clock` and the string/list/dict/option member tables
//! - `error`: runtime and interpreter error types

pub mod builtins;
pub mod error;
pub mod vm;

pub use builtins::Builtins;
pub use error::{InterpretError, RuntimeError};
pub use vm::Vm;

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Clonable in-memory sink for program output. Hand one clone to
/// [`Vm::with_output`] and read the text back from another.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Rc<RefCell<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> OutputBuffer {
        OutputBuffer::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.borrow()).into_owned()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `source` in a fresh VM, capturing program output.
pub fn run_capture(source: &str) -> (Result<(), InterpretError>, String) {
    let buffer = OutputBuffer::new();
    let mut vm = Vm::with_output(Box::new(buffer.clone()));
    let result = vm.interpret(source);
    (result, buffer.contents())
}
