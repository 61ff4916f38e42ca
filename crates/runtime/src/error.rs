//! Runtime and interpreter error types.

use raven_compiler::CompileErrors;

/// A runtime failure with the call-stack trace captured at the point of
/// the error, innermost frame first.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    /// `[line N] in name()` lines, innermost first.
    pub trace: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.trace {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Terminal status of one `interpret` call. The driver maps `Compile` to
/// exit code 65 and `Runtime` to 70.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpretError {
    Compile(CompileErrors),
    Runtime(RuntimeError),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile(errors) => write!(f, "{}", errors),
            InterpretError::Runtime(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for InterpretError {}

impl From<CompileErrors> for InterpretError {
    fn from(errors: CompileErrors) -> InterpretError {
        InterpretError::Compile(errors)
    }
}

impl From<RuntimeError> for InterpretError {
    fn from(error: RuntimeError) -> InterpretError {
        InterpretError::Runtime(error)
    }
}
