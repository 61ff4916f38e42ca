//! Compile-error types.
//!
//! Errors are collected as values during the single pass and returned in
//! source order; the driver renders them and exits with the compile-error
//! code. Panic mode inside the compiler suppresses cascades, so one
//! statement contributes at most one error.

/// One reported compile error, rendered as
/// `[line 3] Error at 'x': message`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub line: u32,
    /// ` at 'lexeme'`, ` at end`, or empty for scanner errors.
    pub location: String,
    pub message: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.line, self.location, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Every error a single compile produced, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    /// True if any reported error carries this message (test helper and
    /// driver convenience).
    pub fn contains(&self, message: &str) -> bool {
        self.0.iter().any(|e| e.message == message)
    }
}

impl std::fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}
