//! diagnostic.rs — error types surfaced across the compile/run boundary.
//!
//! The compiler never stops at the first syntax error: it accumulates a
//! `Vec<CompileError>` via panic-mode recovery (see `compiler.rs`) and
//! the driver reports all of them at once. The VM, by contrast, halts on
//! the first runtime error and reports a single [`RuntimeError`] with a
//! clox-style call-stack trace.

use thiserror::Error;

/// Where in the source a compile error was anchored. A scanner-level
/// `ERROR` token carries no lexeme worth quoting, so it reports neither
/// `at '...'` nor `at end` — just the bare message, matching clox's
/// `errorAt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    AtLexeme(String),
    AtEnd,
    None,
}

impl std::fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorLocation::AtLexeme(lexeme) => write!(f, " at '{lexeme}'"),
            ErrorLocation::AtEnd => write!(f, " at end"),
            ErrorLocation::None => Ok(()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[line {line}] Error{location}: {message}")]
pub struct CompileError {
    pub line: u32,
    pub location: ErrorLocation,
    pub message: String,
}

/// One entry of a runtime error's call-stack trace, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    /// `None` for the top-level script frame.
    pub name: Option<String>,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        Self { message: message.into(), trace }
    }

    /// Renders the message followed by the trace, one frame per line,
    /// matching clox's `runtimeError`'s stderr output.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for frame in &self.trace {
            out.push('\n');
            out.push_str(&frame.to_string());
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("{} compile error(s)", .0.len())]
    Compile(Vec<CompileError>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type InterpretResult<T> = Result<T, InterpretError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_display() {
        let err = CompileError {
            line: 3,
            location: ErrorLocation::AtLexeme("+".into()),
            message: "Expect expression.".into(),
        };
        assert_eq!(err.to_string(), "[line 3] Error at '+': Expect expression.");
    }

    #[test]
    fn runtime_error_render_includes_trace() {
        let err = RuntimeError::new(
            "Undefined variable 'x'.",
            vec![
                TraceFrame { line: 5, name: Some("foo".into()) },
                TraceFrame { line: 10, name: None },
            ],
        );
        let rendered = err.render();
        assert!(rendered.contains("Undefined variable 'x'."));
        assert!(rendered.contains("in foo()"));
        assert!(rendered.contains("in script"));
    }
}
