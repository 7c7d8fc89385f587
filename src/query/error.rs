use crate::query::backtrace::FrameId;
use std::fmt;

/// Fault raised while evaluating a compiled term or pulling a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// A fault attributable to a term; `frame` locates it in the
    /// registry built at compile time.
    Query {
        message: String,
        frame: Option<FrameId>,
    },
    Generic(String),
    Interrupted,
}

impl EvalError {
    pub fn query(message: impl Into<String>, frame: Option<FrameId>) -> Self {
        EvalError::Query {
            message: message.into(),
            frame,
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        EvalError::Generic(message.into())
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Query { message, .. } => write!(f, "{message}"),
            EvalError::Generic(message) => write!(f, "{message}"),
            EvalError::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<crate::interrupt::Interrupted> for EvalError {
    fn from(_: crate::interrupt::Interrupted) -> Self {
        EvalError::Interrupted
    }
}

/// Fault raised while preprocessing or compiling a raw term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    Query {
        message: String,
        frame: Option<FrameId>,
    },
    /// Malformed datum inside the term; there is no term frame to blame.
    Datum(String),
}

impl CompileError {
    pub fn query(message: impl Into<String>, frame: Option<FrameId>) -> Self {
        CompileError::Query {
            message: message.into(),
            frame,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Query { message, .. } => write!(f, "{message}"),
            CompileError::Datum(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for CompileError {}
