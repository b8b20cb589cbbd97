//! cellsh - a Lisp-derived shell language on an explicit-stack register machine
//!
//! Programs are s-expressions built from a small set of interned atoms and
//! mutable pairs. They are evaluated by a register machine whose control stack
//! holds every pending phase of evaluation, so no host recursion is used for
//! user code:
//!
//! ```text
//! (define greet as (who) (echo hello who))
//! (greet world)
//! (if (lt 1 2) "yes" else "no")
//! ```
//!
//! Each top-level unit of work runs inside a [`task::Task`] that can be
//! suspended, resumed and stopped the way a Unix job can. Tasks spawned from a
//! script form a tree, and job-control requests reach the whole subtree.
//!
//! ## Modules
//!
//! - `cell`: the universal value type, interning pools and list helpers
//! - `number`: the rational numeric tower
//! - `scope`: chained private/public environments and references
//! - `closure`: closures, bindings and native appliers
//! - `evaluator`: registers, save masks, pseudo-states and the dispatch loop
//! - `continuation`: first-class snapshots of the operand and control stacks
//! - `task`: job control, suspension gate and worker queues
//! - `builtinops`: the native catalogue installed into every interpreter
//! - `conduit`, `process`: the I/O and OS collaborators
//! - `expand`, `handle`: argument expansion and printable handles
//! - `interpreter`: root scopes and the evaluation entry points
//! - `reader`: s-expression reader (feature `reader`)

use std::fmt;

/// Maximum nesting accepted by the reader before it reports an error.
pub const MAX_PARSE_DEPTH: usize = 256;

/// Capacity of a worker task's input queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Capacity of a `(channel)` created without an explicit size.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (EOF, unterminated string, unclosed parens)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// A `%tag token%` handle that does not name a live value
    StaleHandle,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// 1-based line where the failing form starts
    pub line: usize,
    /// Context snippet from the input showing where the error occurred (max 60 chars)
    pub context: Option<String>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>, line: usize) -> Self {
        ParseError {
            kind,
            message: message.into(),
            line,
            context: None,
        }
    }

    /// Attach a snippet of `input` starting at `offset`.
    pub fn with_context(mut self, input: &str, offset: usize) -> Self {
        const MAX_CONTEXT: usize = 60;

        let snippet: String = input
            .get(offset..)
            .unwrap_or_default()
            .chars()
            .take(MAX_CONTEXT)
            .collect();
        let snippet = snippet.replace('\n', "\\n").replace('\r', "");
        if !snippet.is_empty() {
            self.context = Some(snippet);
        }
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, " near '{context}'")?;
        }
        Ok(())
    }
}

/// Error types for the interpreter.
///
/// The taxonomy seen by user `throw` handlers is coarser; see [`Error::kind`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(ParseError),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("undefined: {0}")]
    Undefined(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: String, got: usize },
    #[error("{0}")]
    Runtime(String),
    #[error("division by zero")]
    DivideByZero,
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("{0}")]
    Io(String),
    #[error("{kind}: {message}")]
    Thrown { kind: String, message: String },
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("exit {0}")]
    Exit(u8),
    #[error("terminated")]
    Terminated,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn syntax(message: impl Into<String>) -> Self {
        Error::Syntax(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Error::Type(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    pub fn arity(expected: impl Into<String>, got: usize) -> Self {
        Error::Arity {
            expected: expected.into(),
            got,
        }
    }

    /// The kind handed to a user-level `throw` handler.
    pub fn kind(&self) -> &str {
        match self {
            Error::Parse(_) | Error::Syntax(_) => "syntax",
            Error::Fatal(_) => "fatal",
            Error::Thrown { kind, .. } => kind,
            _ => "runtime",
        }
    }

    /// Whether the error may be routed to a user `throw` handler instead of
    /// aborting the current run.
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self,
            Error::Fatal(_) | Error::Exit(_) | Error::Terminated | Error::Internal(_)
        )
    }

    /// Completion status reported for a run that ended with this error.
    pub fn status(&self) -> u8 {
        match self {
            Error::Exit(status) => *status,
            Error::CommandNotFound(_) => 127,
            Error::Terminated => 143,
            _ => 1,
        }
    }
}

impl From<ParseError> for Error {
    fn from(error: ParseError) -> Self {
        Error::Parse(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error.to_string())
    }
}

pub mod builtinops;
pub mod cell;
pub mod closure;
pub mod conduit;
pub mod continuation;
pub mod evaluator;
pub mod expand;
pub mod handle;
pub mod interpreter;
pub mod number;
pub mod process;
pub mod scope;
pub mod stack;
pub mod task;

#[cfg(feature = "reader")]
pub mod reader;

pub use cell::Cell;
pub use interpreter::{Config, Interpreter};
