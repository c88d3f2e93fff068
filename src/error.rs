//! Error types and position tracking for VCL processing
//!
//! Lexing never fails (malformed input degrades to a token stream the parser
//! rejects), so the error surface is parse diagnostics, evaluation errors and
//! the fatal driver errors.

use std::fmt;
use thiserror::Error;

/// Represents a position in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Position {
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub column: usize,
    /// Byte offset from start of input (0-based)
    pub offset: usize,
}

impl Position {
    /// Creates a new position at the start of input
    pub fn new() -> Self {
        Self {
            line: 1,
            column: 1,
            offset: 0,
        }
    }

    /// Advances the position by one character
    pub fn advance(&mut self, c: char) {
        match c {
            '\n' => {
                self.line += 1;
                self.column = 1;
            }
            _ => {
                self.column += 1;
            }
        }
        self.offset += c.len_utf8();
    }

    /// Advances the position by multiple characters
    pub fn advance_by(&mut self, text: &str) {
        for c in text.chars() {
            self.advance(c);
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A non-fatal parse diagnostic collected on the [`Program`](crate::ast::Program)
///
/// The parser resynchronizes after recording one of these, so a program with
/// diagnostics is still usable for the declarations that parsed cleanly.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Diagnostic {
    /// Human-readable description of what went wrong
    pub message: String,
    /// Where in the source the problem was detected
    pub position: Position,
}

impl Diagnostic {
    /// Creates a new diagnostic
    pub fn new(message: impl Into<String>, position: Position) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.position, self.message)
    }
}

/// Parsing error
///
/// Only raised internally; the public parser records these as [`Diagnostic`]s
/// and resynchronizes at the next `;` or `}`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    /// Encountered a token that doesn't fit the grammar
    #[error("unexpected token '{token}' at {position}, expected {expected}")]
    UnexpectedToken {
        /// The offending token's lexeme
        token: String,
        /// Where it was found
        position: Position,
        /// What the parser was looking for
        expected: String,
    },

    /// Input ended in the middle of a construct
    #[error("unexpected end of input at {position}, expected {expected}")]
    UnexpectedEof {
        /// Position of the end of input
        position: Position,
        /// What the parser was looking for
        expected: String,
    },

    /// A declaration header was malformed beyond recovery
    #[error("invalid {declaration} declaration at {position}: {message}")]
    InvalidDeclaration {
        /// Declaration kind (`sub`, `acl`, `table`, ...)
        declaration: String,
        /// Where it starts
        position: Position,
        /// What was wrong with it
        message: String,
    },
}

impl ParseError {
    /// Converts the error into a collectable diagnostic
    pub fn into_diagnostic(self) -> Diagnostic {
        let position = match &self {
            ParseError::UnexpectedToken { position, .. }
            | ParseError::UnexpectedEof { position, .. }
            | ParseError::InvalidDeclaration { position, .. } => *position,
        };
        Diagnostic::new(self.to_string(), position)
    }
}

/// Evaluation error raised while executing a subroutine
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    /// A built-in function name had no entry in the registry
    #[error("unknown function '{name}'")]
    UnknownFunction {
        /// The fully-qualified dotted name that failed to resolve
        name: String,
    },

    /// A built-in was called with the wrong number of arguments
    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    BadArity {
        /// Function name
        name: String,
        /// Expected argument count description
        expected: String,
        /// Actual argument count
        got: usize,
    },

    /// An arithmetically impossible operation
    #[error("division by zero")]
    DivisionByZero,

    /// An operation was applied to operands it cannot handle
    #[error("invalid operands for '{op}'")]
    InvalidOperands {
        /// The operator
        op: String,
    },

    /// A regex pattern failed to compile
    #[error("invalid regex pattern: {message}")]
    BadRegex {
        /// Compiler message
        message: String,
    },

    /// A `goto` named a label that doesn't exist in the subroutine
    #[error("undefined label '{label}'")]
    UndefinedLabel {
        /// The missing label
        label: String,
    },
}

/// Fatal errors surfaced to the host by the driver
#[derive(Debug, Error)]
pub enum VclError {
    /// Evaluation failed and no `vcl_error` recovery applied
    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),

    /// The named subroutine is not defined in the loaded program
    #[error("undefined subroutine '{name}'")]
    UndefinedSubroutine {
        /// The requested name
        name: String,
    },

    /// `restart` was issued more times than the context allows
    #[error("maximum restarts ({max}) exceeded")]
    TooManyRestarts {
        /// The configured ceiling
        max: u32,
    },

    /// A goto cycle ran past the statement-step ceiling
    #[error("statement step limit exceeded in subroutine '{name}'")]
    StepLimitExceeded {
        /// The offending subroutine
        name: String,
    },
}
