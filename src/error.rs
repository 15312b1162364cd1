///! Error types for RJoy.
///!
///! One variant per error kind. Errors abort the current top-level phrase;
///! only QuitRequested terminates the process. Parse errors carry the source
///! position of the offending token; runtime errors carry the word that
///! raised them (positions do not travel with values at runtime).

use std::fmt;

use thiserror::Error;

/// A (file, line, column) position in Joy source text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourcePos {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub fn new(file: &str, line: u32, column: u32) -> Self {
        SourcePos {
            file: file.to_string(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Error)]
pub enum JoyError {
    #[error("parse: {msg} (at {pos})")]
    Parse { msg: String, pos: SourcePos },

    #[error("{op}: requires {needed} items, stack has {depth}")]
    StackUnderflow {
        op: &'static str,
        needed: usize,
        depth: usize,
    },

    #[error("{op}: expected {expected}, got {actual}")]
    Type {
        op: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("undefined word: {0}")]
    Undefined(String),

    #[error("{op}: {msg}")]
    Domain { op: &'static str, msg: String },

    #[error("{op}: {msg}")]
    File { op: &'static str, msg: String },

    #[error("abort")]
    Abort,

    #[error("quit({0})")]
    Quit(i64),
}

impl JoyError {
    /// The kind name used in the one-line diagnostic.
    pub fn kind(&self) -> &'static str {
        match self {
            JoyError::Parse { .. } => "ParseError",
            JoyError::StackUnderflow { .. } => "StackUnderflow",
            JoyError::Type { .. } => "TypeError",
            JoyError::Undefined(_) => "UndefinedSymbol",
            JoyError::Domain { .. } => "DomainError",
            JoyError::File { .. } => "FileError",
            JoyError::Abort => "AbortRequested",
            JoyError::Quit(_) => "QuitRequested",
        }
    }

    /// Single-line diagnostic: `error: <kind>: <detail> (at <file>:<line>)`.
    pub fn diagnostic(&self) -> String {
        match self {
            JoyError::Parse { msg, pos } => {
                format!("error: {}: {} (at {})", self.kind(), msg, pos)
            }
            JoyError::Abort => format!("error: {}", self.kind()),
            other => format!("error: {}: {}", other.kind(), other),
        }
    }
}

pub type Result<T> = std::result::Result<T, JoyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_are_single_lines() {
        let e = JoyError::Parse {
            msg: "unterminated string".into(),
            pos: SourcePos::new("demo.joy", 3, 7),
        };
        assert_eq!(
            e.diagnostic(),
            "error: ParseError: unterminated string (at demo.joy:3)"
        );
        assert!(!e.diagnostic().contains('\n'));

        let e = JoyError::StackUnderflow {
            op: "swap",
            needed: 2,
            depth: 1,
        };
        assert_eq!(
            e.diagnostic(),
            "error: StackUnderflow: swap: requires 2 items, stack has 1"
        );
    }
}
