use std::sync::Arc;

use smol_str::SmolStr;
use thiserror::Error;

use crate::error::Error as TemplateError;

type Line = u32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Unexpected token '{token}'")]
    UnexpectedToken { token: String, line: Line },
    #[error("Unexpected end of input")]
    UnexpectedEof { line: Line },
    #[error("Invalid or unexpected token '{found}'")]
    InvalidCharacter { found: char, line: Line },
    #[error("Unterminated string literal")]
    UnterminatedString { line: Line },
    #[error("Invalid number literal \"{literal}\"")]
    InvalidNumber { literal: String, line: Line },
    #[error("Invalid left-hand side in assignment")]
    InvalidAssignmentTarget { line: Line },
    #[error("Illegal {keyword} statement")]
    IllegalStatement { keyword: SmolStr, line: Line },
    #[error("Maximum nesting depth exceeded")]
    NestingTooDeep { line: Line },
    #[error("Unsupported '{keyword}' statement")]
    UnsupportedStatement { keyword: SmolStr, line: Line },
}

impl ParseError {
    pub fn line(&self) -> Line {
        match self {
            ParseError::UnexpectedToken { line, .. }
            | ParseError::UnexpectedEof { line }
            | ParseError::InvalidCharacter { line, .. }
            | ParseError::UnterminatedString { line }
            | ParseError::InvalidNumber { line, .. }
            | ParseError::InvalidAssignmentTarget { line }
            | ParseError::IllegalStatement { line, .. }
            | ParseError::UnsupportedStatement { line, .. }
            | ParseError::NestingTooDeep { line } => *line,
        }
    }
}

/// Failures raised while a compiled template runs.
///
/// Messages follow the conventions of the embedded language so that a
/// template author sees e.g. `user is not defined` rather than an
/// interpreter-internal description.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("{0} is not defined")]
    Reference(SmolStr),
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Range(String),
    #[error("{message}")]
    Thrown { name: SmolStr, message: String },
    #[error("{0}")]
    Runtime(String),
    /// A nested template (include or file binding) failed.
    #[error("{0}")]
    Template(Arc<TemplateError>),
}

impl EvalError {
    pub fn type_error(message: impl Into<String>) -> Self {
        EvalError::Type(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        EvalError::Runtime(message.into())
    }

    /// The error constructor name as seen by embedded code.
    pub fn name(&self) -> &str {
        match self {
            EvalError::Reference(_) => "ReferenceError",
            EvalError::Type(_) => "TypeError",
            EvalError::Range(_) => "RangeError",
            EvalError::Thrown { name, .. } => name,
            EvalError::Runtime(_) | EvalError::Template(_) => "Error",
        }
    }
}

impl From<TemplateError> for EvalError {
    fn from(error: TemplateError) -> Self {
        EvalError::Template(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(EvalError::Reference("user".into()), "ReferenceError", "user is not defined")]
    #[case(EvalError::type_error("x is not a function"), "TypeError", "x is not a function")]
    #[case(
        EvalError::Thrown { name: "Error".into(), message: "boom".to_string() },
        "Error",
        "boom"
    )]
    fn test_eval_error(#[case] error: EvalError, #[case] name: &str, #[case] message: &str) {
        assert_eq!(error.name(), name);
        assert_eq!(error.to_string(), message);
    }

    #[test]
    fn test_parse_error_line() {
        let error = ParseError::UnexpectedToken {
            token: ")".to_string(),
            line: 4,
        };
        assert_eq!(error.line(), 4);
        assert_eq!(error.to_string(), "Unexpected token ')'");
    }
}
