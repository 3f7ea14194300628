use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use itertools::Itertools;
use miette::{Diagnostic, LabeledSpan, SourceCode, SourceSpan};
use smol_str::SmolStr;

use crate::{
    assembler::instruction::InstructionSequence,
    include::error::IncludeError,
    lexer::error::LexerError,
    options::Options,
    script::error::{EvalError, ParseError},
};

const CONTEXT_LINES: usize = 3;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum SyntaxError {
    #[error("{0} is not a valid identifier: \"{1}\"")]
    InvalidIdentifier(SmolStr, SmolStr),
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error("{source} in {filename} while compiling template")]
    Program { source: ParseError, filename: String },
}

impl SyntaxError {
    /// The template line the error points at, when known.
    pub fn line(&self) -> Option<u32> {
        match self {
            SyntaxError::InvalidIdentifier(_, _) => None,
            SyntaxError::Lexer(e) => Some(e.line()),
            SyntaxError::Program { source, .. } => Some(source.line()),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("cache option requires a filename")]
    CacheWithoutFilename,
    #[error("no filename or template provided")]
    MissingTemplate,
    #[error("template is compiled in async mode and must be rendered with render_async")]
    AsyncTemplate,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum InnerError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Include(#[from] IncludeError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Coarse classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Configuration,
    NotFound,
    Runtime,
}

/// A compile or render failure together with the template source it refers to.
///
/// Render failures carry an annotation when `compile_debug` is enabled:
/// a `<file>:<line>` header followed by a window of the surrounding template
/// lines. `Display` prints the annotation before the underlying message.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    /// The underlying cause of the error.
    pub cause: InnerError,
    /// Escaped filename of the failing template, set by annotation.
    pub path: Option<String>,
    /// The `<file>:<line>` header and context window.
    pub annotation: Option<String>,
    /// The template text related to the error.
    pub source_code: String,
    /// The location in the source code for diagnostics.
    pub location: SourceSpan,
}

impl Error {
    pub fn new(cause: impl Into<InnerError>) -> Self {
        Self {
            cause: cause.into(),
            path: None,
            annotation: None,
            source_code: String::new(),
            location: SourceSpan::from(0..0),
        }
    }

    /// A failure located at `line` (1-based) of `source_code`.
    pub fn at_line(cause: impl Into<InnerError>, source_code: &str, line: u32) -> Self {
        Self {
            cause: cause.into(),
            path: None,
            annotation: None,
            source_code: source_code.to_string(),
            location: line_span(source_code, line),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.cause {
            InnerError::Syntax(_) => ErrorKind::Syntax,
            InnerError::Config(_) => ErrorKind::Configuration,
            InnerError::Include(_) => ErrorKind::NotFound,
            InnerError::Eval(EvalError::Template(inner)) => inner.kind(),
            InnerError::Eval(_) => ErrorKind::Runtime,
        }
    }

    /// The message without the annotation header.
    pub fn original_message(&self) -> String {
        self.cause.to_string()
    }

    fn code_name(&self) -> String {
        match &self.cause {
            InnerError::Syntax(SyntaxError::InvalidIdentifier(_, _)) => {
                "SyntaxError::InvalidIdentifier".to_string()
            }
            InnerError::Syntax(SyntaxError::Lexer(LexerError::UnmatchedTag { .. })) => {
                "SyntaxError::UnmatchedTag".to_string()
            }
            InnerError::Syntax(SyntaxError::Program { .. }) => "SyntaxError::Program".to_string(),
            InnerError::Config(ConfigError::CacheWithoutFilename) => {
                "ConfigError::CacheWithoutFilename".to_string()
            }
            InnerError::Config(ConfigError::MissingTemplate) => {
                "ConfigError::MissingTemplate".to_string()
            }
            InnerError::Config(ConfigError::AsyncTemplate) => {
                "ConfigError::AsyncTemplate".to_string()
            }
            InnerError::Include(IncludeError::NotFound(_)) => "IncludeError::NotFound".to_string(),
            InnerError::Include(IncludeError::Io { .. }) => "IncludeError::Io".to_string(),
            InnerError::Eval(EvalError::Template(inner)) => inner.code_name(),
            InnerError::Eval(err) => format!("RuntimeError::{}", err.name()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.annotation {
            Some(annotation) => write!(f, "{annotation}\n\n{}", self.cause),
            None => write!(f, "{}", self.cause),
        }
    }
}

impl std::error::Error for Error {}

impl Diagnostic for Error {
    fn code<'a>(&'a self) -> Option<Box<dyn Display + 'a>> {
        Some(Box::new(self.code_name()))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn Display + 'a>> {
        let msg = match &self.cause {
            InnerError::Syntax(SyntaxError::Lexer(_)) => {
                Some("Every opening tag needs a closing tag such as %>, -%> or _%>.")
            }
            InnerError::Syntax(SyntaxError::InvalidIdentifier(_, _)) => {
                Some("Identifiers must match [A-Za-z_$][0-9A-Za-z_$]*.")
            }
            InnerError::Config(ConfigError::CacheWithoutFilename) => {
                Some("Set a filename when enabling the cache.")
            }
            InnerError::Include(IncludeError::NotFound(_)) => {
                Some("Check the include path, the filename option and the views directories.")
            }
            InnerError::Eval(EvalError::Reference(_)) => {
                Some("Pass the value in the data context or declare it before use.")
            }
            _ => None,
        };

        msg.map(|m| Box::new(m) as Box<dyn Display>)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        if self.source_code.is_empty() {
            return None;
        }

        Some(Box::new(std::iter::once(LabeledSpan::new_with_span(
            Some(self.original_message()),
            self.location,
        ))))
    }

    fn source_code(&self) -> Option<&dyn SourceCode> {
        if self.source_code.is_empty() {
            None
        } else {
            Some(&self.source_code)
        }
    }
}

/// Annotates failures raised while a compiled template executes.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    source_text: Arc<str>,
    filename: Option<String>,
    dialect: SmolStr,
    enabled: bool,
}

impl ErrorReporter {
    pub fn new(sequence: &InstructionSequence, options: &Options) -> Self {
        Self {
            source_text: Arc::from(sequence.source_text.as_str()),
            filename: options
                .filename
                .as_ref()
                .map(|filename| (options.escape)(&filename.display().to_string())),
            dialect: options.dialect.clone(),
            enabled: sequence.compile_debug,
        }
    }

    /// Builds the error for a failure at `line`. With diagnostics disabled
    /// the cause passes through without an annotation.
    pub fn rethrow(&self, cause: impl Into<InnerError>, line: u32) -> Error {
        let mut error = Error::at_line(cause, &self.source_text, line);
        if !self.enabled {
            return error;
        }

        let header = self.filename.as_deref().unwrap_or(&self.dialect);
        error.annotation = Some(format!(
            "{header}:{line}\n{}",
            context_window(&self.source_text, line)
        ));
        error.path = self.filename.clone();
        error
    }
}

/// Up to three lines either side of `line`, numbered, with the failing line
/// marked by ` >> `.
pub fn context_window(source: &str, line: u32) -> String {
    let lines = source.split('\n').collect::<Vec<_>>();
    let line = line as usize;
    let end = lines.len().min(line + CONTEXT_LINES);
    let start = line.saturating_sub(CONTEXT_LINES).min(end);

    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let current = i + start + 1;
            let marker = if current == line { " >> " } else { "    " };
            format!("{marker}{current}| {text}")
        })
        .join("\n")
}

fn line_span(source: &str, line: u32) -> SourceSpan {
    let index = (line as usize).saturating_sub(1);
    let mut offset = 0;

    for (i, text) in source.split('\n').enumerate() {
        if i == index {
            return SourceSpan::new(offset.into(), text.len().max(1));
        }
        offset += text.len() + 1;
    }

    SourceSpan::new(source.len().into(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SOURCE: &str = "one\ntwo\nthree\nfour\nfive\nsix\nseven\neight";

    #[rstest]
    #[case(1, " >> 1| one\n    2| two\n    3| three\n    4| four")]
    #[case(3, "    1| one\n    2| two\n >> 3| three\n    4| four\n    5| five\n    6| six")]
    #[case(5, "    3| three\n    4| four\n >> 5| five\n    6| six\n    7| seven\n    8| eight")]
    #[case(8, "    6| six\n    7| seven\n >> 8| eight")]
    fn test_context_window(#[case] line: u32, #[case] expected: &str) {
        assert_eq!(context_window(SOURCE, line), expected);
    }

    #[test]
    fn test_context_window_beyond_source() {
        assert_eq!(context_window("only", 10), "");
    }

    #[test]
    fn test_line_span() {
        assert_eq!(line_span(SOURCE, 3), SourceSpan::new(8.into(), 5));
        assert_eq!(line_span(SOURCE, 1), SourceSpan::new(0.into(), 3));
        assert_eq!(line_span("", 1), SourceSpan::new(0.into(), 1));
    }

    #[test]
    fn test_rethrow_annotates() {
        let options = Options::default().with_filename("/views/<page>.ejs");
        let sequence = InstructionSequence {
            compile_debug: true,
            source_text: "a\nb\nc".to_string(),
            ..Default::default()
        };
        let error = ErrorReporter::new(&sequence, &options)
            .rethrow(EvalError::Reference("user".into()), 2);

        assert_eq!(error.path.as_deref(), Some("/views/&lt;page&gt;.ejs"));
        assert_eq!(
            error.to_string(),
            "/views/&lt;page&gt;.ejs:2\n    1| a\n >> 2| b\n    3| c\n\nuser is not defined"
        );
        assert_eq!(error.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn test_rethrow_defaults_to_dialect() {
        let sequence = InstructionSequence {
            compile_debug: true,
            source_text: "x".to_string(),
            ..Default::default()
        };
        let error = ErrorReporter::new(&sequence, &Options::default())
            .rethrow(EvalError::runtime("boom"), 1);

        assert_eq!(error.to_string(), "ejs:1\n >> 1| x\n\nboom");
        assert_eq!(error.path, None);
    }

    #[test]
    fn test_rethrow_disabled_passes_through() {
        let sequence = InstructionSequence {
            compile_debug: false,
            source_text: "x".to_string(),
            ..Default::default()
        };
        let error = ErrorReporter::new(&sequence, &Options::default())
            .rethrow(EvalError::runtime("boom"), 1);

        assert_eq!(error.to_string(), "boom");
        assert_eq!(error.annotation, None);
    }

    #[rstest]
    #[case(
        InnerError::Syntax(SyntaxError::InvalidIdentifier("localsName".into(), "1x".into())),
        ErrorKind::Syntax
    )]
    #[case(InnerError::Config(ConfigError::CacheWithoutFilename), ErrorKind::Configuration)]
    #[case(InnerError::Include(IncludeError::NotFound("x".to_string())), ErrorKind::NotFound)]
    #[case(InnerError::Eval(EvalError::runtime("x")), ErrorKind::Runtime)]
    #[case(
        InnerError::Eval(EvalError::Template(Arc::new(Error::new(IncludeError::NotFound(
            "x".to_string()
        ))))),
        ErrorKind::NotFound
    )]
    fn test_kind(#[case] cause: InnerError, #[case] expected: ErrorKind) {
        assert_eq!(Error::new(cause).kind(), expected);
    }

    #[test]
    fn test_diagnostic_code() {
        let error = Error::at_line(
            SyntaxError::Lexer(LexerError::UnmatchedTag {
                tag: "<%".to_string(),
                line: 1,
            }),
            "<% x",
            1,
        );
        assert_eq!(
            error.code().map(|c| c.to_string()),
            Some("SyntaxError::UnmatchedTag".to_string())
        );
        assert_eq!(error.to_string(), "Could not find matching close tag for \"<%\".");
        assert!(error.labels().is_some());
    }
}
