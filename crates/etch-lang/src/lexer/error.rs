use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexerError {
    #[error("Could not find matching close tag for \"{tag}\".")]
    UnmatchedTag { tag: String, line: u32 },
}

impl LexerError {
    pub fn line(&self) -> u32 {
        match self {
            LexerError::UnmatchedTag { line, .. } => *line,
        }
    }
}
