use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IncludeError {
    #[error("Could not find the include file \"{0}\"")]
    NotFound(String),
    #[error("Failed to read template \"{path}\": {message}")]
    Io { path: String, message: String },
}
