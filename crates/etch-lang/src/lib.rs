//! `etch-lang` compiles embedded-script text templates and renders them.
//!
//! Templates mix literal text with tags holding template code:
//! `<% code %>` runs a statement, `<%= expr %>` outputs escaped,
//! `<%- expr %>` outputs raw and `<%# ... %>` is a comment. Closing with
//! `-%>` drops the following linebreak, `_%>`/`<%_` also drop adjacent
//! whitespace, and `<%%`/`%%>` output the delimiters literally.
//!
//! ## Examples
//!
//! ```rust
//! use serde_json::json;
//!
//! let html = etch_lang::render(
//!     "<% if (user) { %><h1><%= user.name %></h1><% } %>",
//!     json!({"user": {"name": "<Ada>"}}),
//! )
//! .unwrap();
//!
//! assert_eq!(html, "<h1>&lt;Ada&gt;</h1>");
//!
//! // Compile once, render many times
//! use etch_lang::{Engine, Options};
//!
//! let engine = Engine::default();
//! let template = engine
//!     .compile("<%= items.join(', ') %>", &Options::default())
//!     .unwrap();
//!
//! assert_eq!(template.render(json!({"items": [1, 2, 3]})).unwrap(), "1, 2, 3");
//! ```
mod assembler;
mod cache;
mod engine;
mod error;
mod escape;
mod fs;
mod include;
mod lexer;
mod options;
mod render;
pub mod script;

use std::{path::Path, sync::Arc};

pub use assembler::assemble;
pub use assembler::instruction::{Instruction, InstructionSequence};
pub use cache::{MemoryCache, TemplateCache};
pub use engine::Engine;
pub use error::{
    ConfigError, Error, ErrorKind, ErrorReporter, InnerError, SyntaxError, context_window,
};
pub use escape::escape_xml;
pub use fs::{FileSystem, LocalFileSystem, MemoryFileSystem};
pub use include::error::IncludeError;
pub use include::{IncludeResolver, IncludeTarget};
pub use lexer::Lexer;
pub use lexer::error::LexerError;
pub use lexer::token::{Marker, Token};
pub use options::{Delimiters, EscapeFn, IncludeOverride, Includer, Options, Root};
pub use render::{
    Backend, Bindings, Failure, Fragment, IncludeFn, Invocation, OutputBuffer, Program, Rendered,
    Template,
};
pub use script::ScriptBackend;
pub use script::error::{EvalError, ParseError};
pub use script::value::{Object, Value};

pub type EtchResult = Result<String, Error>;

/// Compiles `text` with the default engine.
#[allow(clippy::result_large_err)]
pub fn compile(text: &str, options: &Options) -> Result<Arc<Template>, Error> {
    Engine::default().compile(text, options)
}

/// Renders `text` with default options. Allow-listed configuration keys
/// (`delimiter`, `strict`, `filename`, ...) present in `data` are applied as
/// options.
#[allow(clippy::result_large_err)]
pub fn render(text: &str, data: impl Into<Value>) -> EtchResult {
    let data = data.into();
    let mut options = Options::default();
    options.promote_from(&data);

    Engine::default().render(text, data, &options)
}

#[allow(clippy::result_large_err)]
pub fn render_with_options(text: &str, data: impl Into<Value>, options: &Options) -> EtchResult {
    Engine::default().render(text, data, options)
}

#[allow(clippy::result_large_err)]
pub fn render_file(
    path: impl AsRef<Path>,
    data: impl Into<Value>,
    options: &Options,
) -> EtchResult {
    Engine::default().render_file(path, data, options)
}

/// Empties the process-wide template cache.
pub fn clear_cache() {
    Engine::default().clear_cache();
}
