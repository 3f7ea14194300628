use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
};

use smol_str::SmolStr;

use crate::{error::SyntaxError, escape::escape_xml, script::value::Value};

pub type EscapeFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Custom include resolution: receives the raw include path and the
/// default resolved location (if any).
pub type Includer = Arc<dyn Fn(&str, Option<&Path>) -> Option<IncludeOverride> + Send + Sync>;

/// Keys copied out of the data argument by the two-argument `render`.
pub const PASSABLE_WITH_DATA: [&str; 9] = [
    "delimiter",
    "debug",
    "compileDebug",
    "client",
    "_with",
    "rmWhitespace",
    "strict",
    "filename",
    "async",
];

pub const DEFAULT_LOCALS_NAME: &str = "locals";
pub const DEFAULT_DIALECT: &str = "ejs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    pub open: String,
    pub inner: String,
    pub close: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self::new("<", "%", ">")
    }
}

impl Delimiters {
    pub fn new(open: &str, inner: &str, close: &str) -> Self {
        Self {
            open: open.to_string(),
            inner: inner.to_string(),
            close: close.to_string(),
        }
    }
}

/// Root used for include paths starting with a separator or drive marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    /// Resolved against directly, without an existence check.
    Dir(PathBuf),
    /// Searched in order; the first existing file wins.
    Dirs(Vec<PathBuf>),
}

/// Value returned by an [`Includer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeOverride {
    pub filename: Option<PathBuf>,
    pub template: Option<String>,
}

impl IncludeOverride {
    pub fn filename(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: Some(filename.into()),
            template: None,
        }
    }

    pub fn template(template: impl Into<String>) -> Self {
        Self {
            filename: None,
            template: Some(template.into()),
        }
    }
}

#[derive(Clone)]
pub struct Options {
    pub delimiters: Delimiters,
    pub locals_name: SmolStr,
    pub destructured_locals: Vec<SmolStr>,
    pub strict: bool,
    pub expose_locals: bool,
    pub rm_whitespace: bool,
    pub filename: Option<PathBuf>,
    pub root: Option<Root>,
    pub views: Vec<PathBuf>,
    pub includer: Option<Includer>,
    pub cache: bool,
    pub escape: EscapeFn,
    pub output_function_name: Option<SmolStr>,
    pub async_mode: bool,
    pub debug: bool,
    pub compile_debug: bool,
    pub client: bool,
    pub prefix: Option<String>,
    pub files: BTreeMap<SmolStr, String>,
    pub dialect: SmolStr,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            delimiters: Delimiters::default(),
            locals_name: SmolStr::new_static(DEFAULT_LOCALS_NAME),
            destructured_locals: Vec::new(),
            strict: false,
            expose_locals: true,
            rm_whitespace: false,
            filename: None,
            root: None,
            views: Vec::new(),
            includer: None,
            cache: false,
            escape: Arc::new(escape_xml),
            output_function_name: None,
            async_mode: false,
            debug: false,
            compile_debug: true,
            client: false,
            prefix: None,
            files: BTreeMap::new(),
            dialect: SmolStr::new_static(DEFAULT_DIALECT),
        }
    }
}

impl Debug for Options {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("delimiters", &self.delimiters)
            .field("locals_name", &self.locals_name)
            .field("destructured_locals", &self.destructured_locals)
            .field("strict", &self.strict)
            .field("expose_locals", &self.expose_locals)
            .field("rm_whitespace", &self.rm_whitespace)
            .field("filename", &self.filename)
            .field("root", &self.root)
            .field("views", &self.views)
            .field("includer", &self.includer.is_some())
            .field("cache", &self.cache)
            .field("output_function_name", &self.output_function_name)
            .field("async_mode", &self.async_mode)
            .field("debug", &self.debug)
            .field("compile_debug", &self.compile_debug)
            .field("client", &self.client)
            .field("prefix", &self.prefix)
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl Options {
    pub fn with_delimiters(mut self, open: &str, inner: &str, close: &str) -> Self {
        self.delimiters = Delimiters::new(open, inner, close);
        self
    }

    pub fn with_delimiter(mut self, inner: &str) -> Self {
        self.delimiters.inner = inner.to_string();
        self
    }

    pub fn with_locals_name(mut self, name: &str) -> Self {
        self.locals_name = name.into();
        self
    }

    pub fn with_destructured_locals<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        self.destructured_locals = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_expose_locals(mut self, expose: bool) -> Self {
        self.expose_locals = expose;
        self
    }

    pub fn with_rm_whitespace(mut self, rm_whitespace: bool) -> Self {
        self.rm_whitespace = rm_whitespace;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_root(mut self, root: Root) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_views<I, P>(mut self, views: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.views = views.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_includer<F>(mut self, includer: F) -> Self
    where
        F: Fn(&str, Option<&Path>) -> Option<IncludeOverride> + Send + Sync + 'static,
    {
        self.includer = Some(Arc::new(includer));
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_escape<F>(mut self, escape: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.escape = Arc::new(escape);
        self
    }

    pub fn with_output_function_name(mut self, name: &str) -> Self {
        self.output_function_name = Some(name.into());
        self
    }

    pub fn with_async(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_compile_debug(mut self, compile_debug: bool) -> Self {
        self.compile_debug = compile_debug;
        self
    }

    pub fn with_client(mut self, client: bool) -> Self {
        self.client = client;
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    pub fn with_file(mut self, name: &str, template: &str) -> Self {
        self.files.insert(name.into(), template.to_string());
        self
    }

    pub fn with_dialect(mut self, dialect: &str) -> Self {
        self.dialect = dialect.into();
        self
    }

    /// Whether data context fields are addressable as free identifiers.
    /// Strict execution always disables it.
    pub fn exposes_locals(&self) -> bool {
        !self.strict && self.expose_locals
    }

    /// Name used for the default-file extension and the error header.
    pub fn extension(&self) -> String {
        format!(".{}", self.dialect)
    }

    pub fn validate(&self) -> Result<(), SyntaxError> {
        if let Some(name) = &self.output_function_name {
            if !is_identifier(name) {
                return Err(SyntaxError::InvalidIdentifier(
                    "outputFunctionName".into(),
                    name.clone(),
                ));
            }
        }

        if !is_identifier(&self.locals_name) {
            return Err(SyntaxError::InvalidIdentifier(
                "localsName".into(),
                self.locals_name.clone(),
            ));
        }

        for (i, name) in self.destructured_locals.iter().enumerate() {
            if !is_identifier(name) {
                return Err(SyntaxError::InvalidIdentifier(
                    format!("destructuredLocals[{i}]").into(),
                    name.clone(),
                ));
            }
        }

        for name in self.files.keys() {
            if !is_identifier(name) {
                return Err(SyntaxError::InvalidIdentifier(
                    format!("files[{name}]").into(),
                    name.clone(),
                ));
            }
        }

        Ok(())
    }

    /// Copies the allow-listed configuration keys present in `data`.
    pub fn promote_from(&mut self, data: &Value) {
        for key in PASSABLE_WITH_DATA {
            let Some(value) = data.property(key) else {
                continue;
            };

            match key {
                "delimiter" => self.delimiters.inner = value.to_string(),
                "debug" => self.debug = value.is_truthy(),
                "compileDebug" => self.compile_debug = value.is_truthy(),
                "client" => self.client = value.is_truthy(),
                "_with" => self.expose_locals = value.is_truthy(),
                "rmWhitespace" => self.rm_whitespace = value.is_truthy(),
                "strict" => self.strict = value.is_truthy(),
                "filename" => self.filename = Some(PathBuf::from(value.to_string())),
                "async" => self.async_mode = value.is_truthy(),
                _ => {}
            }
        }
    }
}

/// Matches `^[A-Za-z_$][0-9A-Za-z_$]*$`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    }
}
