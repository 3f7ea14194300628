use std::{
    fmt::{self, Debug, Formatter},
    io,
    path::Path,
    sync::Arc,
};

use futures::future::{self, FutureExt, LocalBoxFuture};

use crate::{
    cache::{MemoryCache, TemplateCache},
    error::{ConfigError, Error},
    fs::{FileSystem, LocalFileSystem},
    include::{IncludeResolver, IncludeTarget, error::IncludeError},
    options::Options,
    render::{Backend, Template},
    script::{ScriptBackend, value::Value},
};

/// The compiler entry point.
///
/// An engine owns the compiled-template cache, the filesystem used to load
/// templates and the backend that turns instruction sequences into programs.
/// Clones share all three.
#[derive(Clone)]
pub struct Engine {
    cache: Arc<dyn TemplateCache>,
    fs: Arc<dyn FileSystem>,
    backend: Arc<dyn Backend>,
}

impl Default for Engine {
    /// The process-wide cache, the local filesystem and the script backend.
    fn default() -> Self {
        Self {
            cache: MemoryCache::global(),
            fs: Arc::new(LocalFileSystem),
            backend: Arc::new(ScriptBackend),
        }
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        cache: Arc<dyn TemplateCache>,
        fs: Arc<dyn FileSystem>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self { cache, fs, backend }
    }

    /// An engine with a private cache over `fs`.
    pub fn isolated(fs: impl FileSystem + 'static) -> Self {
        Self::new(
            Arc::new(MemoryCache::new()),
            Arc::new(fs),
            Arc::new(ScriptBackend),
        )
    }

    pub fn with_cache(mut self, cache: Arc<dyn TemplateCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn cache(&self) -> &Arc<dyn TemplateCache> {
        &self.cache
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Returns the cached template for `options.filename` when caching is
    /// on, otherwise compiles `text` (or the file when `text` is `None`) and
    /// caches the result.
    pub fn handle_cache(
        &self,
        text: Option<&str>,
        options: &Options,
    ) -> Result<Arc<Template>, Error> {
        let filename = options.filename.as_deref();

        if options.cache {
            let filename = filename.ok_or_else(|| Error::new(ConfigError::CacheWithoutFilename))?;
            if let Some(template) = self.cache.get(filename) {
                return Ok(template);
            }
        }

        let loaded;
        let text = match (text, filename) {
            (Some(text), _) => text,
            (None, Some(filename)) => {
                loaded = self.load(filename)?;
                loaded.as_str()
            }
            (None, None) => return Err(Error::new(ConfigError::MissingTemplate)),
        };

        let template = Arc::new(Template::compile(text, options.clone(), self.clone())?);
        if let (true, Some(filename)) = (options.cache, filename) {
            self.cache.set(filename, Arc::clone(&template));
        }

        Ok(template)
    }

    pub fn compile(&self, text: &str, options: &Options) -> Result<Arc<Template>, Error> {
        self.handle_cache(Some(text), options)
    }

    pub fn compile_file(
        &self,
        path: impl AsRef<Path>,
        options: &Options,
    ) -> Result<Arc<Template>, Error> {
        let options = options.clone().with_filename(path.as_ref());
        self.handle_cache(None, &options)
    }

    pub fn render(
        &self,
        text: &str,
        data: impl Into<Value>,
        options: &Options,
    ) -> Result<String, Error> {
        self.compile(text, options)?.render(data)
    }

    pub fn render_async(
        &self,
        text: &str,
        data: impl Into<Value>,
        options: &Options,
    ) -> LocalBoxFuture<'static, Result<String, Error>> {
        match self.compile(text, options) {
            Ok(template) => template.render_async(data),
            Err(e) => future::ready(Err(e)).boxed_local(),
        }
    }

    pub fn render_file(
        &self,
        path: impl AsRef<Path>,
        data: impl Into<Value>,
        options: &Options,
    ) -> Result<String, Error> {
        self.compile_file(path, options)?.render(data)
    }

    pub fn render_file_async(
        &self,
        path: impl AsRef<Path>,
        data: impl Into<Value>,
        options: &Options,
    ) -> LocalBoxFuture<'static, Result<String, Error>> {
        match self.compile_file(path, options) {
            Ok(template) => template.render_async(data),
            Err(e) => future::ready(Err(e)).boxed_local(),
        }
    }

    /// Resolves `path` from a template compiled with `parent` and compiles
    /// the target with the parent's configuration.
    pub fn include_file(&self, path: &str, parent: &Options) -> Result<Arc<Template>, Error> {
        let target = IncludeResolver::new(self.fs.as_ref(), parent)
            .locate(path)
            .map_err(Error::new)?;

        let mut options = parent.clone();
        options.files.clear();
        options.client = false;

        match target {
            IncludeTarget::File(filename) => {
                options.filename = Some(filename);
                self.handle_cache(None, &options)
            }
            IncludeTarget::Inline { filename, template } => {
                options.filename = filename;
                self.handle_cache(Some(&template), &options)
            }
        }
    }

    pub fn clear_cache(&self) {
        self.cache.reset();
    }

    fn load(&self, filename: &Path) -> Result<String, Error> {
        log::debug!("loading {}", filename.display());
        self.fs.read_template(filename).map_err(|e| {
            let path = filename.display().to_string();
            Error::new(match e.kind() {
                io::ErrorKind::NotFound => IncludeError::NotFound(path),
                _ => IncludeError::Io {
                    path,
                    message: e.to_string(),
                },
            })
        })
    }
}
