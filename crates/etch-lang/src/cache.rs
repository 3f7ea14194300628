use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, PoisonError, RwLock},
};

use rustc_hash::FxHashMap;

use crate::render::Template;

static GLOBAL_CACHE: LazyLock<Arc<MemoryCache>> = LazyLock::new(|| Arc::new(MemoryCache::new()));

/// Compiled templates keyed by filename.
///
/// Entries live until removed or reset; there is no eviction.
pub trait TemplateCache: Send + Sync {
    fn get(&self, filename: &Path) -> Option<Arc<Template>>;
    fn set(&self, filename: &Path, template: Arc<Template>);
    fn remove(&self, filename: &Path);
    fn reset(&self);
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<FxHashMap<PathBuf, Arc<Template>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache shared by default engines.
    pub fn global() -> Arc<MemoryCache> {
        Arc::clone(&GLOBAL_CACHE)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TemplateCache for MemoryCache {
    fn get(&self, filename: &Path) -> Option<Arc<Template>> {
        let template = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(filename)
            .cloned();

        if template.is_some() {
            log::trace!("cache hit: {}", filename.display());
        }
        template
    }

    fn set(&self, filename: &Path, template: Arc<Template>) {
        log::debug!("caching {}", filename.display());
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filename.to_path_buf(), template);
    }

    fn remove(&self, filename: &Path) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(filename);
    }

    fn reset(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
