use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

/// A temporary directory of template files, removed on drop.
pub struct TemplateDir {
    dir: TempDir,
}

impl TemplateDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    /// Writes `content` to `name`, creating parent directories.
    pub fn with_file(self, name: &str, content: &str) -> Self {
        let path = self.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create template dir");
        }
        fs::write(&path, content).expect("Failed to write template");
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Default for TemplateDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a single template file in a fresh temporary directory.
pub fn create_file(name: &str, content: &str) -> (TemplateDir, PathBuf) {
    let dir = TemplateDir::new().with_file(name, content);
    let path = dir.join(name);

    (dir, path)
}
