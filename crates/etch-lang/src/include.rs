pub mod error;

use std::path::{Component, Path, PathBuf};

use error::IncludeError;

use crate::{
    fs::FileSystem,
    options::{Options, Root},
};

/// Where an include directive points once resolution is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeTarget {
    File(PathBuf),
    Inline {
        filename: Option<PathBuf>,
        template: String,
    },
}

/// Resolves include references against the current file, the configured
/// root(s) and view directories, then lets a custom includer override the
/// result.
pub struct IncludeResolver<'a> {
    fs: &'a dyn FileSystem,
    options: &'a Options,
}

impl<'a> IncludeResolver<'a> {
    pub fn new(fs: &'a dyn FileSystem, options: &'a Options) -> Self {
        Self { fs, options }
    }

    pub fn locate(&self, path: &str) -> Result<IncludeTarget, IncludeError> {
        let default = self.resolve(path)?;

        if let Some(includer) = &self.options.includer {
            if let Some(found) = includer(path, default.as_deref()) {
                let filename = found.filename.or(default);
                log::debug!("includer override for {path:?}: {filename:?}");

                return match (found.template, filename) {
                    (Some(template), filename) => Ok(IncludeTarget::Inline { filename, template }),
                    (None, Some(filename)) => Ok(IncludeTarget::File(filename)),
                    (None, None) => Err(self.not_found(path)),
                };
            }
        }

        default
            .map(IncludeTarget::File)
            .ok_or_else(|| self.not_found(path))
    }

    /// Computes the default location without consulting the includer.
    /// `Ok(None)` means nothing matched but an includer may still answer.
    pub fn resolve(&self, path: &str) -> Result<Option<PathBuf>, IncludeError> {
        let extension = self.options.extension();

        let resolved = if is_absolute_reference(path) {
            let path = path.trim_start_matches('/');
            match &self.options.root {
                Some(Root::Dirs(roots)) => self.first_existing(path, roots),
                Some(Root::Dir(root)) => Some(resolve_include(path, root, true, &extension)),
                None => Some(resolve_include(path, Path::new("/"), true, &extension)),
            }
        } else {
            let relative = self
                .options
                .filename
                .as_ref()
                .map(|filename| resolve_include(path, filename, false, &extension))
                .filter(|candidate| self.fs.exists(candidate));

            relative.or_else(|| self.first_existing(path, &self.options.views))
        };

        match resolved {
            Some(resolved) => {
                log::debug!("resolved include {path:?} to {}", resolved.display());
                Ok(Some(resolved))
            }
            None if self.options.includer.is_some() => Ok(None),
            None => Err(self.not_found(path)),
        }
    }

    fn first_existing(&self, path: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
        let extension = self.options.extension();
        dirs.iter()
            .map(|dir| resolve_include(path, dir, true, &extension))
            .find(|candidate| self.fs.exists(candidate))
    }

    fn not_found(&self, path: &str) -> IncludeError {
        IncludeError::NotFound((self.options.escape)(path))
    }
}

/// Leading separator or a drive marker such as `C:\`.
pub fn is_absolute_reference(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }

    let letters = path.chars().take_while(char::is_ascii_alphabetic).count();
    letters > 0 && path[letters..].starts_with(":\\")
}

/// Resolves `name` against `base` (a directory when `is_dir`, otherwise a
/// file whose directory is used) and appends `extension` when `name` has none.
pub fn resolve_include(name: &str, base: &Path, is_dir: bool, extension: &str) -> PathBuf {
    let dir = if is_dir {
        base
    } else {
        base.parent().unwrap_or_else(|| Path::new(""))
    };
    let mut resolved = normalize(&dir.join(name));

    if Path::new(name).extension().is_none() {
        let mut raw = resolved.into_os_string();
        raw.push(extension);
        resolved = PathBuf::from(raw);
    }

    resolved
}

fn normalize(path: &Path) -> PathBuf {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    path.components()
        .fold(PathBuf::new(), |mut normalized, component| {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    normalized.pop();
                }
                component => normalized.push(component.as_os_str()),
            }
            normalized
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fs::MemoryFileSystem, options::IncludeOverride};
    use rstest::rstest;

    fn fs() -> MemoryFileSystem {
        MemoryFileSystem::new()
            .with_file("/views/partial.ejs", "partial")
            .with_file("/views/shared/header.ejs", "header")
            .with_file("/other/partial.ejs", "other")
            .with_file("/pages/item.ejs", "item")
            .with_file("/pages/style.css", "css")
            .with_file("/roots/b/top.ejs", "top")
    }

    #[rstest]
    #[case("partial", "/views", true, "/views/partial.ejs")]
    #[case("partial.html", "/views", true, "/views/partial.html")]
    #[case("../shared/header", "/views/pages/index.ejs", false, "/views/shared/header.ejs")]
    #[case("./a/./b", "/x", true, "/x/a/b.ejs")]
    fn test_resolve_include(
        #[case] name: &str,
        #[case] base: &str,
        #[case] is_dir: bool,
        #[case] expected: &str,
    ) {
        assert_eq!(
            resolve_include(name, Path::new(base), is_dir, ".ejs"),
            PathBuf::from(expected)
        );
    }

    #[rstest]
    #[case("/partial", true)]
    #[case("C:\\views\\a", true)]
    #[case("partial", false)]
    #[case("./partial", false)]
    #[case("C:partial", false)]
    fn test_is_absolute_reference(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_absolute_reference(path), expected);
    }

    #[test]
    fn test_resolve_against_views() {
        let fs = fs();
        let options = Options::default().with_views(["/views"]);
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.resolve("partial"),
            Ok(Some(PathBuf::from("/views/partial.ejs")))
        );
    }

    #[test]
    fn test_resolve_views_first_match_wins() {
        let fs = fs();
        let options = Options::default().with_views(["/missing", "/other", "/views"]);
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.resolve("partial"),
            Ok(Some(PathBuf::from("/other/partial.ejs")))
        );
    }

    #[test]
    fn test_resolve_relative_to_current_file_first() {
        let fs = fs().with_file("/pages/partial.ejs", "local");
        let options = Options::default()
            .with_filename("/pages/index.ejs")
            .with_views(["/views"]);
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.resolve("partial"),
            Ok(Some(PathBuf::from("/pages/partial.ejs")))
        );
        assert_eq!(
            resolver.resolve("style.css"),
            Ok(Some(PathBuf::from("/pages/style.css")))
        );
    }

    #[test]
    fn test_resolve_falls_back_to_views() {
        let fs = fs();
        let options = Options::default()
            .with_filename("/pages/index.ejs")
            .with_views(["/views"]);
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.resolve("shared/header"),
            Ok(Some(PathBuf::from("/views/shared/header.ejs")))
        );
    }

    #[test]
    fn test_resolve_uses_dialect_extension() {
        let fs = MemoryFileSystem::new().with_file("/views/partial.etch", "x");
        let options = Options::default()
            .with_views(["/views"])
            .with_dialect("etch");
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.resolve("partial"),
            Ok(Some(PathBuf::from("/views/partial.etch")))
        );
    }

    #[test]
    fn test_resolve_absolute_single_root_skips_existence_check() {
        let fs = fs();
        let options = Options::default().with_root(Root::Dir(PathBuf::from("/srv")));
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.resolve("/layouts/main"),
            Ok(Some(PathBuf::from("/srv/layouts/main.ejs")))
        );
    }

    #[test]
    fn test_resolve_absolute_root_list() {
        let fs = fs();
        let options = Options::default().with_root(Root::Dirs(vec![
            PathBuf::from("/roots/a"),
            PathBuf::from("/roots/b"),
        ]));
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.resolve("//top"),
            Ok(Some(PathBuf::from("/roots/b/top.ejs")))
        );
        assert_eq!(
            resolver.resolve("/missing"),
            Err(IncludeError::NotFound("/missing".to_string()))
        );
    }

    #[test]
    fn test_resolve_not_found_escapes_path() {
        let fs = fs();
        let options = Options::default().with_views(["/views"]);
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.resolve("<nope>"),
            Err(IncludeError::NotFound("&lt;nope&gt;".to_string()))
        );
    }

    #[test]
    fn test_locate_with_includer_inline_template() {
        let fs = fs();
        let options = Options::default().with_includer(|path, _| {
            (path == "virtual").then(|| IncludeOverride::template("<%= 1 + 1 %>"))
        });
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.locate("virtual"),
            Ok(IncludeTarget::Inline {
                filename: None,
                template: "<%= 1 + 1 %>".to_string()
            })
        );
        assert_eq!(
            resolver.locate("nothing"),
            Err(IncludeError::NotFound("nothing".to_string()))
        );
    }

    #[test]
    fn test_locate_with_includer_filename_override() {
        let fs = fs();
        let options = Options::default()
            .with_views(["/views"])
            .with_includer(|_, default| {
                assert_eq!(default, Some(Path::new("/views/partial.ejs")));
                Some(IncludeOverride::filename("/other/partial.ejs"))
            });
        let resolver = IncludeResolver::new(&fs, &options);

        assert_eq!(
            resolver.locate("partial"),
            Ok(IncludeTarget::File(PathBuf::from("/other/partial.ejs")))
        );
    }
}
