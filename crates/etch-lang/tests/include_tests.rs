use std::path::PathBuf;

use etch_lang::{
    Engine, ErrorKind, IncludeOverride, IncludeResolver, IncludeTarget, LocalFileSystem,
    MemoryFileSystem, Options, Root,
};
use etch_test::{TemplateDir, create_file, defer};
use rstest::{fixture, rstest};
use serde_json::json;

#[fixture]
fn site() -> TemplateDir {
    TemplateDir::new()
        .with_file(
            "pages/index.ejs",
            "<%- include('../partials/header', {title: 'Home'}) %><main><%= body %></main>",
        )
        .with_file(
            "partials/header.ejs",
            "<header><%= title %>|<%- include('nav') %></header>",
        )
        .with_file("partials/nav.ejs", "<nav><%= links.join(',') %></nav>")
        .with_file("shared/footer.ejs", "<footer><%= year %></footer>")
        .with_file("other/footer.ejs", "<footer>other</footer>")
        .with_file("broken.ejs", "ok\n<%= missing.value %>")
        .with_file("outer.ejs", "before\n<%- include('broken') %>")
        .with_file("loop.ejs", "<%- include('loop') %>")
}

fn engine() -> Engine {
    Engine::isolated(LocalFileSystem)
}

#[rstest]
fn test_nested_relative_includes(site: TemplateDir) {
    let html = engine().render_file(
        site.join("pages/index.ejs"),
        json!({"body": "<p>", "links": ["a", "b"]}),
        &Options::default(),
    );

    assert_eq!(
        html,
        Ok("<header>Home|<nav>a,b</nav></header><main>&lt;p&gt;</main>".to_string())
    );
}

#[rstest]
fn test_include_from_views(site: TemplateDir) {
    let options = Options::default().with_views([site.join("missing"), site.join("shared")]);

    assert_eq!(
        engine().render("<%- include('footer') %>", json!({"year": 2024}), &options),
        Ok("<footer>2024</footer>".to_string())
    );
}

#[rstest]
fn test_absolute_include_with_root(site: TemplateDir) {
    let options = Options::default().with_root(Root::Dir(site.path().to_path_buf()));

    assert_eq!(
        engine().render("<%- include('/shared/footer') %>", json!({"year": 1}), &options),
        Ok("<footer>1</footer>".to_string())
    );
}

#[rstest]
fn test_absolute_include_with_root_list(site: TemplateDir) {
    let options = Options::default().with_root(Root::Dirs(vec![
        site.join("nothing"),
        site.join("other"),
        site.join("shared"),
    ]));

    assert_eq!(
        engine().render("<%- include('/footer') %>", json!({}), &options),
        Ok("<footer>other</footer>".to_string())
    );
}

#[rstest]
fn test_nested_failure_is_annotated_twice(site: TemplateDir) {
    let outer = site.join("outer.ejs");
    let broken = site.join("broken.ejs");
    let error = engine()
        .render_file(&outer, json!({}), &Options::default())
        .unwrap_err();
    let message = error.to_string();

    assert_eq!(error.kind(), ErrorKind::Runtime);
    assert_eq!(error.path, Some(outer.display().to_string()));
    assert!(message.starts_with(&format!("{}:2\n", outer.display())));
    assert!(message.contains(&format!("\n\n{}:2\n", broken.display())));
    assert!(message.contains(" >> 2| <%- include('broken') %>"));
    assert!(message.contains(" >> 2| <%= missing.value %>"));
    assert!(message.ends_with("missing is not defined"));
}

#[rstest]
fn test_include_not_found_reports_escaped_path(site: TemplateDir) {
    let options = Options::default().with_filename(site.join("page.ejs"));
    let error = engine()
        .render("<%- include('<nope>') %>", json!({}), &options)
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert!(
        error
            .to_string()
            .ends_with("Could not find the include file \"&lt;nope&gt;\"")
    );
}

#[rstest]
fn test_recursive_include_is_bounded(site: TemplateDir) {
    let path = site.join("loop.ejs");
    let handle = std::thread::Builder::new()
        .stack_size(256 * 1024 * 1024)
        .spawn(move || engine().render_file(path, json!({}), &Options::default()))
        .unwrap();
    let error = handle.join().unwrap().unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Runtime);
    assert!(error.to_string().ends_with("Maximum include depth exceeded"));
}

#[rstest]
fn test_cached_include_is_reused(site: TemplateDir) {
    let engine = engine();
    defer! {
        engine.clear_cache();
    }
    let options = Options::default().with_cache(true);
    let header = site.join("partials/header.ejs");

    let html = engine.render_file(
        site.join("pages/index.ejs"),
        json!({"body": "", "links": []}),
        &options,
    );
    assert!(html.is_ok());

    let cached = engine.cache().get(&header).unwrap();
    let again = engine.compile_file(&header, &options).unwrap();
    assert!(std::sync::Arc::ptr_eq(&cached, &again));
}

#[rstest]
fn test_includer_inline_template() {
    let options = Options::default().with_includer(|path, default| {
        assert_eq!(default, None);
        path.strip_prefix("inline:")
            .map(|name| IncludeOverride::template(format!("[{name}:<%= n %>]")))
    });

    assert_eq!(
        Engine::isolated(MemoryFileSystem::new()).render(
            "<%- include('inline:a', {n: 1}) %><%- include('inline:b', {n: 2}) %>",
            json!({}),
            &options
        ),
        Ok("[a:1][b:2]".to_string())
    );
}

#[test]
fn test_render_file_with_default_engine() {
    let (_dir, path) = create_file("hello.ejs", "Hello <%= name %>");

    assert_eq!(
        etch_lang::render_file(&path, json!({"name": "file"}), &Options::default()),
        Ok("Hello file".to_string())
    );
}

#[test]
fn test_resolve_against_views() {
    let fs = MemoryFileSystem::new().with_file("/views/partial.ejs", "");
    let options = Options::default().with_views(["/views"]);

    assert_eq!(
        IncludeResolver::new(&fs, &options).locate("partial"),
        Ok(IncludeTarget::File(PathBuf::from("/views/partial.ejs")))
    );
}

#[rstest]
#[case::dialect("ejs", "partial", "/views/partial.ejs")]
#[case::custom_dialect("html", "partial", "/views/partial.html")]
#[case::explicit_extension("ejs", "partial.txt", "/views/partial.txt")]
fn test_resolve_extension(#[case] dialect: &str, #[case] path: &str, #[case] expected: &str) {
    let fs = MemoryFileSystem::new().with_file(expected, "");
    let options = Options::default()
        .with_views(["/views"])
        .with_dialect(dialect);

    assert_eq!(
        IncludeResolver::new(&fs, &options).locate(path),
        Ok(IncludeTarget::File(PathBuf::from(expected)))
    );
}
