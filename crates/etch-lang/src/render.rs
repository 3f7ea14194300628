use std::{
    fmt::{self, Debug, Formatter},
    rc::Rc,
    sync::Arc,
};

use futures::future::{self, FutureExt, LocalBoxFuture};
use smol_str::SmolStr;

use crate::{
    assembler::{assemble, instruction::InstructionSequence},
    engine::Engine,
    error::{ConfigError, Error, ErrorReporter, SyntaxError},
    options::{EscapeFn, Options},
    script::{
        error::EvalError,
        value::{Object, Pending, Value, settle},
    },
};

const MAX_INCLUDE_DEPTH: usize = 32;

/// The `include` callable handed to a running program.
pub type IncludeFn = Rc<dyn Fn(&str, Option<Value>) -> Result<Value, EvalError>>;

/// A piece of rendered output. Pending pieces only appear in async mode.
pub enum Fragment {
    Text(String),
    Pending {
        value: Pending,
        escape: bool,
        line: u32,
    },
}

impl Debug for Fragment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Fragment::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Fragment::Pending { escape, line, .. } => f
                .debug_struct("Pending")
                .field("escape", escape)
                .field("line", line)
                .finish_non_exhaustive(),
        }
    }
}

/// The output accumulator a program writes into, in emission order.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    fragments: Vec<Fragment>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }

        match self.fragments.last_mut() {
            Some(Fragment::Text(last)) => last.push_str(text),
            _ => self.fragments.push(Fragment::Text(text.to_string())),
        }
    }

    pub fn push_pending(&mut self, value: Pending, escape: bool, line: u32) {
        self.fragments.push(Fragment::Pending {
            value,
            escape,
            line,
        });
    }

    pub fn has_pending(&self) -> bool {
        self.fragments
            .iter()
            .any(|fragment| matches!(fragment, Fragment::Pending { .. }))
    }

    /// The whole output, or `None` while any fragment is still pending.
    pub fn into_text(self) -> Option<String> {
        let mut text = String::new();
        for fragment in self.fragments {
            match fragment {
                Fragment::Text(part) => text.push_str(&part),
                Fragment::Pending { .. } => return None,
            }
        }

        Some(text)
    }

    pub fn into_fragments(self) -> Vec<Fragment> {
        self.fragments
    }
}

/// Everything a program receives for one run.
pub struct Invocation {
    pub data: Value,
    pub escape: EscapeFn,
    /// `None` leaves `include` unbound.
    pub include: Option<IncludeFn>,
    /// Extra callables bound next to the locals, e.g. `files` templates.
    pub bindings: Vec<(SmolStr, Value)>,
}

/// A failed run together with the last template line the program reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub error: EvalError,
    pub line: u32,
}

/// An executable form of an instruction sequence.
///
/// A run suspends only at awaits of unresolved values, which async templates
/// alone allow.
pub trait Program: Send + Sync + Debug {
    fn execute(
        &self,
        invocation: Invocation,
    ) -> LocalBoxFuture<'static, Result<OutputBuffer, Failure>>;
}

/// Turns instruction sequences into [`Program`]s.
pub trait Backend: Send + Sync {
    fn compile(
        &self,
        sequence: &InstructionSequence,
        options: &Options,
    ) -> Result<Box<dyn Program>, SyntaxError>;
}

/// Output of a template call: immediate text for sync templates, a future
/// for async ones.
pub enum Rendered {
    Text(String),
    Deferred(LocalBoxFuture<'static, Result<String, Error>>),
}

impl Rendered {
    pub fn into_future(self) -> LocalBoxFuture<'static, Result<String, Error>> {
        match self {
            Rendered::Text(text) => future::ready(Ok(text)).boxed_local(),
            Rendered::Deferred(deferred) => deferred,
        }
    }
}

impl Debug for Rendered {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Rendered::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Rendered::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// Callables supplied by the caller of an unbound template.
#[derive(Default, Clone)]
pub struct Bindings {
    /// Falls back to the configured escape function.
    pub escape: Option<EscapeFn>,
    pub include: Option<IncludeFn>,
}

/// A compiled template.
///
/// Configuration is fixed at compile time. Each call runs the compiled
/// program against a fresh data context.
pub struct Template {
    sequence: InstructionSequence,
    program: Box<dyn Program>,
    options: Options,
    files: Vec<(SmolStr, Arc<Template>)>,
    engine: Engine,
    reporter: ErrorReporter,
}

impl Template {
    pub fn compile(text: &str, options: Options, engine: Engine) -> Result<Self, Error> {
        options.validate().map_err(Error::new)?;

        let sequence = assemble(text, &options).map_err(|e| {
            let line = e.line();
            Error::at_line(SyntaxError::Lexer(e), text, line)
        })?;

        if options.debug {
            log::info!(target: "etch::debug", "{sequence}");
        }

        let program = engine
            .backend()
            .compile(&sequence, &options)
            .map_err(|e| match e.line() {
                Some(line) => Error::at_line(e, &sequence.source_text, line),
                None => Error::new(e),
            })?;

        let files = options
            .files
            .iter()
            .map(|(name, text)| {
                let mut child = options.clone();
                child.files.clear();
                child.cache = false;
                Template::compile(text, child, engine.clone()).map(|t| (name.clone(), Arc::new(t)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "compiled {} with {} instructions",
            options
                .filename
                .as_ref()
                .map_or_else(|| "inline template".to_string(), |f| f.display().to_string()),
            sequence.len()
        );

        let reporter = ErrorReporter::new(&sequence, &options);
        Ok(Self {
            sequence,
            program,
            options,
            files,
            engine,
            reporter,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_async(&self) -> bool {
        self.sequence.async_mode
    }

    /// The generated program in textual form.
    pub fn source(&self) -> String {
        self.sequence.to_string()
    }

    /// Renders with `include` bound to this template's engine, unless the
    /// template was compiled for the client.
    pub fn call(&self, data: impl Into<Value>) -> Result<Rendered, Error> {
        self.call_nested(context(data.into()), 0)
    }

    fn call_nested(&self, data: Value, depth: usize) -> Result<Rendered, Error> {
        let include = (!self.options.client).then(|| self.include_fn(&data, depth));

        self.call_with(
            data,
            Bindings {
                escape: None,
                include,
            },
        )
    }

    /// Renders with caller-supplied callables. Nothing is bound implicitly.
    pub fn call_with(&self, data: impl Into<Value>, bindings: Bindings) -> Result<Rendered, Error> {
        let data = context(data.into());
        let escape = bindings.escape.unwrap_or_else(|| self.options.escape.clone());
        let files = self
            .files
            .iter()
            .map(|(name, template)| (name.clone(), file_binding(name, template, &data)))
            .collect();

        let execution = self.program.execute(Invocation {
            data,
            escape: escape.clone(),
            include: bindings.include,
            bindings: files,
        });
        let reporter = self.reporter.clone();

        if !self.sequence.async_mode {
            let output = execution
                .now_or_never()
                .ok_or_else(|| Error::new(ConfigError::AsyncTemplate))?
                .map_err(|Failure { error, line }| reporter.rethrow(error, line))?;
            return Ok(Rendered::Text(output.into_text().unwrap_or_default()));
        }

        Ok(Rendered::Deferred(
            async move {
                let output = execution
                    .await
                    .map_err(|Failure { error, line }| reporter.rethrow(error, line))?;
                join(output, escape, reporter).await
            }
            .boxed_local(),
        ))
    }

    pub fn render(&self, data: impl Into<Value>) -> Result<String, Error> {
        if self.sequence.async_mode {
            return Err(Error::new(ConfigError::AsyncTemplate));
        }

        match self.call(data)? {
            Rendered::Text(text) => Ok(text),
            Rendered::Deferred(_) => Err(Error::new(ConfigError::AsyncTemplate)),
        }
    }

    pub fn render_async(
        &self,
        data: impl Into<Value>,
    ) -> LocalBoxFuture<'static, Result<String, Error>> {
        match self.call(data) {
            Ok(rendered) => rendered.into_future(),
            Err(e) => future::ready(Err(e)).boxed_local(),
        }
    }

    fn include_fn(&self, data: &Value, depth: usize) -> IncludeFn {
        let engine = self.engine.clone();
        let options = self.options.clone();
        let data = data.clone();

        Rc::new(move |path: &str, overrides: Option<Value>| {
            if depth >= MAX_INCLUDE_DEPTH {
                return Err(EvalError::Range("Maximum include depth exceeded".to_string()));
            }
            let child = engine.include_file(path, &options)?;
            into_value(child.call_nested(data.merged_with(overrides.as_ref()), depth + 1)?)
        })
    }
}

impl Debug for Template {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("sequence", &self.sequence)
            .field("program", &self.program)
            .field("options", &self.options)
            .field(
                "files",
                &self.files.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

fn context(data: Value) -> Value {
    if data.is_nullish() {
        Value::object(Object::new())
    } else {
        data
    }
}

fn file_binding(name: &str, template: &Arc<Template>, data: &Value) -> Value {
    let template = Arc::clone(template);
    let data = data.clone();

    Value::function(name, move |args| {
        into_value(template.call(data.merged_with(args.first()))?)
    })
}

fn into_value(rendered: Rendered) -> Result<Value, EvalError> {
    Ok(match rendered {
        Rendered::Text(text) => Value::from(text),
        Rendered::Deferred(deferred) => Value::pending(deferred.map(|result| {
            result.map(Value::from).map_err(EvalError::from)
        })),
    })
}

/// Waits for every pending fragment and concatenates the output in
/// emission order.
async fn join(
    output: OutputBuffer,
    escape: EscapeFn,
    reporter: ErrorReporter,
) -> Result<String, Error> {
    let fragments = output.into_fragments().into_iter().map(|fragment| {
        let reporter = &reporter;
        let escape = &escape;
        async move {
            match fragment {
                Fragment::Text(text) => Ok(text),
                Fragment::Pending {
                    value,
                    escape: escaped,
                    line,
                } => {
                    let value = settle(value).await.map_err(|e| reporter.rethrow(e, line))?;
                    if value.is_nullish() {
                        return Ok(String::new());
                    }

                    let text = value.to_string();
                    Ok(if escaped { escape(&text) } else { text })
                }
            }
        }
    });

    let parts = future::try_join_all(fragments).await?;
    Ok(parts.concat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, fs::MemoryFileSystem};
    use futures::executor::block_on;
    use serde_json::json;

    fn compile(text: &str, options: Options) -> Template {
        Template::compile(text, options, Engine::isolated(MemoryFileSystem::new())).unwrap()
    }

    #[test]
    fn test_output_buffer_merges_text() {
        let mut output = OutputBuffer::new();
        output.push_str("a");
        output.push_str("");
        output.push_str("b");

        assert_eq!(output.fragments.len(), 1);
        assert!(!output.has_pending());
        assert_eq!(output.into_text(), Some("ab".to_string()));
    }

    #[test]
    fn test_output_buffer_with_pending() {
        let mut output = OutputBuffer::new();
        output.push_str("a");
        let Value::Pending(pending) = Value::pending(async { Ok(Value::Null) }) else {
            unreachable!()
        };
        output.push_pending(pending, true, 1);
        output.push_str("b");

        assert!(output.has_pending());
        assert_eq!(output.into_text(), None);
    }

    #[test]
    fn test_render() {
        let template = compile("Hello, <%= name %>!", Options::default());
        assert_eq!(template.render(json!({"name": "World"})), Ok("Hello, World!".to_string()));
    }

    #[test]
    fn test_render_nullish_data() {
        let template = compile("<%= typeof locals %>", Options::default());
        assert_eq!(template.render(Value::Undefined), Ok("object".to_string()));
    }

    #[test]
    fn test_render_is_repeatable() {
        let template = compile("<% var n = (n || 0) + 1 %><%= n %>", Options::default());
        assert_eq!(template.render(json!({})), Ok("1".to_string()));
        assert_eq!(template.render(json!({})), Ok("1".to_string()));
    }

    #[test]
    fn test_render_async_template_synchronously_fails() {
        let template = compile("x", Options::default().with_async(true));
        let error = template.render(json!({})).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Configuration);
        assert_eq!(block_on(template.render_async(json!({}))), Ok("x".to_string()));
    }

    #[test]
    fn test_async_fragments_keep_order() {
        let template = compile(
            "<%= await a %>-<%- await b %>-<%= await c %>",
            Options::default().with_async(true),
        );
        let data = Value::from(json!({}));
        if let Value::Object(object) = &data {
            let mut object = object.borrow_mut();
            object.set("a", Value::pending(async { Ok(Value::from("<1>")) }));
            object.set("b", Value::pending(async { Ok(Value::from("<2>")) }));
            object.set("c", Value::pending(async { Ok(Value::Null) }));
        }

        assert_eq!(
            block_on(template.render_async(data)),
            Ok("&lt;1&gt;-<2>-".to_string())
        );
    }

    #[test]
    fn test_async_failure_is_annotated() {
        let template = compile(
            "first\n<%= await fail %>",
            Options::default().with_async(true),
        );
        let data = Value::from(json!({}));
        if let Value::Object(object) = &data {
            object.borrow_mut().set(
                "fail",
                Value::pending(async { Err(EvalError::runtime("boom")) }),
            );
        }

        let error = block_on(template.render_async(data)).unwrap_err();
        assert_eq!(error.to_string(), "ejs:2\n    1| first\n >> 2| <%= await fail %>\n\nboom");
    }

    #[test]
    fn test_call_with_custom_escape() {
        let template = compile("<%= name %>", Options::default().with_client(true));
        let escape: EscapeFn = Arc::new(|s: &str| s.to_uppercase());
        let rendered = template
            .call_with(
                json!({"name": "x"}),
                Bindings {
                    escape: Some(escape),
                    include: None,
                },
            )
            .unwrap();

        assert!(matches!(rendered, Rendered::Text(text) if text == "X"));
    }

    #[test]
    fn test_call_with_custom_include() {
        let template = compile("[<%- include('child', {n: 2}) %>]", Options::default());
        let include: IncludeFn = Rc::new(|path: &str, data: Option<Value>| {
            let n = data.and_then(|data| data.property("n")).unwrap_or_default();
            Ok(Value::from(format!("{path}:{n}")))
        });
        let rendered = template
            .call_with(
                json!({}),
                Bindings {
                    escape: None,
                    include: Some(include),
                },
            )
            .unwrap();

        assert!(matches!(rendered, Rendered::Text(text) if text == "[child:2]"));
    }

    #[test]
    fn test_files_bindings() {
        let options = Options::default().with_file("greet", "Hi <%= name %>");
        let template = compile("<%- greet() %>, <%- greet({name: 'B'}) %>", options);

        assert_eq!(template.render(json!({"name": "A"})), Ok("Hi A, Hi B".to_string()));
    }

    #[test]
    fn test_source_lists_instructions() {
        let template = compile("a<%= b %>", Options::default());
        let source = template.source();

        assert!(source.contains("\"a\""));
        assert!(source.contains('b'));
    }

    #[test]
    fn test_compile_reports_unmatched_tag_line() {
        let error = Template::compile(
            "one\n<%= oops",
            Options::default(),
            Engine::isolated(MemoryFileSystem::new()),
        )
        .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Syntax);
        assert_eq!(error.source_code, "one\n<%= oops");
    }

    #[test]
    fn test_compile_rejects_invalid_identifier() {
        let error = Template::compile(
            "x",
            Options::default().with_locals_name("not valid"),
            Engine::isolated(MemoryFileSystem::new()),
        )
        .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Syntax);
    }
}
