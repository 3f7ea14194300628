//! The built-in execution backend.
//!
//! Template code is a subset of JavaScript: declarations, control flow,
//! functions and closures, object and array literals, and the common string,
//! array and number methods. The instruction sequence is lowered into one
//! token stream (literal text and output tags become tokens of their own) and
//! parsed into a single program, so control flow may span tags:
//!
//! ```text
//! <% if (user) { %>Hello, <%= user.name %>!<% } %>
//! ```
pub mod ast;
pub mod builtin;
pub mod env;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod method;
pub mod parser;
pub mod token;
pub mod value;

use std::{cell::RefCell, rc::Rc, sync::Arc};

use futures::future::{FutureExt, LocalBoxFuture};
use smol_str::SmolStr;

use crate::{
    assembler::instruction::{Instruction, InstructionSequence},
    error::SyntaxError,
    options::Options,
    render::{Backend, Failure, Invocation, OutputBuffer, Program},
};
use ast::Stmt;
use env::{Env, SharedEnv};
use error::ParseError;
use eval::Interpreter;
use parser::Parser;
use token::{Token, TokenKind};
use value::Value;

/// Compiles templates into [`ScriptProgram`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptBackend;

impl Backend for ScriptBackend {
    fn compile(
        &self,
        sequence: &InstructionSequence,
        options: &Options,
    ) -> Result<Box<dyn Program>, SyntaxError> {
        let program = lower(sequence)
            .and_then(|tokens| Parser::new(tokens).parse_program())
            .map_err(|source| SyntaxError::Program {
                source,
                filename: options
                    .filename
                    .as_ref()
                    .map(|filename| filename.display().to_string())
                    .unwrap_or_else(|| options.dialect.to_string()),
            })?;

        Ok(Box::new(ScriptProgram {
            program: program.into(),
            locals_name: options.locals_name.clone(),
            destructured_locals: options.destructured_locals.clone(),
            output_function_name: options.output_function_name.clone(),
            expose_locals: options.exposes_locals(),
            strict: options.strict,
            async_mode: sequence.async_mode,
        }))
    }
}

/// Turns the instruction sequence into a single token stream.
fn lower(sequence: &InstructionSequence) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut line = 1;

    for instruction in sequence.iter() {
        match instruction {
            Instruction::EmitLiteral(text) => {
                tokens.push(Token::new(TokenKind::Literal(text.clone()), line, true))
            }
            Instruction::EmitEscaped(code) | Instruction::EmitRaw(code) => {
                let escape = matches!(instruction, Instruction::EmitEscaped(_));
                tokens.push(Token::new(TokenKind::EmitOpen { escape }, line, true));
                tokens.extend(lexer::tokenize(code, line)?);
                tokens.push(Token::new(TokenKind::EmitClose, line, false));
            }
            Instruction::Execute(code) => {
                let mut code = lexer::tokenize(code, line)?;
                if let Some(first) = code.first_mut() {
                    first.newline_before = true;
                }
                tokens.extend(code);
            }
            Instruction::SetLine(n) => {
                line = *n;
                tokens.push(Token::new(TokenKind::Line(line), line, true));
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug)]
pub struct ScriptProgram {
    program: Arc<[Stmt]>,
    locals_name: SmolStr,
    destructured_locals: Vec<SmolStr>,
    output_function_name: Option<SmolStr>,
    expose_locals: bool,
    strict: bool,
    async_mode: bool,
}

impl ScriptProgram {
    fn scopes(&self, invocation: Invocation, output: &Rc<RefCell<OutputBuffer>>) -> Scopes {
        let Invocation {
            data,
            escape,
            include,
            bindings,
        } = invocation;

        let globals = Env::root();
        builtin::install(&mut globals.borrow_mut());

        let root = Env::function(&globals);
        {
            let mut scope = root.borrow_mut();
            scope.define(self.locals_name.clone(), data.clone());

            scope.define(
                "escapeFn",
                Value::function("escapeFn", move |args| {
                    let text = args.first().map(Value::to_string).unwrap_or_default();
                    Ok(Value::from(escape(&text)))
                }),
            );

            scope.define(
                "include",
                match include {
                    Some(include) => Value::function("include", move |args| {
                        let path = args.first().map(Value::to_string).unwrap_or_default();
                        include(&path, args.get(1).cloned())
                    }),
                    None => Value::Undefined,
                },
            );

            for name in &self.destructured_locals {
                scope.define(name.clone(), data.property(name).unwrap_or_default());
            }

            for (name, value) in bindings {
                scope.define(name, value);
            }

            if let Some(name) = &self.output_function_name {
                let output = Rc::clone(output);
                scope.define(
                    name.clone(),
                    Value::function(name, move |args| {
                        if let Some(value) = args.first().filter(|value| !value.is_nullish()) {
                            output.borrow_mut().push_str(&value.to_string());
                        }
                        Ok(Value::Undefined)
                    }),
                );
            }
        }

        let scope = match &data {
            Value::Object(_) if self.expose_locals => Env::with_object(&root, data),
            _ => Rc::clone(&root),
        };
        let program = Env::block(&scope);

        Scopes {
            globals,
            root,
            scope,
            program,
        }
    }
}

impl Program for ScriptProgram {
    fn execute(
        &self,
        invocation: Invocation,
    ) -> LocalBoxFuture<'static, Result<OutputBuffer, Failure>> {
        let escape = invocation.escape.clone();
        let output = Rc::new(RefCell::new(OutputBuffer::new()));
        let scopes = self.scopes(invocation, &output);
        let program = Arc::clone(&self.program);
        let mut interpreter =
            Interpreter::new(Rc::clone(&output), escape, self.strict, self.async_mode);

        async move {
            let result = interpreter.run(&program, &scopes.program).await;
            let line = interpreter.line();
            drop(interpreter);
            drop(scopes);

            result.map_err(|error| Failure { error, line })?;
            Ok(output.take())
        }
        .boxed_local()
    }
}

/// The scope chain of one run.
struct Scopes {
    globals: SharedEnv,
    root: SharedEnv,
    scope: SharedEnv,
    program: SharedEnv,
}

impl Drop for Scopes {
    fn drop(&mut self) {
        // Closures hold their defining scope; clearing breaks the cycles.
        for env in [&self.program, &self.scope, &self.root, &self.globals] {
            if let Ok(mut env) = env.try_borrow_mut() {
                env.clear();
            }
        }
    }
}
