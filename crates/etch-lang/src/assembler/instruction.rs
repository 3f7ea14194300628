//! The intermediate program produced by the assembler.
//!
//! An [`InstructionSequence`] is an ordered list of [`Instruction`]s plus the
//! metadata a backend needs to execute it. It is built once per compile and
//! never mutated afterwards.
use std::{
    fmt::{self, Display, Formatter},
    path::PathBuf,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Append literal template text.
    EmitLiteral(String),
    /// Evaluate the code as an expression and append its escaped value.
    EmitEscaped(String),
    /// Evaluate the code as an expression and append its value unescaped.
    EmitRaw(String),
    /// Execute the code as statements.
    Execute(String),
    /// Record the current template line for diagnostics.
    SetLine(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionSequence {
    pub instructions: Vec<Instruction>,
    pub compile_debug: bool,
    pub async_mode: bool,
    pub filename: Option<PathBuf>,
    /// Template text after whitespace preprocessing, used for error windows.
    pub source_text: String,
}

impl InstructionSequence {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter()
    }
}

/// Escapes literal text for the quoted form used by [`Display`].
pub fn quote_literal(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '"' => quoted.push_str("\\\""),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::EmitLiteral(text) => write!(f, "emit_literal {}", quote_literal(text)),
            Instruction::EmitEscaped(code) => write!(f, "emit_escaped {}", code.trim_end()),
            Instruction::EmitRaw(code) => write!(f, "emit_raw {}", code.trim_end()),
            Instruction::Execute(code) => write!(f, "execute {}", code.trim_end()),
            Instruction::SetLine(line) => write!(f, "line {line}"),
        }
    }
}

impl Display for InstructionSequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "; filename={} async={} compile_debug={}",
            self.filename
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.async_mode,
            self.compile_debug
        )?;
        for instruction in &self.instructions {
            writeln!(f, "{instruction}")?;
        }
        Ok(())
    }
}
