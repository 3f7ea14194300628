pub mod instruction;

use instruction::{Instruction, InstructionSequence};

use crate::{
    lexer::{
        Lexer,
        error::LexerError,
        token::{Marker, Token},
        whitespace,
    },
    options::Options,
};

/// Parse state selected by the most recent marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    None,
    Eval,
    Escaped,
    Raw,
    Comment,
    Literal,
}

/// Drives the tag-mode state machine over a token stream and collects the
/// resulting instructions.
#[derive(Debug)]
pub struct Assembler {
    mode: Mode,
    truncate: bool,
    slurp: bool,
    current_line: u32,
    compile_debug: bool,
    literal_open: String,
    literal_close: String,
    instructions: Vec<Instruction>,
}

impl Assembler {
    pub fn new(options: &Options) -> Self {
        let delimiters = &options.delimiters;

        Self {
            mode: Mode::None,
            truncate: false,
            slurp: false,
            current_line: 1,
            compile_debug: options.compile_debug,
            literal_open: format!("{}{}", delimiters.open, delimiters.inner),
            literal_close: format!("{}{}", delimiters.inner, delimiters.close),
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn scan(&mut self, token: Token<'_>) {
        match token {
            Token::Marker(marker, text) => self.scan_marker(marker, text),
            Token::Text(text) => self.scan_text(text),
        }

        let newlines = token.newlines();
        if self.compile_debug && newlines > 0 {
            self.current_line += newlines;
            self.instructions.push(Instruction::SetLine(self.current_line));
        }
    }

    pub fn finish(self) -> Vec<Instruction> {
        self.instructions
    }

    fn scan_marker(&mut self, marker: Marker, text: &str) {
        match marker {
            Marker::PlainOpen => self.mode = Mode::Eval,
            Marker::SlurpOpen => {
                self.mode = Mode::Eval;
                self.slurp = true;
            }
            Marker::EscapedOpen => self.mode = Mode::Escaped,
            Marker::RawOpen => self.mode = Mode::Raw,
            Marker::CommentOpen => self.mode = Mode::Comment,
            Marker::LiteralOpen => {
                self.mode = Mode::Literal;
                self.instructions
                    .push(Instruction::EmitLiteral(self.literal_open.clone()));
            }
            Marker::LiteralClose => {
                self.mode = Mode::Literal;
                self.instructions
                    .push(Instruction::EmitLiteral(self.literal_close.clone()));
            }
            Marker::PlainClose | Marker::TrimClose | Marker::SlurpClose => {
                if self.mode == Mode::Literal {
                    self.add_output(text);
                }
                self.mode = Mode::None;
                self.truncate = marker != Marker::PlainClose || self.slurp;
                self.slurp = false;
            }
        }
    }

    fn scan_text(&mut self, text: &str) {
        match self.mode {
            Mode::None | Mode::Literal => self.add_output(text),
            Mode::Eval => self
                .instructions
                .push(Instruction::Execute(guard_line_comment(text))),
            Mode::Escaped => self.instructions.push(Instruction::EmitEscaped(
                strip_semi(&guard_line_comment(text)),
            )),
            Mode::Raw => self.instructions.push(Instruction::EmitRaw(
                strip_semi(&guard_line_comment(text)),
            )),
            Mode::Comment => {}
        }
    }

    fn add_output(&mut self, text: &str) {
        let text = if self.truncate {
            self.truncate = false;
            strip_leading_linebreak(text)
        } else {
            text
        };

        if !text.is_empty() {
            self.instructions
                .push(Instruction::EmitLiteral(text.to_string()));
        }
    }
}

/// Runs whitespace preprocessing, tokenizing, tag validation and the mode
/// machine over `text`.
pub fn assemble(text: &str, options: &Options) -> Result<InstructionSequence, LexerError> {
    let lexer = Lexer::new(&options.delimiters);
    let text = if options.rm_whitespace {
        whitespace::compact(text)
    } else {
        text.to_string()
    };
    let text = whitespace::slurp(
        &text,
        lexer.marker_text(Marker::SlurpOpen),
        lexer.marker_text(Marker::SlurpClose),
    );

    let tokens = lexer.tokenize(&text);
    Lexer::validate(&tokens)?;

    let mut assembler = Assembler::new(options);
    if let Some(prefix) = &options.prefix {
        assembler.push(Instruction::Execute(prefix.clone()));
    }
    for token in tokens {
        assembler.scan(token);
    }

    Ok(InstructionSequence {
        instructions: assembler.finish(),
        compile_debug: options.compile_debug,
        async_mode: options.async_mode,
        filename: options.filename.clone(),
        source_text: text,
    })
}

fn strip_leading_linebreak(text: &str) -> &str {
    text.strip_prefix("\r\n")
        .or_else(|| text.strip_prefix('\r'))
        .or_else(|| text.strip_prefix('\n'))
        .unwrap_or(text)
}

/// A `//` after the last linebreak would swallow whatever follows the code,
/// so such content gets a trailing linebreak.
fn guard_line_comment(code: &str) -> String {
    let comment = code.rfind("//");
    let newline = code.rfind('\n');

    match (comment, newline) {
        (Some(c), Some(n)) if c > n => format!("{code}\n"),
        (Some(_), None) => format!("{code}\n"),
        _ => code.to_string(),
    }
}

/// Drops a `;` that is followed only by whitespace.
fn strip_semi(code: &str) -> String {
    let trimmed = code.trim_end();

    match trimmed.strip_suffix(';') {
        Some(head) => format!("{head}{}", &code[trimmed.len()..]),
        None => code.to_string(),
    }
}
