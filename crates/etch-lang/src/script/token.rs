use std::fmt::{self, Display, Formatter};

use itertools::Itertools;
use smol_str::SmolStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Await,
    Break,
    Const,
    Continue,
    Else,
    False,
    For,
    Function,
    If,
    In,
    Instanceof,
    Let,
    New,
    Null,
    Return,
    Throw,
    True,
    Typeof,
    Var,
    While,
}

impl Keyword {
    pub fn from_ident(ident: &str) -> Option<Self> {
        let keyword = match ident {
            "await" => Keyword::Await,
            "break" => Keyword::Break,
            "const" => Keyword::Const,
            "continue" => Keyword::Continue,
            "else" => Keyword::Else,
            "false" => Keyword::False,
            "for" => Keyword::For,
            "function" => Keyword::Function,
            "if" => Keyword::If,
            "in" => Keyword::In,
            "instanceof" => Keyword::Instanceof,
            "let" => Keyword::Let,
            "new" => Keyword::New,
            "null" => Keyword::Null,
            "return" => Keyword::Return,
            "throw" => Keyword::Throw,
            "true" => Keyword::True,
            "typeof" => Keyword::Typeof,
            "var" => Keyword::Var,
            "while" => Keyword::While,
            _ => return None,
        };
        Some(keyword)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::Await => "await",
            Keyword::Break => "break",
            Keyword::Const => "const",
            Keyword::Continue => "continue",
            Keyword::Else => "else",
            Keyword::False => "false",
            Keyword::For => "for",
            Keyword::Function => "function",
            Keyword::If => "if",
            Keyword::In => "in",
            Keyword::Instanceof => "instanceof",
            Keyword::Let => "let",
            Keyword::New => "new",
            Keyword::Null => "null",
            Keyword::Return => "return",
            Keyword::Throw => "throw",
            Keyword::True => "true",
            Keyword::Typeof => "typeof",
            Keyword::Var => "var",
            Keyword::While => "while",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    And,
    AndAssign,
    Arrow,
    Assign,
    Bang,
    Colon,
    Comma,
    Dot,
    Ellipsis,
    EqEq,
    EqEqEq,
    Gt,
    Gte,
    LBrace,
    LBracket,
    LParen,
    Lt,
    Lte,
    Minus,
    MinusAssign,
    MinusMinus,
    NotEq,
    NotEqEq,
    Nullish,
    NullishAssign,
    Or,
    OrAssign,
    Percent,
    PercentAssign,
    Plus,
    PlusAssign,
    PlusPlus,
    Question,
    QuestionDot,
    RBrace,
    RBracket,
    RParen,
    SemiColon,
    Slash,
    SlashAssign,
    Star,
    StarAssign,
    StarStar,
}

impl Punct {
    /// Longest spellings first so the lexer can match greedily.
    pub const ALL: [(&'static str, Punct); 43] = [
        ("===", Punct::EqEqEq),
        ("!==", Punct::NotEqEq),
        ("...", Punct::Ellipsis),
        ("&&=", Punct::AndAssign),
        ("||=", Punct::OrAssign),
        ("??=", Punct::NullishAssign),
        ("=>", Punct::Arrow),
        ("==", Punct::EqEq),
        ("!=", Punct::NotEq),
        ("<=", Punct::Lte),
        (">=", Punct::Gte),
        ("&&", Punct::And),
        ("||", Punct::Or),
        ("??", Punct::Nullish),
        ("?.", Punct::QuestionDot),
        ("++", Punct::PlusPlus),
        ("--", Punct::MinusMinus),
        ("+=", Punct::PlusAssign),
        ("-=", Punct::MinusAssign),
        ("*=", Punct::StarAssign),
        ("/=", Punct::SlashAssign),
        ("%=", Punct::PercentAssign),
        ("**", Punct::StarStar),
        ("=", Punct::Assign),
        ("!", Punct::Bang),
        (":", Punct::Colon),
        (",", Punct::Comma),
        (".", Punct::Dot),
        (">", Punct::Gt),
        ("<", Punct::Lt),
        ("{", Punct::LBrace),
        ("}", Punct::RBrace),
        ("[", Punct::LBracket),
        ("]", Punct::RBracket),
        ("(", Punct::LParen),
        (")", Punct::RParen),
        ("-", Punct::Minus),
        ("+", Punct::Plus),
        ("%", Punct::Percent),
        ("?", Punct::Question),
        (";", Punct::SemiColon),
        ("/", Punct::Slash),
        ("*", Punct::Star),
    ];

    pub fn as_str(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, punct)| punct == self)
            .map(|(text, _)| *text)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Code(Vec<Token>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    String(String),
    Template(Vec<TemplatePart>),
    Ident(SmolStr),
    Keyword(Keyword),
    Punct(Punct),
    /// Literal template text between tags.
    Literal(String),
    /// Start of an output tag.
    EmitOpen { escape: bool },
    EmitClose,
    /// Template line marker.
    Line(u32),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    /// Whether a line break (or an instruction boundary) precedes the token.
    pub newline_before: bool,
}

impl Token {
    pub fn new(kind: TokenKind, line: u32, newline_before: bool) -> Self {
        Self {
            kind,
            line,
            newline_before,
        }
    }

    pub fn is_punct(&self, punct: Punct) -> bool {
        self.kind == TokenKind::Punct(punct)
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }

    /// Template-level tokens always end the statement in progress.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Literal(_)
                | TokenKind::EmitOpen { .. }
                | TokenKind::EmitClose
                | TokenKind::Line(_)
                | TokenKind::Eof
        )
    }
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            TokenKind::Number(n) => write!(f, "{n}"),
            TokenKind::String(s) => write!(f, "{s:?}"),
            TokenKind::Template(parts) => write!(
                f,
                "`{}`",
                parts
                    .iter()
                    .map(|part| match part {
                        TemplatePart::Text(text) => text.clone(),
                        TemplatePart::Code(tokens) => {
                            format!("${{{}}}", tokens.iter().map(|t| &t.kind).join(" "))
                        }
                    })
                    .join("")
            ),
            TokenKind::Ident(ident) => write!(f, "{ident}"),
            TokenKind::Keyword(keyword) => write!(f, "{}", keyword.as_str()),
            TokenKind::Punct(punct) => write!(f, "{}", punct.as_str()),
            TokenKind::Literal(_) => write!(f, "template text"),
            TokenKind::EmitOpen { .. } => write!(f, "output tag"),
            TokenKind::EmitClose => write!(f, "end of output tag"),
            TokenKind::Line(_) => write!(f, "line break"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.kind)
    }
}
