use std::fmt::{self, Display, Formatter};

use crate::options::Delimiters;

/// Tag punctuation recognised by the lexer.
///
/// The declaration order is the match priority: at any given offset the first
/// marker whose text matches wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// `<%%`
    LiteralOpen,
    /// `%%>`
    LiteralClose,
    /// `<%=`
    EscapedOpen,
    /// `<%-`
    RawOpen,
    /// `<%#`
    CommentOpen,
    /// `<%_`
    SlurpOpen,
    /// `<%`
    PlainOpen,
    /// `%>`
    PlainClose,
    /// `-%>`
    TrimClose,
    /// `_%>`
    SlurpClose,
}

impl Marker {
    pub const PRIORITY: [Marker; 10] = [
        Marker::LiteralOpen,
        Marker::LiteralClose,
        Marker::EscapedOpen,
        Marker::RawOpen,
        Marker::CommentOpen,
        Marker::SlurpOpen,
        Marker::PlainOpen,
        Marker::PlainClose,
        Marker::TrimClose,
        Marker::SlurpClose,
    ];

    /// Builds the concrete marker text for a delimiter set.
    pub fn text(&self, delimiters: &Delimiters) -> String {
        let Delimiters { open, inner, close } = delimiters;

        match self {
            Marker::LiteralOpen => format!("{open}{inner}{inner}"),
            Marker::LiteralClose => format!("{inner}{inner}{close}"),
            Marker::EscapedOpen => format!("{open}{inner}="),
            Marker::RawOpen => format!("{open}{inner}-"),
            Marker::CommentOpen => format!("{open}{inner}#"),
            Marker::SlurpOpen => format!("{open}{inner}_"),
            Marker::PlainOpen => format!("{open}{inner}"),
            Marker::PlainClose => format!("{inner}{close}"),
            Marker::TrimClose => format!("-{inner}{close}"),
            Marker::SlurpClose => format!("_{inner}{close}"),
        }
    }

    /// Opening markers that start a scripting tag and therefore need a close.
    pub fn is_tag_open(&self) -> bool {
        matches!(
            self,
            Marker::EscapedOpen
                | Marker::RawOpen
                | Marker::CommentOpen
                | Marker::SlurpOpen
                | Marker::PlainOpen
        )
    }

    pub fn is_close(&self) -> bool {
        matches!(
            self,
            Marker::PlainClose | Marker::TrimClose | Marker::SlurpClose
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    Text(&'a str),
    Marker(Marker, &'a str),
}

impl<'a> Token<'a> {
    pub fn as_str(&self) -> &'a str {
        match self {
            Token::Text(text) => text,
            Token::Marker(_, text) => text,
        }
    }

    pub fn marker(&self) -> Option<Marker> {
        match self {
            Token::Marker(marker, _) => Some(*marker),
            Token::Text(_) => None,
        }
    }

    pub fn newlines(&self) -> u32 {
        self.as_str().matches('\n').count() as u32
    }
}

impl Display for Token<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}
