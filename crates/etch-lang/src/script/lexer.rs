use smol_str::SmolStr;

use super::{
    error::ParseError,
    parser::MAX_NESTING_DEPTH,
    token::{Keyword, Punct, TemplatePart, Token, TokenKind},
};

/// Tokenizes one code fragment of a template.
///
/// `line` is the template line the fragment starts on; it advances with
/// every line break so tokens report the line they appear on.
pub fn tokenize(code: &str, line: u32) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer::new(code, line);
    let tokens = lexer.tokens(false)?;
    Ok(tokens)
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    newline_before: bool,
    templates: usize,
}

impl Lexer {
    fn new(code: &str, line: u32) -> Self {
        Self {
            chars: code.chars().collect(),
            pos: 0,
            line,
            newline_before: false,
            templates: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, text: &str) -> bool {
        text.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Lexes until the end of input, or until the `}` closing a template
    /// literal substitution when `in_template` is set.
    fn tokens(&mut self, in_template: bool) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        let mut depth = 0usize;

        loop {
            self.skip_trivia()?;
            let Some(c) = self.peek() else {
                if in_template {
                    return Err(ParseError::UnterminatedString { line: self.line });
                }
                return Ok(tokens);
            };

            if in_template && c == '}' && depth == 0 {
                self.bump();
                return Ok(tokens);
            }

            let line = self.line;
            let kind = match c {
                '0'..='9' => self.number()?,
                '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.number()?,
                '"' | '\'' => self.string(c)?,
                '`' => self.template()?,
                c if is_ident_start(c) => self.ident(),
                _ => {
                    let kind = self.punct()?;
                    match kind {
                        TokenKind::Punct(Punct::LBrace) => depth += 1,
                        TokenKind::Punct(Punct::RBrace) => depth = depth.saturating_sub(1),
                        _ => {}
                    }
                    kind
                }
            };

            tokens.push(Token::new(kind, line, self.newline_before));
            self.newline_before = false;
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        while let Some(c) = self.peek() {
            if c == '\n' {
                self.newline_before = true;
                self.bump();
            } else if c.is_whitespace() {
                self.bump();
            } else if self.starts_with("//") {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.bump();
                }
            } else if self.starts_with("/*") {
                let line = self.line;
                self.pos += 2;
                loop {
                    if self.starts_with("*/") {
                        self.pos += 2;
                        break;
                    }
                    match self.bump() {
                        Some('\n') => self.newline_before = true,
                        Some(_) => {}
                        None => return Err(ParseError::UnexpectedEof { line }),
                    }
                }
            } else {
                break;
            }
        }

        Ok(())
    }

    fn number(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;

        if self.starts_with("0x") || self.starts_with("0X") {
            self.pos += 2;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let literal = self.chars[start..self.pos].iter().collect::<String>();
            return i64::from_str_radix(&literal[2..], 16)
                .map(|n| TokenKind::Number(n as f64))
                .map_err(|_| ParseError::InvalidNumber {
                    literal,
                    line: self.line,
                });
        }

        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.' || c == '_')
        {
            self.pos += 1;
        }
        if self.peek().is_some_and(|c| c == 'e' || c == 'E') {
            self.pos += 1;
            if self.peek().is_some_and(|c| c == '+' || c == '-') {
                self.pos += 1;
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }

        let literal = self.chars[start..self.pos].iter().collect::<String>();
        literal
            .replace('_', "")
            .parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| ParseError::InvalidNumber {
                literal,
                line: self.line,
            })
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, ParseError> {
        let line = self.line;
        self.bump();
        let mut value = String::new();

        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(TokenKind::String(value)),
                Some('\\') => self.escape(&mut value, line)?,
                Some('\n') | None => return Err(ParseError::UnterminatedString { line }),
                Some(c) => value.push(c),
            }
        }
    }

    fn template(&mut self) -> Result<TokenKind, ParseError> {
        let line = self.line;
        self.bump();
        let mut parts = Vec::new();
        let mut text = String::new();

        loop {
            match self.bump() {
                Some('`') => break,
                Some('\\') => self.escape(&mut text, line)?,
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    if self.templates >= MAX_NESTING_DEPTH {
                        return Err(ParseError::NestingTooDeep { line: self.line });
                    }
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    let saved = self.newline_before;
                    self.templates += 1;
                    let code = self.tokens(true);
                    self.templates -= 1;
                    let code = code?;
                    self.newline_before = saved;
                    parts.push(TemplatePart::Code(code));
                }
                Some(c) => text.push(c),
                None => return Err(ParseError::UnterminatedString { line }),
            }
        }

        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        Ok(TokenKind::Template(parts))
    }

    fn escape(&mut self, value: &mut String, line: u32) -> Result<(), ParseError> {
        match self.bump() {
            Some('n') => value.push('\n'),
            Some('r') => value.push('\r'),
            Some('t') => value.push('\t'),
            Some('b') => value.push('\u{8}'),
            Some('f') => value.push('\u{c}'),
            Some('v') => value.push('\u{b}'),
            Some('0') => value.push('\0'),
            Some('\n') => {}
            Some('u') => {
                let digits = if self.peek() == Some('{') {
                    self.bump();
                    let mut digits = String::new();
                    while let Some(c) = self.bump() {
                        if c == '}' {
                            break;
                        }
                        digits.push(c);
                    }
                    digits
                } else {
                    (0..4).filter_map(|_| self.bump()).collect::<String>()
                };
                let c = u32::from_str_radix(&digits, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or(ParseError::InvalidCharacter { found: 'u', line })?;
                value.push(c);
            }
            Some('x') => {
                let digits = (0..2).filter_map(|_| self.bump()).collect::<String>();
                let c = u32::from_str_radix(&digits, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or(ParseError::InvalidCharacter { found: 'x', line })?;
                value.push(c);
            }
            Some(c) => value.push(c),
            None => return Err(ParseError::UnterminatedString { line }),
        }

        Ok(())
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_part) {
            self.pos += 1;
        }
        let ident = self.chars[start..self.pos].iter().collect::<String>();

        match Keyword::from_ident(&ident) {
            Some(keyword) => TokenKind::Keyword(keyword),
            None => TokenKind::Ident(SmolStr::new(ident)),
        }
    }

    fn punct(&mut self) -> Result<TokenKind, ParseError> {
        for (text, punct) in Punct::ALL {
            if !self.starts_with(text) {
                continue;
            }
            // `a?.5:b` is a conditional, not optional chaining.
            if punct == Punct::QuestionDot && self.peek_at(2).is_some_and(|c| c.is_ascii_digit())
            {
                continue;
            }
            self.pos += text.len();
            return Ok(TokenKind::Punct(punct));
        }

        Err(ParseError::InvalidCharacter {
            found: self.peek().unwrap_or_default(),
            line: self.line,
        })
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn kinds(code: &str) -> Vec<TokenKind> {
        tokenize(code, 1)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[rstest]
    #[case("a", vec![TokenKind::Ident("a".into())])]
    #[case("1.5", vec![TokenKind::Number(1.5)])]
    #[case(".5", vec![TokenKind::Number(0.5)])]
    #[case("0xff", vec![TokenKind::Number(255.0)])]
    #[case("1e3", vec![TokenKind::Number(1000.0)])]
    #[case("'a\\'b'", vec![TokenKind::String("a'b".to_string())])]
    #[case("\"\\u0041\\n\"", vec![TokenKind::String("A\n".to_string())])]
    #[case(
        "x === y",
        vec![
            TokenKind::Ident("x".into()),
            TokenKind::Punct(Punct::EqEqEq),
            TokenKind::Ident("y".into()),
        ]
    )]
    #[case(
        "a?.b ?? c",
        vec![
            TokenKind::Ident("a".into()),
            TokenKind::Punct(Punct::QuestionDot),
            TokenKind::Ident("b".into()),
            TokenKind::Punct(Punct::Nullish),
            TokenKind::Ident("c".into()),
        ]
    )]
    #[case(
        "a?.5:1",
        vec![
            TokenKind::Ident("a".into()),
            TokenKind::Punct(Punct::Question),
            TokenKind::Number(0.5),
            TokenKind::Punct(Punct::Colon),
            TokenKind::Number(1.0),
        ]
    )]
    #[case(
        "if (x) // note\n{ }",
        vec![
            TokenKind::Keyword(Keyword::If),
            TokenKind::Punct(Punct::LParen),
            TokenKind::Ident("x".into()),
            TokenKind::Punct(Punct::RParen),
            TokenKind::Punct(Punct::LBrace),
            TokenKind::Punct(Punct::RBrace),
        ]
    )]
    #[case("/* block */ x", vec![TokenKind::Ident("x".into())])]
    fn test_tokenize(#[case] code: &str, #[case] expected: Vec<TokenKind>) {
        assert_eq!(kinds(code), expected);
    }

    #[test]
    fn test_tokenize_template_literal() {
        assert_eq!(
            kinds("`Hi ${ user.name }!`"),
            vec![TokenKind::Template(vec![
                TemplatePart::Text("Hi ".to_string()),
                TemplatePart::Code(vec![
                    Token::new(TokenKind::Ident("user".into()), 1, false),
                    Token::new(TokenKind::Punct(Punct::Dot), 1, false),
                    Token::new(TokenKind::Ident("name".into()), 1, false),
                ]),
                TemplatePart::Text("!".to_string()),
            ])]
        );
    }

    #[test]
    fn test_tokenize_tracks_lines_and_newlines() {
        let tokens = tokenize("a\n  b c", 3).unwrap();
        assert_eq!(
            tokens
                .iter()
                .map(|t| (t.line, t.newline_before))
                .collect::<Vec<_>>(),
            vec![(3, false), (4, true), (4, false)]
        );
    }

    #[rstest]
    #[case("'open", ParseError::UnterminatedString { line: 1 })]
    #[case("a # b", ParseError::InvalidCharacter { found: '#', line: 1 })]
    #[case("`x ${y", ParseError::UnterminatedString { line: 1 })]
    fn test_tokenize_errors(#[case] code: &str, #[case] expected: ParseError) {
        assert_eq!(tokenize(code, 1), Err(expected));
    }
}
