pub mod error;
pub mod token;
pub mod whitespace;

use error::LexerError;
use token::{Marker, Token};

use crate::options::Delimiters;

/// Splits template text into literal runs and delimiter markers.
///
/// Markers are matched by scanning the text once; at each offset the
/// candidates are tried in [`Marker::PRIORITY`] order.
#[derive(Debug, Clone)]
pub struct Lexer {
    markers: Vec<(Marker, String)>,
    leaders: Vec<char>,
}

impl Lexer {
    pub fn new(delimiters: &Delimiters) -> Self {
        let markers = Marker::PRIORITY
            .iter()
            .map(|marker| (*marker, marker.text(delimiters)))
            .filter(|(_, text)| !text.is_empty())
            .collect::<Vec<_>>();
        let mut leaders = markers
            .iter()
            .filter_map(|(_, text)| text.chars().next())
            .collect::<Vec<_>>();
        leaders.sort_unstable();
        leaders.dedup();

        Self { markers, leaders }
    }

    pub fn marker_text(&self, marker: Marker) -> &str {
        self.markers
            .iter()
            .find(|(m, _)| *m == marker)
            .map(|(_, text)| text.as_str())
            .unwrap_or_default()
    }

    /// Tokenizes `input`; concatenating the returned tokens reproduces it.
    pub fn tokenize<'a>(&self, input: &'a str) -> Vec<Token<'a>> {
        let mut tokens = Vec::new();
        let mut text_start = 0;
        let mut offset = 0;

        while offset < input.len() {
            let rest = &input[offset..];
            let Some(c) = rest.chars().next() else {
                break;
            };

            if self.leaders.binary_search(&c).is_ok() {
                if let Some((marker, text)) = self.match_marker(rest) {
                    if text_start < offset {
                        tokens.push(Token::Text(&input[text_start..offset]));
                    }
                    let end = offset + text.len();
                    tokens.push(Token::Marker(marker, &input[offset..end]));
                    offset = end;
                    text_start = end;
                    continue;
                }
            }

            offset += c.len_utf8();
        }

        if text_start < input.len() {
            tokens.push(Token::Text(&input[text_start..]));
        }

        tokens
    }

    /// Checks that every scripting open marker is followed, after its content
    /// token, by a close marker.
    pub fn validate(tokens: &[Token<'_>]) -> Result<(), LexerError> {
        let mut line = 1;

        for (index, token) in tokens.iter().enumerate() {
            if token.marker().is_some_and(|marker| marker.is_tag_open()) {
                let closed = tokens
                    .get(index + 2)
                    .and_then(Token::marker)
                    .is_some_and(|marker| marker.is_close());

                if !closed {
                    return Err(LexerError::UnmatchedTag {
                        tag: token.as_str().to_string(),
                        line,
                    });
                }
            }
            line += token.newlines();
        }

        Ok(())
    }

    fn match_marker(&self, rest: &str) -> Option<(Marker, &str)> {
        self.markers
            .iter()
            .find(|(_, text)| rest.starts_with(text.as_str()))
            .map(|(marker, text)| (*marker, text.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn lexer() -> Lexer {
        Lexer::new(&Delimiters::default())
    }

    #[rstest]
    #[case::text_only("Hello", vec![Token::Text("Hello")])]
    #[case::escaped(
        "Hello, <%= name %>!",
        vec![
            Token::Text("Hello, "),
            Token::Marker(Marker::EscapedOpen, "<%="),
            Token::Text(" name "),
            Token::Marker(Marker::PlainClose, "%>"),
            Token::Text("!"),
        ]
    )]
    #[case::trim_close(
        "<% x -%>\n",
        vec![
            Token::Marker(Marker::PlainOpen, "<%"),
            Token::Text(" x "),
            Token::Marker(Marker::TrimClose, "-%>"),
            Token::Text("\n"),
        ]
    )]
    #[case::literal(
        "<%% x %%>",
        vec![
            Token::Marker(Marker::LiteralOpen, "<%%"),
            Token::Text(" x "),
            Token::Marker(Marker::LiteralClose, "%%>"),
        ]
    )]
    #[case::all_opens(
        "<%-a%><%#b%><%_c_%>",
        vec![
            Token::Marker(Marker::RawOpen, "<%-"),
            Token::Text("a"),
            Token::Marker(Marker::PlainClose, "%>"),
            Token::Marker(Marker::CommentOpen, "<%#"),
            Token::Text("b"),
            Token::Marker(Marker::PlainClose, "%>"),
            Token::Marker(Marker::SlurpOpen, "<%_"),
            Token::Text("c"),
            Token::Marker(Marker::SlurpClose, "_%>"),
        ]
    )]
    fn test_tokenize(#[case] input: &str, #[case] expected: Vec<Token<'_>>) {
        assert_eq!(lexer().tokenize(input), expected);
    }

    #[test]
    fn test_tokenize_custom_delimiters() {
        let lexer = Lexer::new(&Delimiters::new("[", "?", "]"));
        assert_eq!(
            lexer.tokenize("a [?= b ?] <%= c %>"),
            vec![
                Token::Text("a "),
                Token::Marker(Marker::EscapedOpen, "[?="),
                Token::Text(" b "),
                Token::Marker(Marker::PlainClose, "?]"),
                Token::Text(" <%= c %>"),
            ]
        );
    }

    #[rstest]
    #[case("")]
    #[case("plain text\nwith lines")]
    #[case("<% if (a) { %>é<% } %>")]
    #[case("50% off > 20%, <%%= tag %%>")]
    fn test_tokenize_reconstructs_input(#[case] input: &str) {
        let joined = lexer()
            .tokenize(input)
            .iter()
            .map(|token| token.as_str())
            .collect::<String>();
        assert_eq!(joined, input);
    }

    #[rstest]
    #[case::closed("<%= a %>", Ok(()))]
    #[case::literal_needs_no_close("<%% a", Ok(()))]
    #[case::unclosed(
        "line\n<%= a",
        Err(LexerError::UnmatchedTag { tag: "<%=".to_string(), line: 2 })
    )]
    #[case::empty_tag(
        "<%=%>",
        Err(LexerError::UnmatchedTag { tag: "<%=".to_string(), line: 1 })
    )]
    #[case::open_instead_of_close(
        "<% a <% b %>",
        Err(LexerError::UnmatchedTag { tag: "<%".to_string(), line: 1 })
    )]
    fn test_validate(#[case] input: &str, #[case] expected: Result<(), LexerError>) {
        assert_eq!(Lexer::validate(&lexer().tokenize(input)), expected);
    }
}
