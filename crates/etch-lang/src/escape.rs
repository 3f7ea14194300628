/// Default escape function: encodes `&`, `<`, `>`, `"` and `'`.
pub fn escape_xml(markup: &str) -> String {
    let mut escaped = String::with_capacity(markup.len());

    for c in markup.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }

    escaped
}
