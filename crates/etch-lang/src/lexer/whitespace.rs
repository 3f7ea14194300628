//! Whitespace preprocessing applied to template text before tokenizing.
use itertools::Itertools;

const HORIZONTAL: [char; 2] = [' ', '\t'];

/// Collapses every line-break run to a single `\n`, strips leading and
/// trailing whitespace from each line and drops lines left empty.
pub fn compact(text: &str) -> String {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .join("\n")
}

/// Removes spaces and tabs directly before every `slurp_open` marker and
/// directly after every `slurp_close` marker.
pub fn slurp(text: &str, slurp_open: &str, slurp_close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while !rest.is_empty() {
        if rest.starts_with(slurp_open) {
            let trimmed = out.trim_end_matches(HORIZONTAL).len();
            out.truncate(trimmed);
            out.push_str(slurp_open);
            rest = &rest[slurp_open.len()..];
        } else if rest.starts_with(slurp_close) {
            out.push_str(slurp_close);
            rest = rest[slurp_close.len()..].trim_start_matches(HORIZONTAL);
        } else if let Some(c) = rest.chars().next() {
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }

    out
}
